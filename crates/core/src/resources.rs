//! Translation of engine resource requests into `dsub` flags.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Memory granted when the request does not name any.
pub const DEFAULT_MEM_MB: u64 = 1024;

/// Highest priority Donau accepts.
pub const MAX_PRIORITY: u32 = 9999;

/// Resource request as the workflow engine hands it over.
///
/// Every field is optional and numeric fields are signed so that invalid
/// input can be reported instead of silently wrapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// Total memory in megabytes.
    pub mem_mb: Option<i64>,
    /// Memory per core in megabytes.
    pub mem_mb_per_cpu: Option<i64>,
    /// Target queue.
    pub queue: Option<String>,
    /// Accepted in place of `queue`.
    pub partition: Option<String>,
    /// Wall-time limit in minutes.
    #[serde(alias = "runtime")]
    pub runtime_min: Option<i64>,
    /// Accepted in place of `runtime_min`.
    pub time_min: Option<i64>,
    /// Accounting project.
    pub account: Option<String>,
    /// MPI flavor, e.g. `openmpi`.
    pub mpi: Option<String>,
    /// Node count.
    pub nodes: Option<i64>,
    /// Accepted in place of `nodes`.
    pub replica: Option<i64>,
    /// Request whole nodes.
    pub exclusive: bool,
    /// Free-form `key=value` tag.
    pub tag: Option<String>,
    /// Engine priority; mapped 1:1 onto the scheduler range.
    pub priority: Option<i64>,
}

/// Validated, immutable resources for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Cores, at least 1.
    pub cores: u32,
    /// Memory in megabytes, at least 1.
    pub mem_mb: u64,
    /// Target queue.
    pub queue: Option<String>,
    /// Wall-time limit in seconds.
    pub walltime_secs: Option<u64>,
    /// Accounting project.
    pub account: Option<String>,
    /// MPI flavor.
    pub mpi: Option<String>,
    /// Node count, at least 1.
    pub nodes: Option<u32>,
    /// Whole-node exclusivity.
    pub exclusive: bool,
    /// `key=value` tag.
    pub tag: Option<String>,
    /// Scheduler priority in `1..=MAX_PRIORITY`.
    pub priority: Option<u32>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cores: 1,
            mem_mb: DEFAULT_MEM_MB,
            queue: None,
            walltime_secs: None,
            account: None,
            mpi: None,
            nodes: None,
            exclusive: false,
            tag: None,
            priority: None,
        }
    }
}

impl ResourceSpec {
    /// Validate a request in one pass.
    ///
    /// `cores` is the core count the engine asked for (its thread count).
    /// Resolution rules:
    /// - per-core memory, when present, wins over `mem_mb` and is multiplied
    ///   by the core count
    /// - `runtime_min = 0` and `priority = 0` mean "not supplied"
    /// - priorities above [`MAX_PRIORITY`] are clamped
    /// - empty strings count as absent
    pub fn from_request(req: &ResourceRequest, cores: Option<i64>) -> Result<Self, ConfigError> {
        let cores = match positive("cores", cores)? {
            Some(c) => u32::try_from(c).map_err(|_| ConfigError::OutOfRange {
                field: "cores",
                value: c as i64,
            })?,
            None => 1,
        };

        let total = positive("mem_mb", req.mem_mb)?;
        let per_cpu = positive("mem_mb_per_cpu", req.mem_mb_per_cpu)?;
        let mem_mb = match (per_cpu, total) {
            (Some(per), _) => per.checked_mul(cores as u64).ok_or(ConfigError::OutOfRange {
                field: "mem_mb_per_cpu",
                value: per as i64,
            })?,
            (None, Some(total)) => total,
            (None, None) => DEFAULT_MEM_MB,
        };

        let runtime = non_negative("runtime_min", req.runtime_min)?.filter(|m| *m > 0);
        let time_min = non_negative("time_min", req.time_min)?.filter(|m| *m > 0);
        let walltime_secs = match runtime.or(time_min) {
            Some(min) => Some(min.checked_mul(60).ok_or(ConfigError::OutOfRange {
                field: "runtime_min",
                value: min as i64,
            })?),
            None => None,
        };

        let nodes = positive("nodes", req.nodes)?;
        let replica = positive("replica", req.replica)?;
        let nodes = match nodes.or(replica) {
            Some(n) => Some(u32::try_from(n).map_err(|_| ConfigError::OutOfRange {
                field: "nodes",
                value: n as i64,
            })?),
            None => None,
        };

        let priority = non_negative("priority", req.priority)?
            .filter(|p| *p > 0)
            .map(|p| p.min(MAX_PRIORITY as u64) as u32);

        let tag = present(&req.tag);
        if let Some(t) = &tag {
            match t.split_once('=') {
                Some((key, _)) if !key.trim().is_empty() => {}
                _ => return Err(ConfigError::MalformedTag(t.clone())),
            }
        }

        Ok(Self {
            cores,
            mem_mb,
            queue: present(&req.queue).or_else(|| present(&req.partition)),
            walltime_secs,
            account: present(&req.account),
            mpi: present(&req.mpi),
            nodes,
            exclusive: req.exclusive,
            tag,
            priority,
        })
    }

    /// Map these resources onto scheduler flags.
    ///
    /// Pure: equal inputs always produce equal flag sets, iterated in the
    /// fixed [`Flag`] order.
    pub fn translate(&self) -> SchedulerFlags {
        let mut flags = BTreeMap::new();
        if let Some(q) = &self.queue {
            flags.insert(Flag::Queue, q.clone());
        }
        if let Some(p) = self.priority {
            flags.insert(Flag::Priority, p.to_string());
        }
        if let Some(n) = self.nodes {
            flags.insert(Flag::Nodes, n.to_string());
        }
        if let Some(a) = &self.account {
            flags.insert(Flag::Account, a.clone());
        }
        if let Some(m) = &self.mpi {
            flags.insert(Flag::Mpi, m.clone());
        }
        if self.exclusive {
            flags.insert(Flag::Exclusive, "job".to_string());
        }
        if let Some(t) = &self.tag {
            flags.insert(Flag::Tag, t.clone());
        }
        flags.insert(
            Flag::Resources,
            format!("cpu={},mem={}MB", self.cores, self.mem_mb),
        );
        if let Some(secs) = self.walltime_secs {
            flags.insert(Flag::Walltime, secs.to_string());
        }
        SchedulerFlags(flags)
    }
}

/// `dsub` flags driven by resources. Declaration order is emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    /// `-q <queue>`
    Queue,
    /// `-p <1..=9999>`
    Priority,
    /// `-N <nodes>`
    Nodes,
    /// `-A <account>`
    Account,
    /// `--mpi <flavor>`
    Mpi,
    /// `-x job`
    Exclusive,
    /// `--tag key=value`
    Tag,
    /// `-R cpu=<n>,mem=<m>MB`
    Resources,
    /// `-T <seconds>`
    Walltime,
}

impl Flag {
    /// Command-line spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::Queue => "-q",
            Flag::Priority => "-p",
            Flag::Nodes => "-N",
            Flag::Account => "-A",
            Flag::Mpi => "--mpi",
            Flag::Exclusive => "-x",
            Flag::Tag => "--tag",
            Flag::Resources => "-R",
            Flag::Walltime => "-T",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered flag → value mapping produced by [`ResourceSpec::translate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerFlags(BTreeMap<Flag, String>);

impl SchedulerFlags {
    /// Value for one flag, if present.
    pub fn get(&self, flag: Flag) -> Option<&str> {
        self.0.get(&flag).map(String::as_str)
    }

    /// Flags in emission order.
    pub fn iter(&self) -> impl Iterator<Item = (Flag, &str)> {
        self.0.iter().map(|(f, v)| (*f, v.as_str()))
    }

    /// Flatten into `[flag, value, flag, value, ...]`.
    pub fn to_args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.0.len() * 2);
        for (flag, value) in self.iter() {
            out.push(flag.as_str().to_string());
            out.push(value.to_string());
        }
        out
    }

    /// Number of flags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn present(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn non_negative(field: &'static str, value: Option<i64>) -> Result<Option<u64>, ConfigError> {
    match value {
        Some(v) if v < 0 => Err(ConfigError::Negative { field, value: v }),
        Some(v) => Ok(Some(v as u64)),
        None => Ok(None),
    }
}

fn positive(field: &'static str, value: Option<i64>) -> Result<Option<u64>, ConfigError> {
    match non_negative(field, value)? {
        Some(0) => Err(ConfigError::Zero { field }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_requested() {
        let spec = ResourceSpec::from_request(&ResourceRequest::default(), None).unwrap();
        assert_eq!(spec, ResourceSpec::default());

        let flags = spec.translate();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags.get(Flag::Resources), Some("cpu=1,mem=1024MB"));
    }

    #[test]
    fn fat_node_scenario() {
        let req = ResourceRequest {
            mem_mb: Some(8192),
            queue: Some("fat_node".into()),
            runtime_min: Some(30),
            ..Default::default()
        };
        let flags = ResourceSpec::from_request(&req, Some(4)).unwrap().translate();
        assert_eq!(flags.get(Flag::Resources), Some("cpu=4,mem=8192MB"));
        assert_eq!(flags.get(Flag::Queue), Some("fat_node"));
        assert_eq!(flags.get(Flag::Walltime), Some("1800"));
    }

    #[test]
    fn per_cpu_memory_is_multiplied_and_wins() {
        let req = ResourceRequest {
            mem_mb_per_cpu: Some(2000),
            ..Default::default()
        };
        let spec = ResourceSpec::from_request(&req, Some(3)).unwrap();
        assert_eq!(spec.mem_mb, 6000);

        let both = ResourceRequest {
            mem_mb: Some(100),
            mem_mb_per_cpu: Some(2000),
            ..Default::default()
        };
        let spec = ResourceSpec::from_request(&both, Some(3)).unwrap();
        assert_eq!(spec.mem_mb, 6000);
    }

    #[test]
    fn aliases_fill_in_for_primary_keys() {
        let req = ResourceRequest {
            partition: Some("short".into()),
            time_min: Some(2),
            replica: Some(4),
            ..Default::default()
        };
        let spec = ResourceSpec::from_request(&req, None).unwrap();
        assert_eq!(spec.queue.as_deref(), Some("short"));
        assert_eq!(spec.walltime_secs, Some(120));
        assert_eq!(spec.nodes, Some(4));

        let both = ResourceRequest {
            queue: Some("long".into()),
            partition: Some("short".into()),
            ..Default::default()
        };
        let spec = ResourceSpec::from_request(&both, None).unwrap();
        assert_eq!(spec.queue.as_deref(), Some("long"));
    }

    #[test]
    fn rejects_negative_and_zero_values() {
        let neg = ResourceRequest {
            runtime_min: Some(-5),
            ..Default::default()
        };
        assert_eq!(
            ResourceSpec::from_request(&neg, None),
            Err(ConfigError::Negative {
                field: "runtime_min",
                value: -5
            })
        );

        let zero_mem = ResourceRequest {
            mem_mb: Some(0),
            ..Default::default()
        };
        assert_eq!(
            ResourceSpec::from_request(&zero_mem, None),
            Err(ConfigError::Zero { field: "mem_mb" })
        );

        assert_eq!(
            ResourceSpec::from_request(&ResourceRequest::default(), Some(0)),
            Err(ConfigError::Zero { field: "cores" })
        );
        assert!(matches!(
            ResourceSpec::from_request(&ResourceRequest::default(), Some(-1)),
            Err(ConfigError::Negative { field: "cores", .. })
        ));
    }

    #[test]
    fn rejects_tag_without_key() {
        for bad in ["novalue", "=x"] {
            let req = ResourceRequest {
                tag: Some(bad.into()),
                ..Default::default()
            };
            assert_eq!(
                ResourceSpec::from_request(&req, None),
                Err(ConfigError::MalformedTag(bad.into()))
            );
        }
    }

    #[test]
    fn zero_priority_and_runtime_are_omitted() {
        let req = ResourceRequest {
            priority: Some(0),
            runtime_min: Some(0),
            ..Default::default()
        };
        let flags = ResourceSpec::from_request(&req, None).unwrap().translate();
        assert_eq!(flags.get(Flag::Priority), None);
        assert_eq!(flags.get(Flag::Walltime), None);
    }

    #[test]
    fn priority_is_clamped() {
        let req = ResourceRequest {
            priority: Some(50_000),
            ..Default::default()
        };
        let flags = ResourceSpec::from_request(&req, None).unwrap().translate();
        assert_eq!(flags.get(Flag::Priority), Some("9999"));
    }

    #[test]
    fn flags_come_out_in_fixed_order() {
        let req = ResourceRequest {
            tag: Some("team=bio".into()),
            exclusive: true,
            mpi: Some("openmpi".into()),
            account: Some("lab".into()),
            nodes: Some(2),
            priority: Some(10),
            queue: Some("q".into()),
            runtime_min: Some(1),
            ..Default::default()
        };
        let args = ResourceSpec::from_request(&req, Some(2)).unwrap().translate().to_args();
        assert_eq!(
            args,
            vec![
                "-q", "q", "-p", "10", "-N", "2", "-A", "lab", "--mpi", "openmpi", "-x", "job",
                "--tag", "team=bio", "-R", "cpu=2,mem=1024MB", "-T", "60",
            ]
        );
    }

    #[test]
    fn blank_strings_count_as_absent() {
        let req = ResourceRequest {
            queue: Some("  ".into()),
            account: Some(String::new()),
            ..Default::default()
        };
        let flags = ResourceSpec::from_request(&req, None).unwrap().translate();
        assert_eq!(flags.get(Flag::Queue), None);
        assert_eq!(flags.get(Flag::Account), None);
    }
}
