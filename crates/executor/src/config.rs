use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use donau_core::status::DEFAULT_PERMANENT_PATTERNS;
use serde::{Deserialize, Serialize};

/// Executor settings, usually read from `donau.toml`. Every key is optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// First component of every scheduler job name.
    pub job_name_prefix: String,
    pub scheduler: SchedulerConfig,
    pub submit: SubmitConfig,
    pub poll: PollConfig,
    pub cancel: CancelConfig,
    pub paths: PathsConfig,
}

/// Names and flags of the scheduler verbs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub submit_verb: String,
    pub query_verb: String,
    pub cancel_verb: String,
    /// Extra query flag selecting the historical view.
    pub history_flag: String,
    /// Column selection passed to `-o`.
    pub query_format: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitConfig {
    pub max_attempts: u32,
    /// Delay after the n-th failed attempt is `n * backoff_base_ms`.
    pub backoff_base_ms: u64,
    pub max_concurrent: usize,
    /// Case-insensitive output fragments that make a failure permanent.
    pub permanent_patterns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    /// Grace period after submission before a job is first queried.
    pub initial_delay_ms: u64,
    /// Consecutive polls missing from both views before a job is lost.
    /// Every miss in the streak is kept for the lost-job log line.
    pub max_unresolved: u32,
    pub max_batch: usize,
    pub max_concurrent_queries: usize,
    /// A status query still running after this long counts as failed.
    pub query_timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelConfig {
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the per-job log tree, relative to `workdir`.
    pub log_root: PathBuf,
    /// JSON-lines audit log, relative to `workdir`.
    pub audit_log: PathBuf,
    /// Working directory of submitted jobs; defaults to the current one.
    pub workdir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            job_name_prefix: "smk".to_string(),
            scheduler: SchedulerConfig::default(),
            submit: SubmitConfig::default(),
            poll: PollConfig::default(),
            cancel: CancelConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit_verb: "dsub".to_string(),
            query_verb: "djob".to_string(),
            cancel_verb: "dkill".to_string(),
            history_flag: "-D".to_string(),
            query_format: "jobid state".to_string(),
        }
    }
}

impl Default for SubmitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 2_000,
            max_concurrent: 8,
            permanent_patterns: DEFAULT_PERMANENT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            initial_delay_ms: 5_000,
            max_unresolved: 5,
            max_batch: 200,
            max_concurrent_queries: 4,
            query_timeout_ms: 60_000,
        }
    }
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_root: PathBuf::from(".snakemake/donau_logs"),
            audit_log: PathBuf::from(".snakemake/donau_audit.jsonl"),
            workdir: None,
        }
    }
}

impl ExecutorConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: ExecutorConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Resolved working directory.
    pub fn workdir(&self) -> Result<PathBuf> {
        match &self.paths.workdir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().context("current directory"),
        }
    }

    /// Absolute log root under `workdir`.
    pub fn log_root(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.paths.log_root)
    }

    /// Absolute audit log path under `workdir`.
    pub fn audit_log(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.paths.audit_log)
    }

    /// Verbs preflight must find on PATH.
    pub fn verbs(&self) -> [&str; 3] {
        [
            self.scheduler.submit_verb.as_str(),
            self.scheduler.query_verb.as_str(),
            self.scheduler.cancel_verb.as_str(),
        ]
    }
}

impl SubmitConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }
}

impl CancelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
