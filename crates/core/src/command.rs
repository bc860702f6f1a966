//! Construction of the `dsub` argument vector.

use std::path::{Path, PathBuf};

use crate::model::JobRequest;
use crate::resources::SchedulerFlags;

/// Flag naming the job.
pub const NAME_FLAG: &str = "-n";
/// Flag sending stdout and stderr to one file, overwriting it.
pub const OUTPUT_FLAG: &str = "-oo";
/// Flag pinning the working directory.
pub const CWD_FLAG: &str = "--cwd";

/// A fully built submit command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCommand {
    /// Scheduler job name; identical across retries of the same job.
    pub job_name: String,
    /// Combined stdout/stderr log of the job.
    pub log_path: PathBuf,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
}

impl SubmitCommand {
    /// The submit verb.
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments after the verb.
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// Shell-quoted rendering for logs.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Assembles submit commands for one executor run.
///
/// Everything that varies between runs (verb, prefix, run tag, log root and
/// working directory) is fixed at construction, so `build` depends only on
/// the job request and its flags.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    submit_verb: String,
    name_prefix: String,
    run_tag: String,
    log_root: PathBuf,
    workdir: PathBuf,
}

impl CommandBuilder {
    /// `log_root` and `workdir` should be absolute; they are embedded as-is.
    pub fn new(
        submit_verb: impl Into<String>,
        name_prefix: impl Into<String>,
        run_tag: impl Into<String>,
        log_root: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            submit_verb: submit_verb.into(),
            name_prefix: name_prefix.into(),
            run_tag: run_tag.into(),
            log_root: log_root.into(),
            workdir: workdir.into(),
        }
    }

    /// Working directory passed to `--cwd`.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// `<prefix>_<rule>_<run tag>_<job id>`.
    pub fn job_name(&self, req: &JobRequest) -> String {
        format!(
            "{}_{}_{}_{}",
            self.name_prefix,
            sanitize(&req.rule),
            self.run_tag,
            req.job_id
        )
    }

    /// `<log_root>/rule_<rule>/<wildcards>/<job id>.log`, or
    /// `<log_root>/group_<group>/group/<job id>.log` for grouped jobs.
    pub fn log_path(&self, req: &JobRequest) -> PathBuf {
        let (folder, leaf) = match &req.group {
            Some(group) => (format!("group_{}", sanitize(group)), "group".to_string()),
            None => (format!("rule_{}", sanitize(&req.rule)), wildcard_dir(req)),
        };
        self.log_root
            .join(folder)
            .join(leaf)
            .join(format!("{}.log", req.job_id))
    }

    /// Build the submit argv: name, output, working directory, resource
    /// flags in their fixed order, then the job's own command line.
    pub fn build(&self, req: &JobRequest, flags: &SchedulerFlags) -> SubmitCommand {
        let job_name = self.job_name(req);
        let log_path = self.log_path(req);

        let mut argv = vec![
            self.submit_verb.clone(),
            NAME_FLAG.to_string(),
            job_name.clone(),
            OUTPUT_FLAG.to_string(),
            log_path.to_string_lossy().into_owned(),
            CWD_FLAG.to_string(),
            self.workdir.to_string_lossy().into_owned(),
        ];
        argv.extend(flags.to_args());
        argv.push(req.command.clone());

        SubmitCommand {
            job_name,
            log_path,
            argv,
        }
    }
}

fn wildcard_dir(req: &JobRequest) -> String {
    if req.wildcards.is_empty() {
        return "unique".to_string();
    }
    req.wildcards
        .iter()
        .map(|(k, v)| format!("{k}-{v}"))
        .collect::<Vec<_>>()
        .join("_")
        .replace('/', "-")
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Single-quote an argument for display unless it is plainly safe.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
