//! Scripted stand-in for the Donau client verbs.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use donau_core::resources::ResourceRequest;
use donau_core::{JobEvent, JobId, JobRequest};
use donau_executor::{CommandOutput, CommandRunner, Executor, ExecutorConfig};
use tempfile::TempDir;
use tokio::sync::mpsc;

#[derive(Default)]
struct State {
    next_id: u64,
    submit_script: VecDeque<io::Result<CommandOutput>>,
    active: BTreeMap<String, String>,
    history: BTreeMap<String, String>,
    fail_active: bool,
    fail_history: bool,
    cancel_output: Option<CommandOutput>,
    cancel_delay: Option<Duration>,
    submit_delay: Option<Duration>,
    query_delays: BTreeMap<String, Duration>,
    calls: Vec<(String, Vec<String>)>,
}

#[derive(Clone)]
pub struct FakeScheduler {
    state: Arc<Mutex<State>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 1001,
                ..Default::default()
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Queue outputs for the next submit calls; afterwards submits succeed.
    pub fn script_submits(&self, outputs: Vec<io::Result<CommandOutput>>) {
        self.with(|s| s.submit_script.extend(outputs));
    }

    pub fn set_active(&self, id: &str, status: &str) {
        self.with(|s| s.active.insert(id.to_string(), status.to_string()));
    }

    pub fn set_history(&self, id: &str, status: &str) {
        self.with(|s| s.history.insert(id.to_string(), status.to_string()));
    }

    pub fn forget(&self, id: &str) {
        self.with(|s| {
            s.active.remove(id);
            s.history.remove(id);
        });
    }

    pub fn fail_active_queries(&self, fail: bool) {
        self.with(|s| s.fail_active = fail);
    }

    pub fn fail_history_queries(&self, fail: bool) {
        self.with(|s| s.fail_history = fail);
    }

    pub fn set_cancel_output(&self, out: CommandOutput) {
        self.with(|s| s.cancel_output = Some(out));
    }

    pub fn set_cancel_delay(&self, delay: Duration) {
        self.with(|s| s.cancel_delay = Some(delay));
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.with(|s| s.submit_delay = Some(delay));
    }

    /// Any query naming `id` takes `delay` before answering.
    pub fn set_query_delay(&self, id: &str, delay: Duration) {
        self.with(|s| s.query_delays.insert(id.to_string(), delay));
    }

    /// Argument lists of every call to `program`, in order. A call is listed
    /// as soon as it starts.
    pub fn calls(&self, program: &str) -> Vec<Vec<String>> {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|(p, _)| p == program)
                .map(|(_, a)| a.clone())
                .collect()
        })
    }

    fn respond(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        self.with(|s| match program {
            "dsub" => match s.submit_script.pop_front() {
                Some(scripted) => scripted,
                None => {
                    let id = s.next_id;
                    s.next_id += 1;
                    Ok(ok(&format!("Submit job <{id}> successfully.\n")))
                }
            },
            "djob" => {
                let history = args.iter().any(|a| a == "-D");
                if (history && s.fail_history) || (!history && s.fail_active) {
                    return Ok(CommandOutput {
                        status: Some(255),
                        stdout: String::new(),
                        stderr: "djob: failed to connect to server\n".into(),
                    });
                }
                let view = if history { &s.history } else { &s.active };
                let stdout: String = args[3..]
                    .iter()
                    .filter(|a| *a != "-D")
                    .filter_map(|id| view.get(id).map(|st| format!("{id} {st}\n")))
                    .collect();
                Ok(ok(&stdout))
            }
            "dkill" => Ok(s.cancel_output.clone().unwrap_or_else(|| ok("kill request sent\n"))),
            other => Err(io::Error::new(io::ErrorKind::NotFound, other.to_string())),
        })
    }
}

impl CommandRunner for FakeScheduler {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let delay = self.with(|s| {
            s.calls.push((program.to_string(), args.to_vec()));
            match program {
                "dsub" => s.submit_delay,
                "dkill" => s.cancel_delay,
                "djob" => args.iter().filter_map(|a| s.query_delays.get(a)).max().copied(),
                _ => None,
            }
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.respond(program, args)
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

pub fn config(workdir: &TempDir) -> ExecutorConfig {
    let mut cfg = ExecutorConfig::default();
    cfg.paths.workdir = Some(workdir.path().to_path_buf());
    cfg.submit.backoff_base_ms = 1;
    cfg.poll.initial_delay_ms = 0;
    cfg.poll.interval_ms = 10;
    cfg.poll.max_unresolved = 3;
    cfg.cancel.timeout_ms = 2_000;
    cfg
}

pub async fn executor(
    fake: &FakeScheduler,
    cfg: ExecutorConfig,
) -> (Executor<FakeScheduler>, mpsc::UnboundedReceiver<JobEvent>) {
    Executor::with_runner(cfg, Arc::new(fake.clone())).await.unwrap()
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn job(id: u64, rule: &str) -> JobRequest {
    JobRequest {
        job_id: JobId(id),
        rule: rule.to_string(),
        group: None,
        wildcards: BTreeMap::new(),
        threads: Some(4),
        resources: ResourceRequest {
            mem_mb: Some(8192),
            queue: Some("fat_node".into()),
            runtime_min: Some(30),
            ..Default::default()
        },
        command: format!("snakemake --target-jobs {rule}:id={id}"),
    }
}
