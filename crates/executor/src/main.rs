#![forbid(unsafe_code)]

//! `donau-exec`: run single jobs on a Donau cluster and inspect or cancel
//! scheduler jobs by id.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use donau_core::reconcile::Resolution;
use donau_core::resources::ResourceRequest;
use donau_core::{ExternalId, JobId, JobRequest};
use donau_executor::{preflight, shutdown, Executor, ExecutorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "donau.toml";

#[derive(Parser, Debug)]
#[command(name = "donau-exec")]
struct Args {
    /// Config file. Defaults to ./donau.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Working directory for submitted jobs; overrides the config file.
    #[arg(long, global = true)]
    workdir: Option<PathBuf>,

    /// Log level (env-filter syntax).
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Check that dsub, djob and dkill are on PATH.
    Doctor,
    /// Write the effective configuration to a file.
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,
    },
    /// Submit one job and follow it to completion. Ctrl-C cancels it.
    Submit {
        #[arg(long)]
        rule: String,
        #[arg(long, default_value_t = 1)]
        job_id: u64,
        #[arg(long)]
        threads: Option<i64>,
        /// Resource request as JSON, e.g. '{"mem_mb": 8192, "queue": "fat_node"}'.
        #[arg(long)]
        resources: Option<String>,
        /// Wildcard value as key=value; repeatable.
        #[arg(long = "wildcard", value_parser = parse_key_value)]
        wildcards: Vec<(String, String)>,
        #[arg(long)]
        group: Option<String>,
        /// Command line the job runs.
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Look scheduler ids up in the active and historical views.
    Status {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Force-cancel scheduler ids.
    Cancel {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut cfg = load_config(args.config.as_deref())?;
    if let Some(dir) = args.workdir {
        cfg.paths.workdir = Some(dir);
    }

    match args.cmd {
        Cmd::Doctor => {
            for (verb, path) in preflight::check_verbs(&cfg)? {
                println!("{verb}\t{}", path.display());
            }
        }
        Cmd::InitConfig { path } => {
            cfg.save_to(&path)?;
            println!("wrote {}", path.display());
        }
        Cmd::Submit {
            rule,
            job_id,
            threads,
            resources,
            wildcards,
            group,
            command,
        } => {
            let resources: ResourceRequest = match resources {
                Some(json) => serde_json::from_str(&json).context("parse --resources")?,
                None => ResourceRequest::default(),
            };
            let req = JobRequest {
                job_id: JobId(job_id),
                rule,
                group,
                wildcards: wildcards.into_iter().collect(),
                threads,
                resources,
                command: command.join(" "),
            };
            run_one(cfg, req).await?;
        }
        Cmd::Status { ids } => {
            let (exec, _events) = Executor::start(cfg).await?;
            let ids: BTreeSet<ExternalId> = ids.iter().map(|s| ExternalId::from(s.as_str())).collect();
            for (id, resolution) in exec.lookup(&ids).await {
                match resolution {
                    Resolution::Observed { status, source, .. } => println!("{id}\t{status}\t{source}"),
                    Resolution::Absent => println!("{id}\t-\tabsent"),
                    Resolution::Unknown => println!("{id}\t-\tquery failed"),
                }
            }
        }
        Cmd::Cancel { ids } => {
            let (exec, _events) = Executor::start(cfg).await?;
            let ids: Vec<ExternalId> = ids.iter().map(|s| ExternalId::from(s.as_str())).collect();
            let verdicts = exec.cancel_external(&ids).await?;
            println!("{}", serde_json::to_string_pretty(&verdicts)?);
        }
    }
    Ok(())
}

async fn run_one(cfg: ExecutorConfig, req: JobRequest) -> anyhow::Result<()> {
    let (exec, mut events) = Executor::start(cfg).await?;
    let token = exec.shutdown_token();
    let _signals = shutdown::install_shutdown_handler(token.clone());
    let poller = exec.spawn_poller();

    let external_id = exec.submit(&req).await?;
    tracing::info!(job_id = %req.job_id, external_id = %external_id, "waiting for job");

    let outcome = loop {
        tokio::select! {
            _ = token.cancelled() => break None,
            event = events.recv() => match event {
                Some(ev) if ev.job_id == req.job_id && ev.to.is_terminal() => {
                    break exec.take_outcome(req.job_id).await;
                }
                Some(_) => {}
                None => break None,
            },
        }
    };

    let Some(outcome) = outcome else {
        let report = exec.shutdown().await;
        let _ = poller.await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        bail!("interrupted; job {} cancelled", req.job_id);
    };

    token.cancel();
    let _ = poller.await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let Some(failure) = &outcome.failure {
        bail!("job {} did not succeed: {failure}", req.job_id);
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ExecutorConfig> {
    match path {
        Some(path) => ExecutorConfig::load_from(path),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            ExecutorConfig::load_from(Path::new(DEFAULT_CONFIG))
        }
        None => Ok(ExecutorConfig::default()),
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{s}`"))
}
