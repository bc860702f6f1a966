use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use donau_core::command::CommandBuilder;
use donau_core::reconcile::Resolution;
use donau_core::status::CancelVerdict;
use donau_core::{new_run_id, run_tag, ExternalId, JobEvent, JobId, JobOutcome, JobRecord, JobRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use ulid::Ulid;

use crate::audit::AuditLog;
use crate::cancel::{CancelReport, CancellationManager};
use crate::config::ExecutorConfig;
use crate::error::{CancelError, SubmitError};
use crate::poller::StatusPoller;
use crate::preflight;
use crate::runner::{CommandRunner, ProcessRunner};
use crate::submit::SubmissionManager;
use crate::table::JobTable;

/// One executor run: submits jobs, polls them to completion and cancels
/// whatever is left on shutdown.
///
/// Every log line emitted on behalf of this instance carries its run id.
pub struct Executor<R: CommandRunner = ProcessRunner> {
    run_id: Ulid,
    span: tracing::Span,
    table: Arc<JobTable>,
    submitter: SubmissionManager<R>,
    poller: Arc<StatusPoller<R>>,
    canceller: CancellationManager<R>,
    shutdown: CancellationToken,
}

impl Executor<ProcessRunner> {
    /// Check that the scheduler verbs exist, then start on real processes.
    pub async fn start(cfg: ExecutorConfig) -> Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        let verbs = preflight::check_verbs(&cfg)?;
        for (verb, path) in &verbs {
            tracing::debug!(verb = %verb, path = %path.display(), "scheduler verb found");
        }
        Self::with_runner(cfg, Arc::new(ProcessRunner)).await
    }
}

impl<R: CommandRunner> Executor<R> {
    /// Build an executor on top of `runner`. The receiver yields every state
    /// transition.
    pub async fn with_runner(
        cfg: ExecutorConfig,
        runner: Arc<R>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<JobEvent>)> {
        let run_id = new_run_id();
        let span = tracing::info_span!("donau", run = %run_id);
        let workdir = cfg.workdir()?;

        let audit_path = cfg.audit_log(&workdir);
        let audit = AuditLog::open(&audit_path, run_id.to_string())
            .await
            .with_context(|| format!("open audit log {}", audit_path.display()))?;
        let audit = Arc::new(audit);

        let table = Arc::new(JobTable::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let builder = CommandBuilder::new(
            cfg.scheduler.submit_verb.clone(),
            cfg.job_name_prefix.clone(),
            run_tag(&run_id),
            cfg.log_root(&workdir),
            workdir,
        );
        let submitter = SubmissionManager::new(
            Arc::clone(&runner),
            builder,
            cfg.submit.clone(),
            Arc::clone(&table),
            Arc::clone(&audit),
            shutdown.clone(),
        );
        let poller = Arc::new(StatusPoller::new(
            Arc::clone(&runner),
            Arc::clone(&table),
            Arc::clone(&audit),
            cfg.scheduler.clone(),
            cfg.poll.clone(),
            tx.clone(),
        ));
        let canceller = CancellationManager::new(
            runner,
            Arc::clone(&table),
            audit,
            cfg.scheduler.clone(),
            cfg.cancel.clone(),
            tx,
        );

        span.in_scope(|| {
            tracing::info!(
                workdir = %submitter.builder().workdir().display(),
                audit = %audit_path.display(),
                "executor ready"
            )
        });

        Ok((
            Self {
                run_id,
                span,
                table,
                submitter,
                poller,
                canceller,
                shutdown,
            },
            rx,
        ))
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    /// Token that stops the poller and new submissions. Cancelling it does
    /// not cancel running jobs; call [`Executor::shutdown`] for that.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the poll loop in the background until shutdown.
    pub fn spawn_poller(&self) -> JoinHandle<()> {
        let poller = Arc::clone(&self.poller);
        let token = self.shutdown.clone();
        tokio::spawn(poller.run(token).instrument(self.span.clone()))
    }

    /// Submit one job. A job the scheduler accepts after shutdown has begun
    /// is cancelled straight away, since the shutdown sweep may already have
    /// run.
    pub async fn submit(&self, req: &JobRequest) -> Result<ExternalId, SubmitError> {
        let external_id = self.submitter.submit(req).instrument(self.span.clone()).await?;
        if !self.shutdown.is_cancelled() {
            return Ok(external_id);
        }
        let report = self.cancel_jobs(&[req.job_id]).await;
        self.span.in_scope(|| {
            tracing::warn!(
                job_id = %req.job_id,
                external_id = %external_id,
                confirmed = report.unconfirmed.is_empty(),
                "job accepted during shutdown, cancelled"
            )
        });
        Err(SubmitError::ShuttingDown {
            job_id: req.job_id,
            external_id: Some(external_id),
        })
    }

    /// Run one poll cycle inline.
    pub async fn poll_once(&self) -> Vec<JobEvent> {
        self.poller.poll_once().instrument(self.span.clone()).await
    }

    /// Ask both scheduler views about ids this executor may not track.
    pub async fn lookup(&self, ids: &BTreeSet<ExternalId>) -> BTreeMap<ExternalId, Resolution> {
        self.poller.lookup(ids).instrument(self.span.clone()).await
    }

    /// Copy of a tracked record.
    pub async fn record(&self, job_id: JobId) -> Option<JobRecord> {
        let handle = self.table.get(job_id)?;
        let rec = handle.lock().await.clone();
        Some(rec)
    }

    /// Copies of every tracked record.
    pub async fn records(&self) -> Vec<JobRecord> {
        self.table.snapshot().await
    }

    /// Terminal result, leaving the record tracked.
    pub async fn outcome(&self, job_id: JobId) -> Option<JobOutcome> {
        let handle = self.table.get(job_id)?;
        let outcome = handle.lock().await.outcome();
        outcome
    }

    /// Terminal result; the record is dropped once consumed.
    pub async fn take_outcome(&self, job_id: JobId) -> Option<JobOutcome> {
        self.table.take_finished(job_id).await
    }

    pub async fn cancel_jobs(&self, job_ids: &[JobId]) -> CancelReport {
        self.canceller
            .cancel_jobs(job_ids)
            .instrument(self.span.clone())
            .await
    }

    /// Cancel raw scheduler ids without touching any record.
    pub async fn cancel_external(
        &self,
        ids: &[ExternalId],
    ) -> Result<BTreeMap<ExternalId, CancelVerdict>, CancelError> {
        self.canceller
            .cancel_external(ids)
            .instrument(self.span.clone())
            .await
    }

    /// Stop polling and submitting, then cancel every job that is still
    /// running.
    pub async fn shutdown(&self) -> CancelReport {
        self.shutdown.cancel();
        let report = self
            .canceller
            .cancel_all()
            .instrument(self.span.clone())
            .await;
        self.span.in_scope(|| {
            tracing::info!(
                cancelled = report.cancelled.len(),
                unconfirmed = report.unconfirmed.len(),
                "executor shut down"
            )
        });
        report
    }
}
