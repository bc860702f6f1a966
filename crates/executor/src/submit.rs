use std::io;
use std::sync::Arc;

use donau_core::backoff::linear_backoff;
use donau_core::command::{CommandBuilder, SubmitCommand};
use donau_core::resources::ResourceSpec;
use donau_core::status::{classify_submit_failure, parse_submit_output, FailureKind};
use donau_core::{now_ms, ExternalId, JobRecord, JobRequest};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::SubmitConfig;
use crate::error::SubmitError;
use crate::runner::CommandRunner;
use crate::table::JobTable;

/// Turns job requests into tracked scheduler jobs.
pub struct SubmissionManager<R> {
    runner: Arc<R>,
    builder: CommandBuilder,
    cfg: SubmitConfig,
    table: Arc<JobTable>,
    audit: Arc<AuditLog>,
    permits: Semaphore,
    shutdown: CancellationToken,
}

impl<R: CommandRunner> SubmissionManager<R> {
    pub fn new(
        runner: Arc<R>,
        builder: CommandBuilder,
        cfg: SubmitConfig,
        table: Arc<JobTable>,
        audit: Arc<AuditLog>,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Semaphore::new(cfg.max_concurrent.max(1));
        Self {
            runner,
            builder,
            cfg,
            table,
            audit,
            permits,
            shutdown,
        }
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    /// Validate, build and submit one job.
    ///
    /// On success the job is tracked in the table in `Pending` state. On
    /// failure nothing is tracked. Once shutdown has begun no new attempt is
    /// started; a `dsub` already running is left to finish.
    pub async fn submit(&self, req: &JobRequest) -> Result<ExternalId, SubmitError> {
        let job_id = req.job_id;
        let Some(_slot) = self.table.reserve(job_id) else {
            return Err(SubmitError::Duplicate(job_id));
        };
        let shutting_down = || SubmitError::ShuttingDown {
            job_id,
            external_id: None,
        };
        if self.shutdown.is_cancelled() {
            return Err(shutting_down());
        }

        let spec = ResourceSpec::from_request(&req.resources, req.threads)
            .map_err(|source| SubmitError::Config { job_id, source })?;
        let cmd = self.builder.build(req, &spec.translate());
        if let Some(dir) = cmd.log_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(shutting_down()),
            permit = self.permits.acquire() => permit.ok(),
        };
        let created_at_ms = now_ms();
        let max_attempts = self.cfg.max_attempts.max(1);
        let mut last_output = String::new();

        for attempt in 1..=max_attempts {
            tracing::debug!(job_id = %job_id, attempt, cmd = %cmd.display(), "dsub");
            match self.runner.run(cmd.program(), cmd.args()).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(SubmitError::Permanent {
                        job_id,
                        output: e.to_string(),
                    });
                }
                Err(e) => {
                    last_output = e.to_string();
                }
                Ok(out) => {
                    let output = out.combined();
                    self.audit
                        .record(AuditEvent::SubmitAttempt {
                            job_id,
                            attempt,
                            argv: &cmd.argv,
                            exit_code: out.status,
                            output: &output,
                        })
                        .await;

                    if out.success() {
                        let Some(external_id) = parse_submit_output(&out.stdout)
                            .or_else(|| parse_submit_output(&output))
                        else {
                            tracing::error!(job_id = %job_id, output = %output, "no job id in submit output");
                            return Err(SubmitError::UnparseableId { job_id, output });
                        };
                        return self.track(req, cmd, external_id, attempt, created_at_ms).await;
                    }

                    if classify_submit_failure(&output, &self.cfg.permanent_patterns)
                        == FailureKind::Permanent
                    {
                        tracing::error!(job_id = %job_id, output = %output, "submit rejected");
                        return Err(SubmitError::Permanent { job_id, output });
                    }
                    last_output = output;
                }
            }

            if attempt < max_attempts {
                let delay = linear_backoff(self.cfg.backoff_base(), attempt);
                tracing::warn!(
                    job_id = %job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    output = %last_output,
                    "submit failed, retrying"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::info!(job_id = %job_id, attempt, "shutdown during submit backoff");
                        return Err(shutting_down());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        tracing::error!(job_id = %job_id, attempts = max_attempts, "submit attempts exhausted");
        Err(SubmitError::Exhausted {
            job_id,
            attempts: max_attempts,
            last_output,
        })
    }

    async fn track(
        &self,
        req: &JobRequest,
        cmd: SubmitCommand,
        external_id: ExternalId,
        attempts: u32,
        created_at_ms: i64,
    ) -> Result<ExternalId, SubmitError> {
        let mut record = JobRecord::new(req.job_id, &req.rule, cmd.argv, cmd.log_path, created_at_ms);
        record.submit_attempts = attempts;
        record.assign_external_id(external_id.clone(), now_ms())?;
        if !self.table.insert(record) {
            return Err(SubmitError::Duplicate(req.job_id));
        }
        self.audit
            .record(AuditEvent::Submitted {
                job_id: req.job_id,
                external_id: &external_id,
            })
            .await;
        tracing::info!(
            job_id = %req.job_id,
            rule = %req.rule,
            external_id = %external_id,
            job_name = %cmd.job_name,
            "job submitted"
        );
        Ok(external_id)
    }
}
