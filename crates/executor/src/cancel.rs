use std::collections::BTreeMap;
use std::sync::Arc;

use donau_core::status::{classify_cancel_output, CancelVerdict};
use donau_core::{now_ms, ExternalId, JobEvent, JobId};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{CancelConfig, SchedulerConfig};
use crate::error::CancelError;
use crate::runner::CommandRunner;
use crate::table::{JobTable, RecordHandle};

/// Non-interactive, forced kill.
const CANCEL_FLAGS: [&str; 2] = ["-y", "--force"];

/// What a bulk cancel did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    /// Records moved to `Cancelled`.
    pub cancelled: Vec<JobId>,
    /// Records that were already terminal; left untouched.
    pub already_terminal: Vec<JobId>,
    /// Ids the scheduler did not confirm. Their records are still marked
    /// cancelled.
    pub unconfirmed: Vec<ExternalId>,
    /// Set when the cancel verb failed outright.
    pub error: Option<String>,
}

pub struct CancellationManager<R> {
    runner: Arc<R>,
    table: Arc<JobTable>,
    audit: Arc<AuditLog>,
    scheduler: SchedulerConfig,
    cfg: CancelConfig,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl<R: CommandRunner> CancellationManager<R> {
    pub fn new(
        runner: Arc<R>,
        table: Arc<JobTable>,
        audit: Arc<AuditLog>,
        scheduler: SchedulerConfig,
        cfg: CancelConfig,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        Self {
            runner,
            table,
            audit,
            scheduler,
            cfg,
            events,
        }
    }

    /// Cancel every non-terminal record with one scheduler call.
    pub async fn cancel_all(&self) -> CancelReport {
        self.cancel_handles(self.table.handles()).await
    }

    /// Cancel the given jobs with one scheduler call. Unknown ids are
    /// skipped.
    pub async fn cancel_jobs(&self, job_ids: &[JobId]) -> CancelReport {
        let handles = job_ids
            .iter()
            .filter_map(|id| self.table.get(*id))
            .collect();
        self.cancel_handles(handles).await
    }

    async fn cancel_handles(&self, handles: Vec<RecordHandle>) -> CancelReport {
        let mut report = CancelReport::default();
        let mut targets = Vec::new();
        let mut ids = Vec::new();

        for handle in handles {
            let mut rec = handle.lock().await;
            if rec.state().is_terminal() {
                report.already_terminal.push(rec.job_id);
                continue;
            }
            rec.request_cancel();
            if let Some(id) = rec.external_id() {
                ids.push(id.clone());
            }
            drop(rec);
            targets.push(handle);
        }

        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "cancelling jobs");
            match self.cancel_external(&ids).await {
                Ok(verdicts) => {
                    report.unconfirmed = verdicts
                        .into_iter()
                        .filter(|(_, v)| !v.is_success())
                        .map(|(id, _)| id)
                        .collect();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cancel call failed");
                    report.error = Some(e.to_string());
                    report.unconfirmed = ids.clone();
                }
            }
            if !report.unconfirmed.is_empty() {
                let list: Vec<&str> = report.unconfirmed.iter().map(ExternalId::as_str).collect();
                tracing::warn!(ids = %list.join(" "), "cancellation not confirmed by scheduler");
            }
        }

        let now = now_ms();
        for handle in targets {
            let mut rec = handle.lock().await;
            match rec.cancel(now) {
                Some(event) => {
                    report.cancelled.push(rec.job_id);
                    drop(rec);
                    self.audit.record(AuditEvent::Transition(&event)).await;
                    let _ = self.events.send(event);
                }
                None => report.already_terminal.push(rec.job_id),
            }
        }
        report
    }

    /// One cancel call for raw scheduler ids, bounded by the timeout.
    pub async fn cancel_external(
        &self,
        ids: &[ExternalId],
    ) -> Result<BTreeMap<ExternalId, CancelVerdict>, CancelError> {
        let mut args: Vec<String> = CANCEL_FLAGS.iter().map(|f| f.to_string()).collect();
        args.extend(ids.iter().map(|id| id.to_string()));

        let timeout = self.cfg.timeout();
        let out = tokio::time::timeout(timeout, self.runner.run(&self.scheduler.cancel_verb, &args))
            .await
            .map_err(|_| CancelError::Timeout(timeout))??;

        let output = out.combined();
        let verdicts = classify_cancel_output(ids, &output, out.status);
        self.audit
            .record(AuditEvent::Cancel {
                ids,
                exit_code: out.status,
                output: &output,
                verdicts: &verdicts,
            })
            .await;
        tracing::debug!(exit_code = ?out.status, output = %output, "cancel call returned");
        Ok(verdicts)
    }
}
