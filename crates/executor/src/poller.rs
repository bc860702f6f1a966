//! Periodic dual-view status polling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use donau_core::reconcile::{history_candidates, merge_views, Resolution};
use donau_core::status::{mentions_missing_job, parse_query_output};
use donau_core::{now_ms, ExternalId, JobEvent, JobRecord, JobState};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::{PollConfig, SchedulerConfig};
use crate::runner::CommandRunner;
use crate::table::{JobTable, RecordHandle};

/// Records claimed for one query, all stamped with the same ticket.
struct Batch {
    ticket: u64,
    members: Vec<(ExternalId, RecordHandle)>,
}

impl Batch {
    fn ids(&self) -> BTreeSet<ExternalId> {
        self.members.iter().map(|(id, _)| id.clone()).collect()
    }
}

pub struct StatusPoller<R> {
    runner: Arc<R>,
    table: Arc<JobTable>,
    audit: Arc<AuditLog>,
    scheduler: SchedulerConfig,
    cfg: PollConfig,
    events: mpsc::UnboundedSender<JobEvent>,
    tickets: AtomicU64,
    permits: Arc<Semaphore>,
}

impl<R: CommandRunner> StatusPoller<R> {
    pub fn new(
        runner: Arc<R>,
        table: Arc<JobTable>,
        audit: Arc<AuditLog>,
        scheduler: SchedulerConfig,
        cfg: PollConfig,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent_queries.max(1)));
        Self {
            runner,
            table,
            audit,
            scheduler,
            cfg,
            events,
            tickets: AtomicU64::new(0),
            permits,
        }
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Poll until `shutdown` fires. Each batch query runs as its own task so
    /// a slow scheduler call only holds up its own batch.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.cfg.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.cfg.interval_ms, "status poller started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut batches = self.claim_batches().await.into_iter();
            while let Some(batch) = batches.next() {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    release(batch).await;
                    for rest in batches.by_ref() {
                        release(rest).await;
                    }
                    break;
                };
                let this = Arc::clone(&self);
                tokio::spawn(
                    async move {
                        this.process(batch).await;
                        drop(permit);
                    }
                    .in_current_span(),
                );
            }
        }
        tracing::info!("status poller stopped");
    }

    /// One full cycle, run inline. Returns the transitions it caused.
    pub async fn poll_once(&self) -> Vec<JobEvent> {
        let mut out = Vec::new();
        for batch in self.claim_batches().await {
            out.extend(self.process(batch).await);
        }
        out
    }

    /// Query both views for arbitrary ids without touching any record.
    pub async fn lookup(&self, ids: &BTreeSet<ExternalId>) -> BTreeMap<ExternalId, Resolution> {
        let ticket = self.next_ticket();
        self.query_views(ticket, ids).await
    }

    /// Claim every pollable record, chunked by `max_batch`.
    async fn claim_batches(&self) -> Vec<Batch> {
        let now = now_ms();
        let delay = self.cfg.initial_delay_ms as i64;

        let mut candidates = Vec::new();
        for handle in self.table.handles() {
            let id = {
                let rec = handle.lock().await;
                if rec.is_pollable(now, delay) {
                    rec.external_id().cloned()
                } else {
                    None
                }
            };
            if let Some(id) = id {
                candidates.push((id, handle));
            }
        }

        let mut batches = Vec::new();
        for chunk in candidates.chunks(self.cfg.max_batch.max(1)) {
            let ticket = self.next_ticket();
            let mut members = Vec::with_capacity(chunk.len());
            for (id, handle) in chunk {
                let mut rec = handle.lock().await;
                if rec.is_pollable(now, delay) && rec.begin_query(ticket) {
                    members.push((id.clone(), Arc::clone(handle)));
                }
            }
            if !members.is_empty() {
                batches.push(Batch { ticket, members });
            }
        }
        batches
    }

    async fn process(&self, batch: Batch) -> Vec<JobEvent> {
        let ids = batch.ids();
        let resolutions = self.query_views(batch.ticket, &ids).await;
        let now = now_ms();

        let unknown = Resolution::Unknown;
        let mut events = Vec::new();
        for (id, handle) in &batch.members {
            let resolution = resolutions.get(id).unwrap_or(&unknown);
            let mut rec = handle.lock().await;
            let Some(event) =
                rec.apply_resolution(resolution, batch.ticket, now, self.cfg.max_unresolved)
            else {
                continue;
            };
            log_transition(&rec, &event);
            drop(rec);
            self.audit.record(AuditEvent::Transition(&event)).await;
            let _ = self.events.send(event.clone());
            events.push(event);
        }
        events
    }

    async fn query_views(
        &self,
        ticket: u64,
        ids: &BTreeSet<ExternalId>,
    ) -> BTreeMap<ExternalId, Resolution> {
        let active = self.query(ticket, ids, false).await;
        let history = match &active {
            Some(active) => {
                let missing = history_candidates(ids, active);
                if missing.is_empty() {
                    Some(BTreeMap::new())
                } else {
                    self.query(ticket, &missing, true).await
                }
            }
            None => None,
        };
        merge_views(ids, active.as_ref(), history.as_ref())
    }

    /// One query call. `None` means the answer cannot be trusted.
    async fn query(
        &self,
        ticket: u64,
        ids: &BTreeSet<ExternalId>,
        history: bool,
    ) -> Option<BTreeMap<ExternalId, String>> {
        let mut args = vec![
            "-o".to_string(),
            self.scheduler.query_format.clone(),
            "--no-header".to_string(),
        ];
        if history {
            args.push(self.scheduler.history_flag.clone());
        }
        args.extend(ids.iter().map(|id| id.to_string()));
        let id_list: Vec<ExternalId> = ids.iter().cloned().collect();

        let call = self.runner.run(&self.scheduler.query_verb, &args);
        let out = match tokio::time::timeout(self.cfg.query_timeout(), call).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                tracing::warn!(ticket, history, error = %e, "status query failed to run");
                return None;
            }
            Err(_) => {
                tracing::warn!(
                    ticket,
                    history,
                    timeout_ms = self.cfg.query_timeout_ms,
                    "status query timed out"
                );
                return None;
            }
        };
        self.audit
            .record(AuditEvent::Query {
                ticket,
                history,
                ids: &id_list,
                exit_code: out.status,
                output: &out.combined(),
            })
            .await;

        let parsed = parse_query_output(&out.stdout, ids);
        // The query verb exits non-zero when any requested id is unknown;
        // that is still an answer.
        if out.success() || !parsed.is_empty() || mentions_missing_job(&out.stderr) {
            tracing::debug!(ticket, history, asked = ids.len(), seen = parsed.len(), "status query");
            Some(parsed)
        } else {
            tracing::warn!(
                ticket,
                history,
                exit_code = ?out.status,
                stderr = %out.stderr.trim(),
                "status query failed"
            );
            None
        }
    }
}

async fn release(batch: Batch) {
    for (_, handle) in &batch.members {
        handle.lock().await.end_query(batch.ticket);
    }
}

fn log_transition(rec: &JobRecord, event: &JobEvent) {
    let external_id = rec.external_id().map(ExternalId::as_str).unwrap_or("-");
    match event.to {
        JobState::Succeeded => tracing::info!(
            job_id = %rec.job_id,
            external_id,
            status = rec.last_status().unwrap_or(""),
            "job finished"
        ),
        JobState::Failed => tracing::error!(
            job_id = %rec.job_id,
            external_id,
            status = rec.last_status().unwrap_or(""),
            log = %rec.stdout_log.display(),
            "job failed"
        ),
        JobState::Lost => {
            let history: Vec<String> = rec
                .notes()
                .map(|n| format!("#{}@{}:{}", n.ticket, n.at_ms, n.verdict))
                .collect();
            tracing::warn!(
                job_id = %rec.job_id,
                external_id,
                cycles = rec.unresolved_cycles(),
                history = %history.join(" "),
                "job lost: absent from active and historical views"
            );
        }
        JobState::Unresolved => tracing::debug!(
            job_id = %rec.job_id,
            external_id,
            cycles = rec.unresolved_cycles(),
            "job not visible in either view"
        ),
        _ => tracing::debug!(job_id = %rec.job_id, external_id, to = %event.to, "job state changed"),
    }
}
