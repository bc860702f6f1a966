//! Dual-view status reconciliation.
//!
//! One poll cycle asks the active view about a batch of ids, then asks the
//! historical view about whatever the active view did not report. The two
//! answers are merged into one [`Resolution`] per id and applied to the
//! owning [`JobRecord`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{ExternalId, JobEvent, JobRecord, JobState, PollNote, MAX_POLL_NOTES};
use crate::status::{phase_of, Phase};

/// Which scheduler view produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Queued and running jobs.
    Active,
    /// Finished jobs, rotated out of the active view.
    History,
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            View::Active => "active",
            View::History => "history",
        })
    }
}

/// Merged verdict for one id in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Reported by at least one view.
    Observed {
        /// Raw status string.
        status: String,
        /// Phase of `status`.
        phase: Phase,
        /// View the status came from.
        source: View,
    },
    /// Reported by neither view.
    Absent,
    /// A query failed; nothing can be concluded this cycle.
    Unknown,
}

/// Ids from `batch` the active view did not report. These, and only these,
/// go to the historical view.
pub fn history_candidates(
    batch: &BTreeSet<ExternalId>,
    active: &BTreeMap<ExternalId, String>,
) -> BTreeSet<ExternalId> {
    batch
        .iter()
        .filter(|id| !active.contains_key(*id))
        .cloned()
        .collect()
}

/// Merge both views into one resolution per batch id.
///
/// `None` means the query for that view failed. A failed active query makes
/// the whole batch `Unknown`; a failed historical query makes only the ids
/// the active view missed `Unknown`. When both views report an id, the
/// historical answer wins.
pub fn merge_views(
    batch: &BTreeSet<ExternalId>,
    active: Option<&BTreeMap<ExternalId, String>>,
    history: Option<&BTreeMap<ExternalId, String>>,
) -> BTreeMap<ExternalId, Resolution> {
    let Some(active) = active else {
        return batch
            .iter()
            .map(|id| (id.clone(), Resolution::Unknown))
            .collect();
    };

    batch
        .iter()
        .map(|id| {
            let from_history = history.and_then(|h| h.get(id));
            let resolution = match (from_history, active.get(id)) {
                (Some(status), _) => observed(status, View::History),
                (None, Some(status)) => observed(status, View::Active),
                (None, None) if history.is_some() => Resolution::Absent,
                (None, None) => Resolution::Unknown,
            };
            (id.clone(), resolution)
        })
        .collect()
}

fn observed(status: &str, source: View) -> Resolution {
    Resolution::Observed {
        status: status.to_string(),
        phase: phase_of(status),
        source,
    }
}

impl JobRecord {
    /// Apply one cycle's verdict.
    ///
    /// Ignored when the record is terminal or `ticket` is not newer than the
    /// last applied ticket. `Unknown` only releases the in-flight slot.
    /// `Absent` increments the unresolved counter and turns into `Lost` on
    /// the `max_unresolved`-th consecutive miss. While a cancel is pending
    /// only terminal observations are applied.
    pub fn apply_resolution(
        &mut self,
        resolution: &Resolution,
        ticket: u64,
        now_ms: i64,
        max_unresolved: u32,
    ) -> Option<JobEvent> {
        if self.in_flight == Some(ticket) {
            self.in_flight = None;
        }
        if self.state.is_terminal() || ticket <= self.last_applied_ticket {
            return None;
        }
        if matches!(resolution, Resolution::Unknown) {
            return None;
        }
        self.last_applied_ticket = ticket;
        self.last_polled_at_ms = Some(now_ms);

        let (next, verdict) = match resolution {
            Resolution::Observed {
                status,
                phase,
                source,
            } => {
                self.unresolved_cycles = 0;
                self.last_status = Some(status.clone());
                let next = match phase {
                    Phase::Active => JobState::Active,
                    Phase::Succeeded => JobState::Succeeded,
                    Phase::Failed => JobState::Failed,
                };
                (next, format!("{source}:{status}"))
            }
            Resolution::Absent => {
                self.unresolved_cycles = self.unresolved_cycles.saturating_add(1);
                let next = if self.unresolved_cycles >= max_unresolved.max(1) {
                    JobState::Lost
                } else {
                    JobState::Unresolved
                };
                (next, "absent".to_string())
            }
            Resolution::Unknown => return None,
        };

        self.push_note(
            PollNote {
                ticket,
                at_ms: now_ms,
                verdict,
            },
            MAX_POLL_NOTES.max(max_unresolved as usize),
        );

        if self.cancel_requested && !next.is_terminal() {
            return None;
        }
        self.transition(next, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobId;
    use std::path::PathBuf;

    fn ids(v: &[&str]) -> BTreeSet<ExternalId> {
        v.iter().map(|s| ExternalId::from(*s)).collect()
    }

    fn statuses(v: &[(&str, &str)]) -> BTreeMap<ExternalId, String> {
        v.iter()
            .map(|(id, s)| (ExternalId::from(*id), s.to_string()))
            .collect()
    }

    fn submitted(ext: &str) -> JobRecord {
        let mut rec = JobRecord::new(JobId(1), "r", vec![], PathBuf::from("/l"), 0);
        rec.assign_external_id(ext.into(), 0).unwrap();
        rec
    }

    #[test]
    fn history_only_asked_about_ids_missing_from_active() {
        let batch = ids(&["A", "B", "C"]);
        let active = statuses(&[("A", "RUNNING")]);
        assert_eq!(history_candidates(&batch, &active), ids(&["B", "C"]));
    }

    #[test]
    fn merge_three_way_scenario() {
        let batch = ids(&["A", "B", "C"]);
        let active = statuses(&[("A", "RUNNING")]);
        let history = statuses(&[("B", "FINISHED")]);
        let merged = merge_views(&batch, Some(&active), Some(&history));

        assert!(matches!(
            merged[&ExternalId::from("A")],
            Resolution::Observed { phase: Phase::Active, source: View::Active, .. }
        ));
        assert!(matches!(
            merged[&ExternalId::from("B")],
            Resolution::Observed { phase: Phase::Succeeded, source: View::History, .. }
        ));
        assert_eq!(merged[&ExternalId::from("C")], Resolution::Absent);
    }

    #[test]
    fn history_wins_on_conflict() {
        let batch = ids(&["A"]);
        let active = statuses(&[("A", "RUNNING")]);
        let history = statuses(&[("A", "FAILED")]);
        let merged = merge_views(&batch, Some(&active), Some(&history));
        assert!(matches!(
            merged[&ExternalId::from("A")],
            Resolution::Observed { phase: Phase::Failed, source: View::History, .. }
        ));
    }

    #[test]
    fn failed_queries_resolve_to_unknown() {
        let batch = ids(&["A", "B"]);
        let merged = merge_views(&batch, None, None);
        assert!(merged.values().all(|r| *r == Resolution::Unknown));

        let active = statuses(&[("A", "RUNNING")]);
        let merged = merge_views(&batch, Some(&active), None);
        assert!(matches!(merged[&ExternalId::from("A")], Resolution::Observed { .. }));
        assert_eq!(merged[&ExternalId::from("B")], Resolution::Unknown);
    }

    #[test]
    fn lost_after_exactly_n_misses() {
        let mut rec = submitted("C");
        for ticket in 1..3 {
            let ev = rec.apply_resolution(&Resolution::Absent, ticket, 10, 3);
            assert_eq!(rec.state(), JobState::Unresolved);
            assert_eq!(ev.is_some(), ticket == 1);
        }
        assert_eq!(rec.unresolved_cycles(), 2);
        let ev = rec.apply_resolution(&Resolution::Absent, 3, 10, 3).unwrap();
        assert_eq!(ev.to, JobState::Lost);
        assert_eq!(rec.notes().count(), 3);
    }

    #[test]
    fn seeing_the_job_again_resets_the_counter() {
        let mut rec = submitted("C");
        rec.apply_resolution(&Resolution::Absent, 1, 10, 3);
        rec.apply_resolution(&Resolution::Absent, 2, 10, 3);
        rec.apply_resolution(&observed("RUNNING", View::Active), 3, 10, 3);
        assert_eq!(rec.unresolved_cycles(), 0);
        assert_eq!(rec.state(), JobState::Active);
        rec.apply_resolution(&Resolution::Absent, 4, 10, 3);
        assert_eq!(rec.state(), JobState::Unresolved);
    }

    #[test]
    fn long_miss_streaks_keep_every_note() {
        let n = MAX_POLL_NOTES as u32 + 8;
        let mut rec = submitted("C");
        rec.apply_resolution(&observed("RUNNING", View::Active), 1, 10, n);
        for ticket in 2..(n as u64 + 2) {
            rec.apply_resolution(&Resolution::Absent, ticket, 10, n);
        }
        assert_eq!(rec.state(), JobState::Lost);
        let absent = rec.notes().filter(|note| note.verdict == "absent").count();
        assert_eq!(absent, n as usize);
        assert_eq!(rec.notes().next().map(|note| note.ticket), Some(2));
    }

    #[test]
    fn stale_tickets_are_ignored() {
        let mut rec = submitted("A");
        rec.apply_resolution(&observed("RUNNING", View::Active), 5, 10, 3);
        let ev = rec.apply_resolution(&observed("FAILED", View::Active), 4, 11, 3);
        assert!(ev.is_none());
        assert_eq!(rec.state(), JobState::Active);
        assert_eq!(rec.last_status(), Some("RUNNING"));
    }

    #[test]
    fn terminal_records_never_move() {
        let mut rec = submitted("A");
        rec.apply_resolution(&observed("DONE", View::History), 1, 10, 3);
        assert_eq!(rec.state(), JobState::Succeeded);
        for (ticket, r) in [
            (2, observed("RUNNING", View::Active)),
            (3, observed("FAILED", View::History)),
            (4, Resolution::Absent),
        ] {
            assert!(rec.apply_resolution(&r, ticket, 10, 1).is_none());
        }
        assert_eq!(rec.state(), JobState::Succeeded);
        assert!(rec.cancel(20).is_none());
    }

    #[test]
    fn unknown_changes_nothing_but_releases_the_slot() {
        let mut rec = submitted("A");
        assert!(rec.begin_query(1));
        assert!(rec.apply_resolution(&Resolution::Unknown, 1, 10, 1).is_none());
        assert_eq!(rec.state(), JobState::Pending);
        assert_eq!(rec.unresolved_cycles(), 0);
        assert!(rec.in_flight().is_none());
    }

    #[test]
    fn pending_cancel_suppresses_non_terminal_updates() {
        let mut rec = submitted("A");
        rec.request_cancel();
        assert!(rec
            .apply_resolution(&observed("RUNNING", View::Active), 1, 10, 3)
            .is_none());
        assert_eq!(rec.state(), JobState::Pending);
        let ev = rec
            .apply_resolution(&observed("FINISHED", View::History), 2, 10, 3)
            .unwrap();
        assert_eq!(ev.to, JobState::Succeeded);
    }
}
