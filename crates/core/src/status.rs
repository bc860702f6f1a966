//! Parsing of scheduler verb output.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::model::ExternalId;

/// Status strings meaning the job finished successfully.
pub const SUCCESS_STATUSES: &[&str] = &["FINISHED", "SUCCEEDED", "DONE", "0"];
/// Status strings meaning the job finished with a failure.
pub const FAILURE_STATUSES: &[&str] = &[
    "FAILED",
    "ABORTED",
    "TIMEOUT",
    "NODE_FAIL",
    "TERMINATED",
    "EXIT",
];

/// Submit output fragments that make retrying pointless. Matched
/// case-insensitively as substrings.
pub const DEFAULT_PERMANENT_PATTERNS: &[&str] = &[
    "invalid queue",
    "queue does not exist",
    "no such queue",
    "invalid resource",
    "malformed",
    "permission denied",
    "not authorized",
    "unknown option",
    "invalid option",
];

/// Coarse lifecycle phase of a scheduler status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Queued, running, or anything unrecognised.
    Active,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure.
    Failed,
}

/// Map a status string to its phase. Unknown strings are `Active`.
pub fn phase_of(status: &str) -> Phase {
    let s = status.trim().to_ascii_uppercase();
    if SUCCESS_STATUSES.contains(&s.as_str()) {
        Phase::Succeeded
    } else if FAILURE_STATUSES.contains(&s.as_str()) {
        Phase::Failed
    } else {
        Phase::Active
    }
}

fn bracketed_id() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(\d+)>").expect("static regex"))
}

fn leading_id() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\d+)").expect("static regex"))
}

/// Extract the external id from submit stdout: the first `<digits>`, else
/// leading digits.
pub fn parse_submit_output(stdout: &str) -> Option<ExternalId> {
    bracketed_id()
        .captures(stdout)
        .or_else(|| leading_id().captures(stdout))
        .and_then(|c| c.get(1))
        .map(|m| ExternalId::new(m.as_str()))
}

/// Parse two-column `jobid state` output, keeping only ids in `batch`.
///
/// Blank lines, lines with fewer than two columns and ids outside the batch
/// are skipped. When an id appears twice the last line wins.
pub fn parse_query_output(
    raw: &str,
    batch: &BTreeSet<ExternalId>,
) -> BTreeMap<ExternalId, String> {
    let mut out = BTreeMap::new();
    for line in raw.lines() {
        let mut cols = line.split_whitespace();
        let (Some(id), Some(state)) = (cols.next(), cols.next()) else {
            continue;
        };
        let id = ExternalId::from(id);
        if batch.contains(&id) {
            out.insert(id, state.to_string());
        }
    }
    out
}

/// Whether a failed submit is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Retry with backoff.
    Transient,
    /// Give up now.
    Permanent,
}

/// Classify a failed submit by its combined output.
pub fn classify_submit_failure<S: AsRef<str>>(output: &str, permanent_patterns: &[S]) -> FailureKind {
    let lower = output.to_lowercase();
    if permanent_patterns
        .iter()
        .any(|p| !p.as_ref().is_empty() && lower.contains(&p.as_ref().to_lowercase()))
    {
        FailureKind::Permanent
    } else {
        FailureKind::Transient
    }
}

/// What the cancel verb said about one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelVerdict {
    /// The scheduler confirmed the kill.
    Cancelled,
    /// The job was unknown or already finished; counts as cancelled.
    AlreadyGone,
    /// No confirmation either way.
    Unconfirmed,
}

impl CancelVerdict {
    /// True unless unconfirmed.
    pub fn is_success(self) -> bool {
        !matches!(self, CancelVerdict::Unconfirmed)
    }
}

const GONE_MARKERS: &[&str] = &[
    "not exist",
    "not found",
    "no such job",
    "already finished",
    "already completed",
    "has finished",
    "is finished",
    "already terminated",
];

/// True when scheduler output says some job is unknown or already gone.
pub fn mentions_missing_job(output: &str) -> bool {
    let lower = output.to_lowercase();
    GONE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Read cancel output per id.
///
/// A line naming an id together with a "gone" marker makes that id
/// `AlreadyGone`. On a zero exit status every other id is `Cancelled`;
/// otherwise ids named on a line without a gone marker are `Cancelled` and
/// the rest stay `Unconfirmed`.
pub fn classify_cancel_output(
    ids: &[ExternalId],
    output: &str,
    exit_code: Option<i32>,
) -> BTreeMap<ExternalId, CancelVerdict> {
    let succeeded = exit_code == Some(0);
    let lines: Vec<String> = output.lines().map(str::to_lowercase).collect();

    ids.iter()
        .map(|id| {
            let mentions: Vec<&String> = lines
                .iter()
                .filter(|l| mentions_id(l, id.as_str()))
                .collect();
            let gone = mentions
                .iter()
                .any(|l| GONE_MARKERS.iter().any(|m| l.contains(m)));
            let verdict = if gone {
                CancelVerdict::AlreadyGone
            } else if succeeded || !mentions.is_empty() {
                CancelVerdict::Cancelled
            } else {
                CancelVerdict::Unconfirmed
            };
            (id.clone(), verdict)
        })
        .collect()
}

fn mentions_id(line: &str, id: &str) -> bool {
    line.split(|c: char| !c.is_ascii_digit())
        .any(|tok| tok == id)
}
