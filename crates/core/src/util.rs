use std::time::{SystemTime, UNIX_EPOCH};

use ulid::Ulid;

/// Returns current unix epoch milliseconds.
pub fn now_ms() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as i64
}

/// Generates the id of one executor run. Every job name submitted during the
/// run carries a short tag derived from it.
pub fn new_run_id() -> Ulid {
    Ulid::new()
}

/// Short, lowercase tag for a run id (the last eight characters, which hold
/// the random part of the ULID).
pub fn run_tag(run_id: &Ulid) -> String {
    let s = run_id.to_string().to_lowercase();
    s[s.len() - 8..].to_string()
}
