//! Append-only JSON-lines record of everything said to and heard from the
//! scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use donau_core::status::CancelVerdict;
use donau_core::{now_ms, ExternalId, JobEvent, JobId};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent<'a> {
    SubmitAttempt {
        job_id: JobId,
        attempt: u32,
        argv: &'a [String],
        exit_code: Option<i32>,
        output: &'a str,
    },
    Submitted {
        job_id: JobId,
        external_id: &'a ExternalId,
    },
    Query {
        ticket: u64,
        history: bool,
        ids: &'a [ExternalId],
        exit_code: Option<i32>,
        output: &'a str,
    },
    Transition(&'a JobEvent),
    Cancel {
        ids: &'a [ExternalId],
        exit_code: Option<i32>,
        output: &'a str,
        verdicts: &'a BTreeMap<ExternalId, CancelVerdict>,
    },
}

#[derive(Serialize)]
struct Line<'a> {
    at_ms: i64,
    run_id: &'a str,
    #[serde(flatten)]
    event: &'a AuditEvent<'a>,
}

/// Writes are best effort: a failure is logged and otherwise ignored.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<tokio::fs::File>>,
}

impl AuditLog {
    /// Open `path` for appending, creating parent directories.
    pub async fn open(path: &Path, run_id: impl Into<String>) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            run_id: run_id.into(),
            file: Mutex::new(Some(file)),
        })
    }

    /// A log that drops everything.
    pub fn disabled(run_id: impl Into<String>) -> Self {
        Self {
            path: PathBuf::new(),
            run_id: run_id.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, event: AuditEvent<'_>) {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };
        let line = Line {
            at_ms: now_ms(),
            run_id: &self.run_id,
            event: &event,
        };
        let mut buf = match serde_json::to_vec(&line) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!(error = %e, "audit serialize failed");
                return;
            }
        };
        buf.push(b'\n');
        if let Err(e) = file.write_all(&buf).await {
            tracing::warn!(error = %e, path = %self.path.display(), "audit write failed");
            return;
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(error = %e, path = %self.path.display(), "audit flush failed");
        }
    }
}
