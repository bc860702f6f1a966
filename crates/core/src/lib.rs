#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Functional core of the Donau executor: resource translation, command
//! construction, the job record model and the dual-view status state machine.
//!
//! Nothing in this crate performs I/O. The `donau-executor` crate runs the
//! scheduler verbs and feeds their output back through these functions.

pub mod backoff;
pub mod command;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod resources;
pub mod status;

mod util;

pub use error::{ConfigError, RecordError};
pub use model::{ExternalId, JobEvent, JobFailure, JobId, JobOutcome, JobRecord, JobRequest, JobState};
pub use util::{new_run_id, now_ms, run_tag};
