use donau_core::{ConfigError, ExternalId, JobId, RecordError};
use thiserror::Error;

/// Why a job could not be handed to the scheduler. No live job record
/// exists after any of these.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// Resources failed validation; nothing was run.
    #[error("invalid resources for job {job_id}: {source}")]
    Config {
        /// Engine job id.
        job_id: JobId,
        /// Validation failure.
        #[source]
        source: ConfigError,
    },

    /// The scheduler rejected the job in a way retrying cannot fix.
    #[error("submit of job {job_id} rejected: {output}")]
    Permanent {
        /// Engine job id.
        job_id: JobId,
        /// Combined submit output.
        output: String,
    },

    /// Every attempt failed transiently.
    #[error("submit of job {job_id} failed after {attempts} attempts: {last_output}")]
    Exhausted {
        /// Engine job id.
        job_id: JobId,
        /// Attempts made.
        attempts: u32,
        /// Output of the final attempt.
        last_output: String,
    },

    /// The submit verb succeeded but printed no job id.
    #[error("could not parse a scheduler job id for job {job_id} from: {output}")]
    UnparseableId {
        /// Engine job id.
        job_id: JobId,
        /// Submit stdout.
        output: String,
    },

    /// The engine reused a job id that is still tracked or being submitted.
    #[error("job {0} is already tracked")]
    Duplicate(JobId),

    /// Shutdown began before the job was handed over. When `external_id` is
    /// set the scheduler had already accepted it and it has been cancelled.
    #[error("executor shutting down; job {job_id} not submitted")]
    ShuttingDown {
        /// Engine job id.
        job_id: JobId,
        /// Scheduler id of a job accepted during shutdown.
        external_id: Option<ExternalId>,
    },

    /// Preparing the log directory failed.
    #[error("cannot prepare log directory: {0}")]
    Io(#[from] std::io::Error),

    /// A job record invariant was violated.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Fatal problems found before any job is accepted.
#[derive(Debug, Error)]
pub enum StartupError {
    /// A scheduler verb is not on PATH.
    #[error("`{verb}` not found on PATH; is the Donau client installed?")]
    MissingVerb {
        /// Verb name as configured.
        verb: String,
    },
}

/// Problems during bulk cancellation. Logged, never propagated as fatal.
#[derive(Debug, Error)]
pub enum CancelError {
    /// The cancel verb could not be started.
    #[error("cancel verb failed to run: {0}")]
    Spawn(#[from] std::io::Error),

    /// The cancel verb did not finish in time.
    #[error("cancel verb timed out after {0:?}")]
    Timeout(std::time::Duration),
}
