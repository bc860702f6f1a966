use thiserror::Error;

/// Invalid resource values. Raised before any command is built, so a job
/// that fails here is never submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric resource was negative.
    #[error("resource `{field}` must not be negative (got {value})")]
    Negative {
        /// Resource key as the engine spells it.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// Cores, memory or node count was zero.
    #[error("resource `{field}` must be at least 1")]
    Zero {
        /// Resource key as the engine spells it.
        field: &'static str,
    },

    /// A value does not fit the scheduler's integer range.
    #[error("resource `{field}` is out of range (got {value})")]
    OutOfRange {
        /// Resource key as the engine spells it.
        field: &'static str,
        /// Offending value.
        value: i64,
    },

    /// Tags are passed through as `key=value`.
    #[error("tag `{0}` must have the form key=value")]
    MalformedTag(String),
}

/// Violations of the job record invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// The scheduler id of a record is write-once.
    #[error("job {job_id} already has external id {existing}")]
    ExternalIdAlreadyAssigned {
        /// Internal job id.
        job_id: u64,
        /// Id that was assigned first.
        existing: String,
    },
}
