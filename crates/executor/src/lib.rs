#![forbid(unsafe_code)]

//! Tokio shell around `donau-core`: runs `dsub`, `djob` and `dkill`, keeps
//! the job table, and turns scheduler output into job state transitions.

pub mod audit;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod poller;
pub mod preflight;
pub mod runner;
pub mod shutdown;
pub mod submit;
pub mod table;

pub use cancel::CancelReport;
pub use config::ExecutorConfig;
pub use error::{CancelError, StartupError, SubmitError};
pub use executor::Executor;
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
