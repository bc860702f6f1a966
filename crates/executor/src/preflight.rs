use std::path::PathBuf;

use crate::config::ExecutorConfig;
use crate::error::StartupError;

/// Resolve every scheduler verb on PATH. The first missing one is fatal.
pub fn check_verbs(cfg: &ExecutorConfig) -> Result<Vec<(String, PathBuf)>, StartupError> {
    cfg.verbs()
        .into_iter()
        .map(|verb| {
            which::which(verb)
                .map(|path| (verb.to_string(), path))
                .map_err(|_| StartupError::MissingVerb {
                    verb: verb.to_string(),
                })
        })
        .collect()
}
