//! CLI-level errors. Mirrors the teacher's `error::CliError`: a thin enum
//! wrapping the library's own error types plus CLI-only failure modes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid arguments: {0}")]
    Args(String),

    #[error(transparent)]
    Engine(#[from] rasteract::EngineError),

    #[error("failed to install Ctrl+C handler: {0}")]
    Signal(#[from] ctrlc::Error),
}
