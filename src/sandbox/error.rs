//! Error taxonomy for the sandbox controller.
//!
//! Kinds are stable across the public surface:
//! - `Config` surfaces before any side effect
//! - `Boot` is fatal and triggers full reverse-order teardown
//! - `Exec` means the request failed at the protocol level (a nonzero exit
//!   code is a normal result, not an error)
//! - `File` never kills the sandbox
//! - `Crash` marks an unexpected VMM/vsock loss while running

use thiserror::Error;

/// Unified controller error.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::api::ConfigError),

    #[error("sandbox boot failed during {stage}: {source}")]
    Boot {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("exec failed: {0}")]
    Exec(#[from] crate::vsock::ControlError),

    #[error("file operation failed on {path}: errno {errno}")]
    File { path: String, errno: i32 },

    #[error("sandbox crashed: {0}")]
    Crash(String),

    #[error("sandbox is {0}, operation rejected")]
    WrongState(crate::state::Status),

    #[error("interactive exec is not supported by this backend")]
    NoPty,

    #[error("state bookkeeping failed: {0}")]
    State(#[from] crate::state::StateError),

    #[error("teardown finished with errors: {0}")]
    Close(String),
}

impl SandboxError {
    pub(crate) fn boot(
        stage: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SandboxError::Boot {
            stage,
            source: Box::new(source),
        }
    }
}
