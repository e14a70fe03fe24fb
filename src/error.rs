//! Error types for vpnprov

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Setup file missing or unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// External tool exited non-zero
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A lock marker is already present on disk
    #[error("Lock file {} already exists. Another instance may be running.", .lock.display())]
    Contention { lock: PathBuf },

    /// No free host address left in a peer table subnet
    #[error("No available IPs in the {network} subnet")]
    Exhausted { network: String },

    /// Malformed input (peer table, key file, PEM)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Identity absent from the subsystem
    #[error("Not found: {0}")]
    NotFound(String),

    /// Xray control API could not be reached
    #[error("Xray API unavailable: {0}")]
    XrayUnavailable(String),

    /// Xray control API refused the request (duplicate or unknown user)
    #[error("Xray API rejected request: {0}")]
    XrayRejected(String),

    /// Local Xray user table error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ProvisionError {
    pub fn is_contention(&self) -> bool {
        matches!(self, ProvisionError::Contention { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_))
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(error: serde_json::Error) -> Self {
        ProvisionError::Parse(error.to_string())
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
