//! Unified error type hierarchy for kmodctl
//!
//! Provides structured error handling with RemoteError and the crate-wide
//! AppError. Operations whose contract is "never raises" (shell
//! execution, version resolution, load-state probing) do not use these types;
//! they return result objects instead.

use std::io;
use thiserror::Error;

/// Release-manifest fetch and decode errors.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Invalid manifest JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("All {attempts} fetch attempts failed: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Global error type for the kmodctl CLI surface.
///
/// Library components keep their "structured result, never a raw error"
/// contract; AppError is what the binary maps those results into when an
/// operation cannot complete.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Privileged command failed (e.g., insmod, rmmod, dmesg)
    #[error("Command '{cmd}' failed: {reason}")]
    OsCommand { cmd: String, reason: String },

    /// Root access unavailable or denied
    #[error("Root access unavailable: {0}")]
    RootUnavailable(String),

    /// Module lifecycle operation rejected
    #[error("Module operation rejected: {0}")]
    ModuleRejected(String),

    /// No matching module artifact, locally or remotely
    #[error("Module artifact not found: {0}")]
    ArtifactMissing(String),

    /// File I/O error (read/write/delete)
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid input (e.g., parameter name with shell metacharacters)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Remote manifest fetch failed
    #[error("Remote fetch failed: {0}")]
    Remote(String),
}

impl AppError {
    /// Get a user-facing error message suitable for terminal display
    pub fn user_message(&self) -> String {
        match self {
            AppError::OsCommand { cmd, reason } => {
                format!("Failed to execute '{}': {}", cmd, reason)
            }
            AppError::RootUnavailable(msg) => {
                format!("Root access unavailable: {}", msg)
            }
            AppError::ModuleRejected(msg) => format!("Module operation rejected: {}", msg),
            AppError::ArtifactMissing(msg) => format!("No module artifact found: {}", msg),
            AppError::Io(msg) => format!("File operation failed: {}", msg),
            AppError::InvalidInput(msg) => format!("Invalid input: {}", msg),
            AppError::Remote(msg) => format!("Release lookup failed: {}", msg),
        }
    }
}

impl From<io::Error> for AppError {
    fn from(e: io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        AppError::Remote(e.to_string())
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Io(s)
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Io(s.to_string())
    }
}

/// Top-level result type for operations that may fail.
/// Use this as the return type for all fallible functions.
/// Example: `fn risky_operation() -> Result<String>`
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
