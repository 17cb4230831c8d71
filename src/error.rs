//! Error taxonomy for the VM manager
//!
//! Every fallible operation in the library returns [`VmmError`]. Low-level
//! failures are wrapped with the operation and the target (VM name, path)
//! at each layer through [`ResultExt`], so the error chain printed to the
//! user reads from the outermost operation down to the OS error.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, VmmError>;

#[derive(Debug, Error)]
pub enum VmmError {
    /// Missing file, record, binary or device
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Malformed mount spec, bad tag, bad name, bad size
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Non-zero exit from an external tool, with its combined output attached
    #[error("{tool} failed ({status}): {output}")]
    ExternalToolFailure {
        tool: String,
        status: String,
        output: String,
    },

    /// Operation not valid for the VM's current (reconciled) state
    #[error("cannot {operation} VM '{name}' in state {state}")]
    StateConflict {
        name: String,
        state: String,
        operation: String,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Firecracker API answered with a non-success status
    #[error("firecracker API error on {endpoint}: {status} - {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<VmmError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),

    #[error(transparent)]
    HyperClient(#[from] hyper_util::client::legacy::Error),

    #[error(transparent)]
    Download(#[from] reqwest::Error),
}

impl VmmError {
    pub fn not_found_path(what: &str, path: impl Into<PathBuf>) -> Self {
        VmmError::NotFound(format!("{} at {}", what, path.into().display()))
    }

    /// Innermost error after peeling off `Context` layers
    pub fn root(&self) -> &VmmError {
        match self {
            VmmError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            VmmError::NotFound(_) => true,
            VmmError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self.root(), VmmError::InvalidInput(_))
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self.root(), VmmError::StateConflict { .. })
    }
}

/// Attach operation/target context to a failing result
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<VmmError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| VmmError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| VmmError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}
