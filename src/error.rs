use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ca::CaDomain;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors shared by every layer, from the store up to the tunnel.
///
/// The enum is serializable so a failure keeps its kind when it crosses the
/// tunnel.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum Error {
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} has expired")]
    Expired(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("{0} certificate authority is not initialized")]
    NotInitialized(CaDomain),
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("compare failed: {0}")]
    CompareFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("connection error: {0}")]
    Connection(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn bad_parameter(what: impl Into<String>) -> Self {
        Self::BadParameter(what.into())
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Fold `Expired` into `NotFound`; callers outside the process cannot tell
    /// the two apart.
    #[must_use]
    pub fn at_boundary(self) -> Self {
        match self {
            Self::Expired(what) => Self::NotFound(what),
            other => other,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
