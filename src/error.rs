use std::{fmt, time::Duration};

/// Failure modes of the remote language/bookmark API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    NotFound,
    Transport(String),
    Timeout(Duration),
    Status(u16, String),
    Decode(String),
}

impl RemoteError {
    /// The remote confirmed the entity does not exist. Callers show "no such language"
    /// instead of "try again".
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound)
    }
}

impl std::error::Error for RemoteError {}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RemoteError::*;
        match self {
            NotFound => write!(f, "NotFound"),
            Transport(s) => write!(f, "Transport: {}", s),
            Timeout(d) => write!(f, "Timeout: no response after {}ms", d.as_millis()),
            Status(code, s) => write!(f, "Status {}: {}", code, s),
            Decode(s) => write!(f, "Decode: {}", s),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            RemoteError::Decode(crate::unpack_error(&error))
        } else {
            RemoteError::Transport(crate::unpack_error(&error))
        }
    }
}

/// Outcome of a failed sync pass. Cloneable so a single in-flight pass can hand the same
/// result to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("store: {0}")]
    Store(String),
}

impl SyncError {
    pub fn store(err: anyhow::Error) -> Self {
        SyncError::Store(format!("{:#}", err))
    }
}
