use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("librespot binary not found at {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("failed to start librespot: {0}")]
    LaunchFailed(#[source] std::io::Error),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DaemonError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DaemonError::Timeout
        } else {
            DaemonError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::InvalidResponse(e.to_string())
    }
}

impl DaemonError {
    /// True when the failure means "the remote API answered", as opposed
    /// to a transport-level problem.
    pub fn is_reachable(&self) -> bool {
        matches!(self, DaemonError::Api { .. })
    }
}
