use thiserror::Error;

/// Everything that can go wrong between submitting a turn and getting text back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Connection refused, DNS failure, timeout, or a body read that broke off.
    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("backend returned {status}: {detail}")]
    Backend { status: u16, detail: String },

    /// The backend said 200 but the body isn't text we can show.
    #[error("backend response is not valid UTF-8")]
    Undecodable,
}

impl ChatError {
    pub fn network(reason: impl Into<String>) -> Self {
        ChatError::Network { reason: reason.into() }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Network { .. } => true,
            ChatError::Backend { status, .. } => *status >= 500,
            ChatError::Undecodable => false,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        // A timed-out request never produced a response, so it is a transport
        // failure: retryable, and shown with the same notice as a backend error.
        if err.is_timeout() {
            ChatError::network("request timed out")
        } else if let Some(status) = err.status() {
            ChatError::Backend {
                status: status.as_u16(),
                detail: err.to_string(),
            }
        } else {
            ChatError::network(err.to_string())
        }
    }
}
