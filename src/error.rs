use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Everything that can go wrong during a voice session.
///
/// Only the first three variants end a session. The rest are logged where
/// they happen and the conversation carries on.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Microphone access refused or no usable input device.
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    /// The remote endpoint rejected the transport handshake.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Token fetch or transport I/O failed.
    #[error("network error: {0}")]
    NetworkError(String),

    /// One inbound control message could not be parsed.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The remote endpoint sent an `error` event.
    #[error("remote error ({}): {message}", code.as_deref().unwrap_or("unknown"))]
    ProtocolError {
        code: Option<String>,
        message: String,
    },

    /// The usage debit request failed.
    #[error("billing request failed: {0}")]
    BillingRequestFailed(String),
}

impl SessionError {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_)
                | SessionError::NegotiationFailed(_)
                | SessionError::NetworkError(_)
        )
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::NetworkError(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::MalformedMessage(err.to_string())
    }
}
