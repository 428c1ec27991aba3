use std::time::Duration;

/// Failures from the live, TTS and LLM collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Server-side 5xx; the only class retried with backoff.
    #[error("transient upstream failure ({status}): {message}")]
    Transient { status: u16, message: String },
    #[error("upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown voice: {0}")]
    NoSuchVoice(String),
    #[error("connection closed")]
    Closed,
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool { matches!(self, UpstreamError::Transient { .. }) }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (500..600).contains(&status) {
            UpstreamError::Transient { status, message }
        } else {
            UpstreamError::Rejected { status, message }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for UpstreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => UpstreamError::Closed,
            WsError::Http(resp) => UpstreamError::from_status(resp.status().as_u16(), "websocket handshake refused"),
            WsError::Protocol(p) => UpstreamError::Protocol(p.to_string()),
            other => UpstreamError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return UpstreamError::Transport(format!("request timed out: {e}"));
        }
        match e.status() {
            Some(s) => UpstreamError::from_status(s.as_u16(), e.to_string()),
            None => UpstreamError::Transport(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_server_errors_are_transient() {
        assert!(UpstreamError::from_status(503, "busy").is_transient());
        assert!(UpstreamError::from_status(500, "boom").is_transient());
        assert!(!UpstreamError::from_status(429, "slow down").is_transient());
        assert!(!UpstreamError::from_status(400, "bad").is_transient());
        assert!(!UpstreamError::Transport("reset".into()).is_transient());
    }
}
