//! Connection error taxonomy

use thiserror::Error;

use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum ConnectError {
    /// Proxy-jump chain could not be resolved; callers fall back to direct
    #[error("Chain resolution failed: {0}")]
    ChainResolution(String),

    #[error("Host key for {host} ({algorithm}) was rejected")]
    HostKeyRejected { host: String, algorithm: String },

    #[error("Authentication cancelled by user")]
    AuthenticationCancelled,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("A connection attempt is already in flight for session {0}")]
    AlreadyConnecting(SessionId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} is not a {1} session")]
    WrongSessionKind(SessionId, &'static str),

    #[error("Trust store error: {0}")]
    TrustStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Key error: {0}")]
    Key(String),
}

impl ConnectError {
    /// Transport-level failures are the only ones serial reconnect retries
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConnectError::Transport(_)
                | ConnectError::Timeout(_)
                | ConnectError::Io(_)
                | ConnectError::Protocol(_)
        )
    }
}

impl From<russh::Error> for ConnectError {
    fn from(err: russh::Error) -> Self {
        ConnectError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for ConnectError {
    fn from(err: russh::keys::Error) -> Self {
        ConnectError::Key(err.to_string())
    }
}

// Plain-string serialization so errors can cross an IPC boundary
impl serde::Serialize for ConnectError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(ConnectError::Transport("reset".into()).is_transport());
        assert!(ConnectError::Timeout("slow".into()).is_transport());
        assert!(!ConnectError::AuthenticationCancelled.is_transport());
        assert!(!ConnectError::HostKeyRejected {
            host: "h".into(),
            algorithm: "ssh-ed25519".into()
        }
        .is_transport());
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&ConnectError::AuthenticationCancelled).unwrap();
        assert_eq!(json, "\"Authentication cancelled by user\"");
    }
}
