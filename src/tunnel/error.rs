//! Tunnel error types

use thiserror::Error;

/// Errors raised while establishing, verifying, or tearing down a tunnel.
///
/// The taxonomy matters: [`TunnelError::is_transient`] decides whether the
/// establish loop is allowed to retry. Network-level failures are worth
/// another attempt; a server that rejected our password is not.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("no session on port {0}")]
    NoSession(u16),
}

impl TunnelError {
    /// Whether the establish loop may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, TunnelError::Transport(_) | TunnelError::Timeout(_))
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Transport(err.to_string())
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        match err {
            // Socket-level failures (refused, unreachable, reset) arrive as IO.
            russh::Error::IO(e) => TunnelError::Transport(e.to_string()),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_timeout_are_transient() {
        assert!(TunnelError::Transport("connection refused".into()).is_transient());
        assert!(TunnelError::Timeout("connect".into()).is_transient());
    }

    #[test]
    fn protocol_class_errors_are_fatal() {
        assert!(!TunnelError::Auth("rejected".into()).is_transient());
        assert!(!TunnelError::Protocol("kex failed".into()).is_transient());
        assert!(!TunnelError::Verification("proxy unreachable".into()).is_transient());
        assert!(!TunnelError::NoSession(1080).is_transient());
    }

    #[test]
    fn io_errors_map_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        match TunnelError::from(io) {
            TunnelError::Transport(_) => {}
            other => panic!("expected Transport, got {other:?}"),
        }
    }
}
