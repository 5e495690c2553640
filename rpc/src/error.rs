//! Error type shared by the messenger, reactors, and client API.
//!
//! Variants correspond to the status kinds callers branch on; the rendered
//! message keeps a stable prefix per kind so operators can grep logs and
//! tests can match on failure classes.

use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced by the messenger and its reactors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The service (or the messenger itself) cannot take the request.
    #[error("Service unavailable: {msg}")]
    ServiceUnavailable { msg: String, errno: Option<i32> },

    /// Socket-level failures: connect errors, resets, EOF, idle timeouts.
    #[error("Network error: {msg}")]
    NetworkError { msg: String, errno: Option<i32> },

    /// An operation was attempted against a component in the wrong state.
    #[error("Illegal state: {msg}")]
    IllegalState { msg: String },

    /// A deadline expired before the operation completed.
    #[error("Timed out: {msg}")]
    TimedOut { msg: String },

    /// The remote peer answered the call with an error payload.
    #[error("Remote error: {msg}")]
    RemoteError { msg: String },
}

impl RpcError {
    /// The status every path that observes a reactor's closing flag returns.
    pub(crate) fn shutdown() -> Self {
        RpcError::ServiceUnavailable {
            msg: "reactor is shutting down".to_string(),
            errno: Some(libc::ESHUTDOWN),
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        RpcError::ServiceUnavailable {
            msg: msg.into(),
            errno: None,
        }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        RpcError::NetworkError {
            msg: msg.into(),
            errno: None,
        }
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        RpcError::IllegalState { msg: msg.into() }
    }

    pub fn timed_out(msg: impl Into<String>) -> Self {
        RpcError::TimedOut { msg: msg.into() }
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        RpcError::RemoteError { msg: msg.into() }
    }

    /// Prefix the message, keeping the variant (and errno) intact.
    pub(crate) fn prepend(self, prefix: &str) -> Self {
        match self {
            RpcError::ServiceUnavailable { msg, errno } => RpcError::ServiceUnavailable {
                msg: format!("{prefix}: {msg}"),
                errno,
            },
            RpcError::NetworkError { msg, errno } => RpcError::NetworkError {
                msg: format!("{prefix}: {msg}"),
                errno,
            },
            RpcError::IllegalState { msg } => RpcError::IllegalState {
                msg: format!("{prefix}: {msg}"),
            },
            RpcError::TimedOut { msg } => RpcError::TimedOut {
                msg: format!("{prefix}: {msg}"),
            },
            RpcError::RemoteError { msg } => RpcError::RemoteError {
                msg: format!("{prefix}: {msg}"),
            },
        }
    }

    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, RpcError::ServiceUnavailable { .. })
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, RpcError::NetworkError { .. })
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self, RpcError::IllegalState { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, RpcError::TimedOut { .. })
    }

    /// The POSIX errno attached to the status, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            RpcError::ServiceUnavailable { errno, .. } => *errno,
            RpcError::NetworkError { errno, .. } => *errno,
            _ => None,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::NetworkError {
            errno: e.raw_os_error(),
            msg: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_status() {
        let e = RpcError::shutdown();
        assert!(e.is_service_unavailable());
        assert_eq!(e.errno(), Some(libc::ESHUTDOWN));
        assert_eq!(e.to_string(), "Service unavailable: reactor is shutting down");
    }

    #[test]
    fn test_message_prefixes() {
        assert_eq!(
            RpcError::network("got EOF from remote").to_string(),
            "Network error: got EOF from remote"
        );
        assert_eq!(
            RpcError::timed_out("call timed out").to_string(),
            "Timed out: call timed out"
        );
        assert_eq!(
            RpcError::remote("service queue is full").to_string(),
            "Remote error: service queue is full"
        );
    }

    #[test]
    fn test_prepend_keeps_variant() {
        let e = RpcError::illegal_state("negotiator pool is shutting down")
            .prepend("Unable to start connection negotiation thread");
        assert!(e.is_illegal_state());
        assert!(
            e.to_string()
                .contains("Unable to start connection negotiation thread")
        );
    }

    #[test]
    fn test_from_io_error() {
        let e: RpcError = io::Error::from_raw_os_error(libc::ECONNREFUSED).into();
        assert!(e.is_network_error());
        assert_eq!(e.errno(), Some(libc::ECONNREFUSED));
    }
}
