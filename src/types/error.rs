use std::io;

use super::ServiceKind;

/// Errors surfaced by the client layer. None of them is process-fatal.
#[derive(thiserror::Error, Debug)]
pub enum NimbusError {
    /// Transport failure (refused, reset, timed out).
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// No pooled connection could be leased or created in time.
    #[error("{kind} service unavailable after waiting {waited_ms} ms")]
    Unavailable {
        /// Connection kind that was requested.
        kind: ServiceKind,
        /// How long the caller waited.
        waited_ms: u64,
    },
    /// The remote side answered with a non-success status.
    #[error("{kind} service returned {status}: {message}")]
    Remote {
        /// Service that answered.
        kind: ServiceKind,
        /// Status code reported by the service.
        status: u16,
        /// Message reported by the service.
        message: String,
    },
    /// A response could not be decoded or was incomplete.
    #[error("protocol: {0}")]
    Protocol(String),
    /// The client is disconnected and reconnecting failed.
    #[error("{0} service disconnected")]
    Disconnected(ServiceKind),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a computed message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// A queued append was dropped before being sent.
    #[error("append cancelled before it was sent")]
    Cancelled,
    /// The component has been shut down.
    #[error("shut down")]
    ShutDown,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NimbusError>;

impl NimbusError {
    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NimbusError::Io(_) | NimbusError::Unavailable { .. } | NimbusError::Disconnected(_)
        )
    }

    /// Copies an error so it can be delivered to several waiters.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            NimbusError::Io(err) => NimbusError::Io(io::Error::new(err.kind(), err.to_string())),
            NimbusError::Unavailable { kind, waited_ms } => NimbusError::Unavailable {
                kind: *kind,
                waited_ms: *waited_ms,
            },
            NimbusError::Remote {
                kind,
                status,
                message,
            } => NimbusError::Remote {
                kind: *kind,
                status: *status,
                message: message.clone(),
            },
            NimbusError::Protocol(msg) => NimbusError::Protocol(msg.clone()),
            NimbusError::Disconnected(kind) => NimbusError::Disconnected(*kind),
            NimbusError::Invalid(msg) => NimbusError::Invalid(msg),
            NimbusError::InvalidOwned(msg) => NimbusError::InvalidOwned(msg.clone()),
            NimbusError::Config(msg) => NimbusError::Config(msg.clone()),
            NimbusError::Cancelled => NimbusError::Cancelled,
            NimbusError::ShutDown => NimbusError::ShutDown,
        }
    }
}
