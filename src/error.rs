//! Connector error taxonomy.

use std::fmt;
use std::time::Duration;

use crate::broker::BrokerError;
use crate::envelope::EnvelopeError;

/// Result type for connector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The wait that a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Requester waiting for a responder to claim its request.
    AwaitingAck,
    /// Responder waiting for the requester to confirm its claim.
    AwaitingConfirmation,
    /// Requester waiting for the final result.
    AwaitingResult,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingAck => f.write_str("awaiting ack"),
            Self::AwaitingConfirmation => f.write_str("awaiting confirmation"),
            Self::AwaitingResult => f.write_str("awaiting result"),
        }
    }
}

/// Errors surfaced by the messenger and the correlator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("Timed out {stage} after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Unexpected result payload: {0}")]
    Projection(String),

    #[error("Invalid reply: {0}")]
    InvalidReply(String),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },
}

impl Error {
    /// Whether a requester should retry the whole exchange after this error.
    ///
    /// A payload that cannot be sealed fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::RetriesExhausted { .. } | Self::Envelope(EnvelopeError::ReservedField(_))
        )
    }

    /// The innermost error, looking through retry exhaustion.
    pub fn last(&self) -> &Error {
        match self {
            Self::RetriesExhausted { last, .. } => last.last(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            stage: Stage::AwaitingAck,
            after: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "Timed out awaiting ack after 500ms");
    }

    #[test]
    fn test_exhaustion_is_terminal() {
        let err = Error::RetriesExhausted {
            attempts: 11,
            last: Box::new(Error::SubscriptionClosed),
        };
        assert!(!err.is_retryable());
        assert!(matches!(err.last(), Error::SubscriptionClosed));
        assert!(Error::Broker(BrokerError::ChannelClosed).is_retryable());
    }

    #[test]
    fn test_reserved_field_is_not_retried() {
        let err = Error::from(EnvelopeError::ReservedField("time".to_string()));
        assert!(!err.is_retryable());
        assert!(Error::from(EnvelopeError::Malformed("x".to_string())).is_retryable());
    }
}
