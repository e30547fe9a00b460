//! Session layer errors.
//!
//! Every error here is scoped to one request or one session. Nothing is fatal
//! to the process.

use thiserror::Error;

use crate::stream_id::StreamId;

/// HTTP-equivalent status for policy violations.
pub const FORBIDDEN: u16 = 403;
/// HTTP-equivalent status for unknown or dead sessions.
pub const NOT_FOUND: u16 = 404;
/// HTTP-equivalent status for requests whose connection is gone.
pub const GONE: u16 = 410;
/// HTTP-equivalent status when no session can be allocated.
pub const SERVICE_UNAVAILABLE: u16 = 503;

#[derive(Debug, Error)]
pub enum BoshError {
    /// The client broke a binding rule. Never retried internally.
    #[error("{message}")]
    Policy {
        message: String,
        status: u16,
        close_session: bool,
    },

    /// Delivery was attempted on a connection that was already answered,
    /// closed, or abandoned by its requester.
    #[error("connection {rid} was already delivered to or closed")]
    ConnectionConsumed { rid: u64 },

    /// The waiting side of a connection saw it closed without a response.
    #[error("connection {rid} closed without a response")]
    ConnectionClosed { rid: u64 },

    #[error("session not found: {0}")]
    SessionNotFound(StreamId),

    #[error("session {0} is closed")]
    SessionClosed(StreamId),

    #[error("could not allocate an unused stream id after {0} attempts")]
    StreamIdExhausted(usize),
}

impl BoshError {
    /// A non-secure connection arrived on a session started over a secure channel.
    pub fn insecure_connection() -> Self {
        BoshError::Policy {
            message: "Session was started from secure connection, all connections on this \
                      session must be secured."
                .to_string(),
            status: FORBIDDEN,
            close_session: false,
        }
    }

    /// Two polls arrived closer together than the advertised polling interval.
    pub fn polling_too_frequent() -> Self {
        BoshError::Policy {
            message: "Too frequent polling".to_string(),
            status: FORBIDDEN,
            close_session: true,
        }
    }

    /// HTTP-equivalent status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            BoshError::Policy { status, .. } => *status,
            BoshError::ConnectionConsumed { .. } | BoshError::ConnectionClosed { .. } => GONE,
            BoshError::SessionNotFound(_) | BoshError::SessionClosed(_) => NOT_FOUND,
            BoshError::StreamIdExhausted(_) => SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the caller must terminate the session as a consequence.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            BoshError::Policy {
                close_session: true,
                ..
            }
        )
    }

    /// Whether this is a protocol policy violation.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, BoshError::Policy { .. })
    }
}
