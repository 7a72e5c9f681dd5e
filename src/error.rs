//! Secure-conversation error types.
//!
//! One crate-level enum covers the whole control plane. The variants fall
//! into five families with different recovery rules:
//!
//! - **Timeout**: a deadline budget ran out. The negotiation path attaches
//!   how many legs completed and how much budget was left.
//! - **Protocol / negotiation failures**: the peer (or a driver) violated
//!   the exchange - no reply, no next message while incomplete, a close
//!   aimed at the wrong session, an unsolicited close-response.
//! - **Security-policy failures**: an issued token did not satisfy the
//!   local key policy.
//! - **Session faults**: faults the peer reports inside the session.
//!   `key-renewal-needed` is recovered locally by forcing a renewal;
//!   `session-aborted` faults the channel; anything else passes through.
//! - **Io / Json**: wrapped transport and serialization errors.
//!
//! Panics are never caught or converted; they propagate.

use std::time::Duration;

use thiserror::Error;

use crate::message::FaultCode;

/// Secure-conversation errors.
#[derive(Error, Debug)]
pub enum Error {
    /// A deadline budget elapsed.
    ///
    /// `legs` and `remaining` are diagnostic only: the negotiation engine
    /// fills them in so a timeout report shows how far the exchange got.
    #[error("timed out during {operation} (legs completed: {legs}, budget remaining: {remaining:?})")]
    Timeout {
        /// Operation that ran out of budget.
        operation: &'static str,
        /// Negotiation legs completed before the deadline (0 outside negotiation).
        legs: u32,
        /// Budget left when the timeout was detected.
        remaining: Duration,
    },

    /// Protocol-level violation by the remote peer.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Token negotiation failed.
    #[error("negotiation with {issuer} failed: {reason}")]
    Negotiation {
        /// Issuer address the negotiation targeted.
        issuer: String,
        /// What went wrong.
        reason: String,
    },

    /// The peer returned no reply to a negotiation leg.
    ///
    /// Distinct from [`Error::Timeout`]: the round trip completed, the
    /// reply slot was empty.
    #[error("no reply received from {issuer} during negotiation")]
    NoReply {
        /// Issuer address the negotiation targeted.
        issuer: String,
    },

    /// An issued token violated the local key policy.
    #[error("security policy violation: {0}")]
    SecurityPolicy(String),

    /// A session fault reported by the peer.
    ///
    /// `FaultCode::KeyRenewalNeeded` is recovered locally by the channel;
    /// `FaultCode::SessionAborted` is fatal; other codes pass through.
    #[error("session fault: {code}")]
    SessionFault {
        /// Fault code from the peer.
        code: FaultCode,
        /// Human-readable detail, if the peer supplied one.
        detail: Option<String>,
    },

    /// The channel is faulted and can no longer be used.
    #[error("channel faulted: {0}")]
    Faulted(String),

    /// Operation attempted on a closed channel or provider.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for secure-conversation operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when this error is a shallow input/formatting failure that the
    /// negotiation engine may wrap with issuer context. Already-specific
    /// protocol and policy errors keep their original shape.
    pub fn is_wrappable(&self) -> bool {
        matches!(self, Error::Json(_) | Error::Io(_) | Error::Transport(_))
    }

    /// Wrap a shallow error with issuer/target context.
    ///
    /// Non-wrappable errors are returned unchanged.
    pub fn with_issuer_context(self, issuer: &str) -> Self {
        if self.is_wrappable() {
            Error::Negotiation {
                issuer: issuer.to_string(),
                reason: self.to_string(),
            }
        } else {
            self
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Protocol(format!("invalid base64 key material: {err}"))
    }
}
