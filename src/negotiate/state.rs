//! Per-run negotiation state.

use crate::token::SecurityToken;

/// State owned by exactly one negotiation run.
///
/// Created when the run starts, mutated only by the engine and the driver's
/// callbacks, dropped when the run ends regardless of outcome. `S` is the
/// driver-specific portion.
#[derive(Debug)]
pub struct NegotiationState<S> {
    target_address: String,
    remote_address: String,
    context_id: Option<String>,
    legs: u32,
    complete: bool,
    issued: Option<SecurityToken>,
    inner: S,
}

impl<S> NegotiationState<S> {
    /// Create state for a run against `target`.
    ///
    /// The remote address starts equal to the target; a driver that routes
    /// through a separate issuer overrides it in `create_state`.
    pub fn new(target: &str, inner: S) -> Self {
        Self {
            target_address: target.to_string(),
            remote_address: target.to_string(),
            context_id: None,
            legs: 1,
            complete: false,
            issued: None,
            inner,
        }
    }

    /// Address of the service the token is for
    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    /// Resolved address of the issuer the exchange talks to
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Route the exchange through a separate issuer
    pub fn set_remote_address(&mut self, address: impl Into<String>) {
        self.remote_address = address.into();
    }

    /// Correlation context ID, present only for multi-leg exchanges
    pub fn context_id(&self) -> Option<&str> {
        self.context_id.as_deref()
    }

    /// Assign the correlation context ID
    pub fn set_context_id(&mut self, id: impl Into<String>) {
        self.context_id = Some(id.into());
    }

    /// Legs completed so far (starts at 1, +2 per round trip)
    pub fn legs(&self) -> u32 {
        self.legs
    }

    /// Record one completed round trip
    pub(crate) fn add_round_trip(&mut self) {
        self.legs += 2;
    }

    /// Whether the driver has marked the exchange complete
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Record the issued token and mark the exchange complete
    pub fn complete_with(&mut self, token: SecurityToken) {
        self.issued = Some(token);
        self.complete = true;
    }

    /// Take the issued token out of the state
    pub(crate) fn take_issued(&mut self) -> Option<SecurityToken> {
        self.issued.take()
    }

    /// Driver-specific state
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Driver-specific state, mutable
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}
