//! Token negotiation engine.
//!
//! Obtains one issued session token through an arbitrary multi-leg
//! challenge/response exchange with a security token service. The engine
//! owns the exchange mechanics; everything protocol-flavor-specific lives
//! behind the [`TrustDriver`] capability trait.
//!
//! # Exchange Flow
//!
//! ```text
//! Client                                Issuer
//!    |                                     |
//!    |------ leg 1: first request ------->|   driver builds the opener
//!    |<----- leg 2: challenge ------------|
//!    |                                     |
//!    |------ leg 3: challenge answer ---->|   driver answers each reply
//!    |<----- leg 4: issued token ---------|
//!    |                                     |
//!    (repeat until the driver reports completion)
//! ```
//!
//! Legs count from 1 and advance by 2 per round trip. The count is purely
//! diagnostic: a timeout anywhere in the exchange reports how many legs
//! completed and how much budget was left.
//!
//! One negotiation runs per transport channel, strictly sequentially; the
//! channel and the negotiation state are released when the run ends,
//! whatever the outcome.

mod drivers;
mod engine;
mod state;

pub use drivers::{ChallengeResponseDriver, SimpleIssueDriver};
pub use engine::NegotiationEngine;
pub use state::NegotiationState;

use crate::error::Result;
use crate::message::Message;

/// Protocol-flavor capabilities consumed by the negotiation engine.
///
/// A driver builds outgoing legs, consumes incoming ones, and decides when
/// the exchange is complete. It never touches the transport.
pub trait TrustDriver: Send + Sync {
    /// Driver-specific negotiation state carried inside [`NegotiationState`].
    type State: Send;

    /// Create the state for one negotiation run, resolving the remote
    /// issuer address from the target.
    fn create_state(&self, target: &str) -> Result<NegotiationState<Self::State>>;

    /// Build the opening request (leg 1).
    fn first_message(&self, state: &mut NegotiationState<Self::State>) -> Result<Message>;

    /// Build the next request given the previous reply.
    ///
    /// Returning `Ok(None)` signals there is nothing left to send; the
    /// engine treats that as completion only if [`TrustDriver::is_complete`]
    /// agrees, and as a protocol failure otherwise.
    fn next_message(
        &self,
        state: &mut NegotiationState<Self::State>,
        incoming: &Message,
    ) -> Result<Option<Message>>;

    /// Whether the exchange has produced its token.
    fn is_complete(&self, state: &NegotiationState<Self::State>) -> bool {
        state.is_complete()
    }
}
