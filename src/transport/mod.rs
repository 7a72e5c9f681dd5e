//! Transport layer abstraction for the session control plane.
//!
//! The control plane exchanges [`Message`]s over a request-reply channel it
//! owns exclusively; the concrete wire is pluggable:
//!
//! - **memory**: an in-process duplex pair, used by tests and simulations
//! - **tcp**: length-prefixed JSON frames over a TCP stream
//!
//! A [`TransportBinder`] creates channels for a target address; the
//! negotiation engine creates one channel per negotiation run, the session
//! channel holds one for its whole life. Every blocking call takes a
//! [`TimeBudget`]; `Ok(None)` from a receive means the peer closed without
//! replying, which is distinct from a timeout.

mod memory;
mod tcp;

pub use memory::{MemoryBinder, MemoryChannel, MemoryListener};
pub use tcp::{TcpBinder, TcpChannel};

use futures::future::BoxFuture;

use crate::budget::TimeBudget;
use crate::error::Result;
use crate::message::Message;

/// Boxed future returned by transport trait methods
pub type TransportFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Creates transport channels for a target address.
pub trait TransportBinder: Send + Sync {
    /// Create an unopened channel to `target`.
    fn create_channel(&self, target: &str) -> Result<Box<dyn TransportChannel>>;
}

/// A bidirectional message channel to one remote endpoint.
///
/// Implementations take `&self`; a channel may be pumped by a background
/// receive loop while senders use it concurrently.
pub trait TransportChannel: Send + Sync {
    /// Open the channel.
    fn open<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, ()>;

    /// Gracefully close the channel.
    fn close<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, ()>;

    /// Abort the channel, dropping any in-flight work.
    fn abort(&self);

    /// Send one message.
    fn send<'a>(&'a self, message: Message, budget: &'a TimeBudget) -> TransportFuture<'a, ()>;

    /// Send one message and block for the reply.
    ///
    /// `Ok(None)` means the peer closed without replying.
    fn request<'a>(
        &'a self,
        message: Message,
        budget: &'a TimeBudget,
    ) -> TransportFuture<'a, Option<Message>>;

    /// Receive the next inbound message.
    ///
    /// `Ok(None)` means the peer closed the channel.
    fn try_receive<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, Option<Message>>;

    /// Remote address this channel points at.
    fn remote_address(&self) -> &str;
}
