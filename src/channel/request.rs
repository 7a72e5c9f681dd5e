//! Simplex (request-reply) session channel.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use super::{ChannelState, ChannelStats, CloseSend, Handled, Inbound, SessionCore};
use crate::budget::TimeBudget;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::provider::SecurityTokenProvider;
use crate::security::MessageSecurity;
use crate::transport::TransportChannel;

/// Request-reply session channel: every send blocks for its secured reply.
pub struct RequestSessionChannel {
    core: Arc<SessionCore>,
}

impl RequestSessionChannel {
    /// Create an unopened channel.
    ///
    /// The transport and provider become exclusively owned by this channel.
    pub fn new(
        transport: Box<dyn TransportChannel>,
        provider: Arc<dyn SecurityTokenProvider>,
        security: Arc<dyn MessageSecurity>,
        config: &Config,
        message_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            core: SessionCore::new(transport, provider, security, config, message_ids),
        }
    }

    /// Open the transport and obtain the initial session token.
    pub async fn open(&self, timeout: Duration) -> Result<()> {
        let budget = TimeBudget::new(timeout);
        self.core.open(&budget).await
    }

    /// Send application content and block for the verified reply.
    ///
    /// A key-renewal-needed fault in the reply is recovered transparently:
    /// the renewal runs and the request is re-sent under the fresh token.
    pub async fn request(&self, content: &str, timeout: Duration) -> Result<Message> {
        let budget = TimeBudget::new(timeout);
        loop {
            if budget.is_elapsed() {
                return Err(budget.timeout_error("session request"));
            }

            let message = self.core.make_application(content).await?;
            let secured = self.core.secure_next(message, &budget).await?;

            let reply = self
                .core
                .transport_request(secured, &budget)
                .await?
                .ok_or_else(|| {
                    Error::Transport("transport closed while a request was in flight".to_string())
                })?;

            match self.core.process_incoming(reply).await? {
                Inbound::Delivered(reply) => return Ok(reply),
                Inbound::Handled(Handled::RenewalForced) => {
                    // The peer demanded a fresh key; the renewal gate runs
                    // on the retry.
                    continue;
                },
                Inbound::Handled(_) => {
                    return Err(Error::Protocol(
                        "close handshake message received where an application reply was expected"
                            .to_string(),
                    ))
                },
            }
        }
    }

    /// Run the close handshake and release the channel's resources.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let budget = TimeBudget::new(timeout);

        match self.core.begin_close_output().await? {
            CloseSend::AlreadyClosed | CloseSend::Nothing => {},
            CloseSend::Close(message) => {
                let reply = self
                    .core
                    .transport_request(message, &budget)
                    .await?
                    .ok_or_else(|| {
                        Error::Protocol("peer closed without answering the close".to_string())
                    })?;
                // The reply must be the close-response; anything else is a
                // protocol violation surfaced by process_incoming.
                self.core.process_incoming(reply).await?;
            },
            CloseSend::Response(message) => {
                self.core.transport_send(message, &budget).await?;
            },
        }

        self.core.wait_input_closed(&budget).await?;
        self.core.finish_close(&budget).await
    }

    /// Drop the channel immediately, skipping the handshake.
    pub async fn abort(&self) {
        self.core.abort().await;
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ChannelState {
        self.core.state().await
    }

    /// Channel statistics
    pub async fn stats(&self) -> ChannelStats {
        self.core.stats().await
    }

    /// Session context ID, once open
    pub async fn session_id(&self) -> Option<String> {
        self.core.session_id().await
    }
}
