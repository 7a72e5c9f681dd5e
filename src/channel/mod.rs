//! Session client channel state machine.
//!
//! The long-lived consumer of the token provider: it secures every outgoing
//! message with the current session token, verifies every incoming one
//! against the accepted token set, renews the key on schedule (or when the
//! peer demands it), retires superseded keys after the rollover window, and
//! runs the bilateral close handshake.
//!
//! # State Machine
//!
//! ```text
//!                 open()
//!   [Created] ───────────> [Opening] ───────> [Open]
//!                                               │
//!                 close-output / close received │
//!                                               v
//!                                           [Closing] ──────> [Closed]
//!                                               │
//!      session-aborted, protocol violation      │
//!   [Faulted] <─────────────────────────────────┘
//! ```
//!
//! Output and input close independently: close-output flips exactly once
//! under the channel mutex and sends at most one CLOSE (or the prepared
//! CLOSE_RESPONSE when the peer closed first); input closes when the
//! handshake's answering message arrives. Two `watch` signals let the close
//! path and concurrent operations wait for either side.
//!
//! Renewals are serialized: one sender renews while the rest wait on a
//! shared signal, re-check, and fail loudly if the need was not cleared.

mod close;
mod duplex;
mod keys;
mod request;

pub use close::CloseHandshakeState;
pub use duplex::DuplexSessionChannel;
pub use keys::SessionKeyState;
pub use request::RequestSessionChannel;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::budget::TimeBudget;
use crate::config::{CloseConfig, Config, RenewalConfig};
use crate::error::{Error, Result};
use crate::message::{Action, FaultCode, Message};
use crate::provider::SecurityTokenProvider;
use crate::security::{CorrelationState, MessageSecurity};
use crate::token::SecurityToken;
use crate::transport::TransportChannel;

/// Lifecycle states of a session channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, not yet opened
    Created,
    /// Open in progress: transport connecting, initial token negotiating
    Opening,
    /// Ready for traffic
    Open,
    /// Close handshake in progress
    Closing,
    /// Gracefully closed or aborted
    Closed,
    /// Unusable after a fatal fault
    Faulted,
}

/// Channel statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelStats {
    /// Outgoing messages secured
    pub messages_secured: u64,
    /// Incoming messages verified
    pub messages_verified: u64,
    /// Successful key renewals
    pub renewals: u64,
    /// Superseded tokens retired after their rollover window
    pub rollovers: u64,
    /// Key-renewal-needed faults recovered locally
    pub faults_recovered: u64,
}

/// Outcome of processing one incoming message
pub(crate) enum Inbound {
    /// Application message for the caller
    Delivered(Message),
    /// Control message consumed by the state machine
    Handled(Handled),
}

/// What a consumed control message did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handled {
    /// The peer acknowledged our CLOSE; input is closed
    CloseAcknowledged,
    /// The peer initiated close; input is closed, a response is prepared
    CloseReceived,
    /// A key-renewal-needed fault forced renewal on the next send
    RenewalForced,
}

/// What close-output decided to transmit
pub(crate) enum CloseSend {
    /// Output was already closed; nothing to do
    AlreadyClosed,
    /// No handshake message to send
    Nothing,
    /// Secured CLOSE; a CLOSE_RESPONSE is expected back
    Close(Message),
    /// Secured CLOSE_RESPONSE answering the peer's CLOSE
    Response(Message),
}

/// State shared by all operations of one channel, guarded by one mutex.
struct Guarded {
    lifecycle: ChannelState,
    session_id: Option<String>,
    keys: SessionKeyState,
    close: CloseHandshakeState,
    renewal_in_progress: bool,
    pending_close_response: Option<Message>,
    correlation: Option<CorrelationState>,
    stats: ChannelStats,
}

/// Shared core of the simplex and duplex channel flavors.
pub(crate) struct SessionCore {
    provider: Arc<dyn SecurityTokenProvider>,
    security: Arc<dyn MessageSecurity>,
    transport: Box<dyn TransportChannel>,
    renewal: RenewalConfig,
    close_config: CloseConfig,
    guard: Mutex<Guarded>,
    renewal_done: Notify,
    input_closed: watch::Sender<bool>,
    output_closed: watch::Sender<bool>,
    message_ids: Arc<AtomicU64>,
}

impl SessionCore {
    pub(crate) fn new(
        transport: Box<dyn TransportChannel>,
        provider: Arc<dyn SecurityTokenProvider>,
        security: Arc<dyn MessageSecurity>,
        config: &Config,
        message_ids: Arc<AtomicU64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            security,
            transport,
            renewal: config.renewal.clone(),
            close_config: config.close.clone(),
            guard: Mutex::new(Guarded {
                lifecycle: ChannelState::Created,
                session_id: None,
                keys: SessionKeyState::default(),
                close: CloseHandshakeState::default(),
                renewal_in_progress: false,
                pending_close_response: None,
                correlation: None,
                stats: ChannelStats::default(),
            }),
            renewal_done: Notify::new(),
            input_closed: watch::channel(false).0,
            output_closed: watch::channel(false).0,
            message_ids,
        })
    }

    fn next_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Unblock everything waiting on this channel (fault/abort paths).
    fn release_waiters(&self) {
        self.input_closed.send_replace(true);
        self.output_closed.send_replace(true);
        self.renewal_done.notify_waiters();
    }

    pub(crate) async fn open(&self, budget: &TimeBudget) -> Result<()> {
        {
            let mut g = self.guard.lock().await;
            match g.lifecycle {
                ChannelState::Created => g.lifecycle = ChannelState::Opening,
                state => {
                    return Err(Error::Protocol(format!(
                        "cannot open a session channel in state {state:?}"
                    )))
                },
            }
        }

        let opened = async {
            self.transport.open(budget).await?;
            self.provider.get_token(budget.remaining()).await
        }
        .await;

        let mut g = self.guard.lock().await;
        match opened {
            Ok(token) => {
                // A token was issued: a close handshake will be sent at
                // shutdown.
                g.session_id = Some(token.id().to_string());
                g.keys.install_initial(token, Utc::now(), &self.renewal);
                g.lifecycle = ChannelState::Open;
                info!(
                    session = g.session_id.as_deref().unwrap_or(""),
                    remote = self.transport.remote_address(),
                    "session channel open"
                );
                Ok(())
            },
            Err(e) => {
                g.lifecycle = ChannelState::Faulted;
                drop(g);
                self.release_waiters();
                self.transport.abort();
                Err(e)
            },
        }
    }

    fn ensure_sendable(&self, g: &Guarded) -> Result<()> {
        match g.lifecycle {
            ChannelState::Open if !g.close.is_output_closed => Ok(()),
            ChannelState::Open | ChannelState::Closing | ChannelState::Closed => {
                Err(Error::Closed("session channel output"))
            },
            ChannelState::Faulted => Err(Error::Faulted(
                "cannot send on a faulted session channel".to_string(),
            )),
            ChannelState::Created | ChannelState::Opening => {
                Err(Error::Protocol("session channel is not open yet".to_string()))
            },
        }
    }

    /// Renewal gate: return the token that secures the next outgoing
    /// message, renewing first if the schedule (or a forced renewal)
    /// demands it. At most one renewal runs at a time; other senders wait
    /// for its completion signal and re-check.
    async fn current_token_for_send(&self, budget: &TimeBudget) -> Result<Arc<SecurityToken>> {
        loop {
            let mut g = self.guard.lock().await;
            self.ensure_sendable(&g)?;
            let now = Utc::now();

            if !g.keys.renewal_due(now) {
                return g.keys.current().cloned().ok_or_else(|| {
                    Error::Faulted("open session channel without a session token".to_string())
                });
            }

            if g.renewal_in_progress {
                // Register for the completion signal before releasing the
                // lock, so a finishing renewal cannot slip past unnoticed.
                let mut notified = Box::pin(self.renewal_done.notified());
                notified.as_mut().enable();
                drop(g);

                budget
                    .run("session key renewal wait", async {
                        notified.await;
                        Ok(())
                    })
                    .await?;

                let g = self.guard.lock().await;
                if g.keys.renewal_due(Utc::now()) && !g.renewal_in_progress {
                    // The renewal we waited for ended without clearing the
                    // need; its error surfaced at the renewing sender.
                    return Err(Error::Faulted(
                        "session key renewal completed without clearing the renewal need"
                            .to_string(),
                    ));
                }
                continue;
            }

            // This sender performs the renewal
            g.renewal_in_progress = true;
            let current = g.keys.current().cloned();
            drop(g);

            let outcome = match &current {
                Some(token) => {
                    self.provider
                        .renew_token(budget.remaining(), Some(token))
                        .await
                },
                None => Err(Error::Faulted(
                    "open session channel without a session token".to_string(),
                )),
            };

            let mut g = self.guard.lock().await;
            g.renewal_in_progress = false;
            self.renewal_done.notify_waiters();
            match outcome {
                Ok(token) => {
                    // Issuer continuity, the legacy fingerprint comparison:
                    // a renewed token carrying a different certificate
                    // fingerprint than its predecessor is rejected.
                    if let Some(old) = &current {
                        if old.fingerprint().is_some()
                            && token.fingerprint().is_some()
                            && !token.matches_fingerprint(old)
                        {
                            return Err(Error::SecurityPolicy(format!(
                                "renewed token {} was issued under a different certificate",
                                token.id()
                            )));
                        }
                    }
                    debug!(
                        session = g.session_id.as_deref().unwrap_or(""),
                        renewed = %token.id(),
                        "session key renewed"
                    );
                    g.keys.apply_renewal(token, Utc::now(), &self.renewal);
                    g.stats.renewals += 1;
                    // Loop back; the fresh token passes the schedule check
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Secure one outgoing message, driving the renewal gate first.
    pub(crate) async fn secure_next(&self, message: Message, budget: &TimeBudget) -> Result<Message> {
        let token = self.current_token_for_send(budget).await?;

        let mut g = self.guard.lock().await;
        let correlation = g.correlation.clone();
        let (secured, correlation_out) = self.security.secure_outgoing(
            message.with_message_id(self.next_id()),
            &token,
            correlation.as_ref(),
        )?;
        g.correlation = Some(correlation_out);
        g.stats.messages_secured += 1;
        Ok(secured)
    }

    /// Build an application message for this session.
    pub(crate) async fn make_application(&self, content: &str) -> Result<Message> {
        let g = self.guard.lock().await;
        let session_id = g
            .session_id
            .as_deref()
            .ok_or_else(|| Error::Protocol("session channel is not open yet".to_string()))?;
        Ok(Message::application(session_id, content))
    }

    fn validate_close_target(g: &Guarded, message: &Message) -> Result<()> {
        let target = message
            .close_target()
            .ok_or_else(|| Error::Protocol("close message carries no target".to_string()))?;
        let session_id = g.session_id.as_deref().unwrap_or("");
        if target != session_id {
            return Err(Error::Protocol(format!(
                "close targets session {target}, this session is {session_id}"
            )));
        }
        Ok(())
    }

    /// Verify and dispatch one incoming message.
    pub(crate) async fn process_incoming(&self, message: Message) -> Result<Inbound> {
        let mut g = self.guard.lock().await;
        if g.lifecycle == ChannelState::Faulted {
            return Err(Error::Faulted(
                "cannot receive on a faulted session channel".to_string(),
            ));
        }

        // Rollover cleanup runs before verification so a stale token can
        // never vouch for this message.
        let now = Utc::now();
        if g.keys.rollover_cleanup(now) {
            g.stats.rollovers += 1;
            debug!(
                session = g.session_id.as_deref().unwrap_or(""),
                "superseded session token retired"
            );
        }

        let accepted = g.keys.accepted();
        if accepted.is_empty() {
            return Err(Error::Closed("session channel"));
        }

        let correlation = g.correlation.clone();
        let (message, correlation_out) =
            self.security
                .verify_incoming(message, &accepted, correlation.as_ref())?;
        if let Some(c) = correlation_out {
            g.correlation = Some(c);
        }
        g.stats.messages_verified += 1;

        match message.action {
            Action::CloseResponse => {
                if !g.close.sent_close {
                    g.lifecycle = ChannelState::Faulted;
                    drop(g);
                    self.release_waiters();
                    return Err(Error::Protocol(
                        "close-response received but this side never sent close".to_string(),
                    ));
                }
                if let Err(e) = Self::validate_close_target(&g, &message) {
                    g.lifecycle = ChannelState::Faulted;
                    drop(g);
                    self.release_waiters();
                    return Err(e);
                }
                g.close.is_input_closed = true;
                drop(g);
                self.input_closed.send_replace(true);
                Ok(Inbound::Handled(Handled::CloseAcknowledged))
            },
            Action::Close => {
                if !self.close_config.allow_remote_close {
                    g.lifecycle = ChannelState::Faulted;
                    drop(g);
                    self.release_waiters();
                    return Err(Error::Protocol(
                        "policy forbids a remote-initiated close".to_string(),
                    ));
                }
                if let Err(e) = Self::validate_close_target(&g, &message) {
                    g.lifecycle = ChannelState::Faulted;
                    drop(g);
                    self.release_waiters();
                    return Err(e);
                }

                g.close.is_input_closed = true;
                if !g.close.sent_close {
                    // Normal asymmetric handshake: prepare (do not yet
                    // send) the answering close-response.
                    g.close.received_close = true;
                    let session_id = g.session_id.clone().unwrap_or_default();
                    g.pending_close_response = Some(Message::close_response(&session_id));
                } // else: simultaneous close; the peer's CLOSE completes our handshake

                drop(g);
                self.input_closed.send_replace(true);
                Ok(Inbound::Handled(Handled::CloseReceived))
            },
            Action::Fault => {
                let info = message.fault_info().cloned().ok_or_else(|| {
                    Error::Protocol("fault message carries no fault info".to_string())
                })?;
                match info.code {
                    FaultCode::KeyRenewalNeeded => {
                        warn!(
                            session = g.session_id.as_deref().unwrap_or(""),
                            "peer demanded key renewal; forcing it on the next send"
                        );
                        g.keys.force_renewal(now);
                        g.stats.faults_recovered += 1;
                        Ok(Inbound::Handled(Handled::RenewalForced))
                    },
                    FaultCode::SessionAborted => {
                        g.lifecycle = ChannelState::Faulted;
                        g.keys.retire();
                        drop(g);
                        self.release_waiters();
                        Err(Error::SessionFault {
                            code: FaultCode::SessionAborted,
                            detail: info.detail,
                        })
                    },
                    FaultCode::Other(_) => Err(Error::SessionFault {
                        code: info.code,
                        detail: info.detail,
                    }),
                }
            },
            Action::Application | Action::Negotiation => Ok(Inbound::Delivered(message)),
        }
    }

    /// Flip output closed (exactly once) and secure the handshake message
    /// this side owes, if any.
    pub(crate) async fn begin_close_output(&self) -> Result<CloseSend> {
        let mut g = self.guard.lock().await;
        if g.close.is_output_closed {
            return Ok(CloseSend::AlreadyClosed);
        }
        g.close.is_output_closed = true;
        if g.lifecycle == ChannelState::Open {
            g.lifecycle = ChannelState::Closing;
        }

        let session_id = match g.session_id.clone() {
            Some(id) => id,
            None => {
                // No token was ever issued; there is no handshake to run
                g.close.is_input_closed = true;
                drop(g);
                self.release_waiters();
                return Ok(CloseSend::Nothing);
            },
        };
        let token = match g.keys.current().cloned() {
            Some(token) => token,
            None => {
                drop(g);
                self.output_closed.send_replace(true);
                return Ok(CloseSend::Nothing);
            },
        };

        let outgoing = if g.close.received_close {
            g.pending_close_response.take()
        } else {
            g.close.sent_close = true;
            Some(Message::close(&session_id))
        };
        let answering = g.close.received_close;

        let secured = match outgoing {
            Some(message) => {
                let correlation = g.correlation.clone();
                let (secured, correlation_out) = self.security.secure_outgoing(
                    message.with_message_id(self.next_id()),
                    &token,
                    correlation.as_ref(),
                )?;
                g.correlation = Some(correlation_out);
                g.stats.messages_secured += 1;
                Some(secured)
            },
            None => None,
        };

        drop(g);
        self.output_closed.send_replace(true);

        match secured {
            Some(message) if answering => Ok(CloseSend::Response(message)),
            Some(message) => Ok(CloseSend::Close(message)),
            None => Ok(CloseSend::Nothing),
        }
    }

    /// Wait until the close handshake has closed input.
    ///
    /// A budget overrun is reported as a timeout, never dropped.
    pub(crate) async fn wait_input_closed(&self, budget: &TimeBudget) -> Result<()> {
        {
            let g = self.guard.lock().await;
            if g.lifecycle == ChannelState::Faulted {
                return Err(Error::Faulted(
                    "channel faulted before the close handshake completed".to_string(),
                ));
            }
            if g.close.is_input_closed {
                return Ok(());
            }
        }

        let mut rx = self.input_closed.subscribe();
        budget
            .run("session close (awaiting close handshake)", async {
                rx.wait_for(|closed| *closed).await.map_err(|_| {
                    Error::Faulted("session channel state was dropped".to_string())
                })?;
                Ok(())
            })
            .await?;

        // The fault path releases the same signal; report it as a fault,
        // not a completed handshake.
        let g = self.guard.lock().await;
        if g.lifecycle == ChannelState::Faulted {
            return Err(Error::Faulted(
                "channel faulted while waiting for the close handshake".to_string(),
            ));
        }
        Ok(())
    }

    /// Final close step: release the transport and the provider's interest
    /// in the session token.
    pub(crate) async fn finish_close(&self, budget: &TimeBudget) -> Result<()> {
        self.transport.close(budget).await?;

        let mut g = self.guard.lock().await;
        let current = g.keys.current().cloned();
        g.keys.retire();
        g.lifecycle = ChannelState::Closed;
        let session = g.session_id.clone();
        drop(g);

        if let Some(token) = current {
            self.provider
                .cancel_token(&token, budget.remaining())
                .await?;
        }
        info!(session = session.as_deref().unwrap_or(""), "session channel closed");
        Ok(())
    }

    /// Fault the channel: abort the transport, retire the keys, wake every
    /// waiter.
    pub(crate) async fn fault(&self, reason: &str) {
        warn!(reason, "session channel faulted");
        let mut g = self.guard.lock().await;
        g.lifecycle = ChannelState::Faulted;
        g.keys.retire();
        drop(g);
        self.release_waiters();
        self.transport.abort();
    }

    /// Abort without a fault: drop everything immediately.
    pub(crate) async fn abort(&self) {
        let mut g = self.guard.lock().await;
        g.lifecycle = ChannelState::Closed;
        g.close.is_output_closed = true;
        g.close.is_input_closed = true;
        g.keys.retire();
        drop(g);
        self.release_waiters();
        self.transport.abort();
    }

    pub(crate) async fn state(&self) -> ChannelState {
        self.guard.lock().await.lifecycle
    }

    pub(crate) async fn stats(&self) -> ChannelStats {
        self.guard.lock().await.stats
    }

    pub(crate) async fn session_id(&self) -> Option<String> {
        self.guard.lock().await.session_id.clone()
    }

    pub(crate) async fn is_input_closed(&self) -> bool {
        self.guard.lock().await.close.is_input_closed
    }

    pub(crate) async fn transport_send(&self, message: Message, budget: &TimeBudget) -> Result<()> {
        self.transport.send(message, budget).await
    }

    pub(crate) async fn transport_request(
        &self,
        message: Message,
        budget: &TimeBudget,
    ) -> Result<Option<Message>> {
        self.transport.request(message, budget).await
    }

    pub(crate) async fn transport_receive(&self, budget: &TimeBudget) -> Result<Option<Message>> {
        self.transport.try_receive(budget).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderFuture;
    use crate::token::TokenId;
    use crate::transport::TransportFuture;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    /// Provider handing out a preloaded sequence of tokens.
    struct StubProvider {
        tokens: std::sync::Mutex<Vec<Arc<SecurityToken>>>,
    }

    impl StubProvider {
        fn with(tokens: Vec<Arc<SecurityToken>>) -> Arc<Self> {
            Arc::new(Self {
                tokens: std::sync::Mutex::new(tokens),
            })
        }

        fn pop(&self) -> Result<Arc<SecurityToken>> {
            let mut tokens = self.tokens.lock().expect("stub lock");
            if tokens.is_empty() {
                return Err(Error::Negotiation {
                    issuer: "stub".to_string(),
                    reason: "stub provider is out of tokens".to_string(),
                });
            }
            Ok(tokens.remove(0))
        }
    }

    impl crate::provider::SecurityTokenProvider for StubProvider {
        fn get_token(&self, _timeout: Duration) -> ProviderFuture<'_, Arc<SecurityToken>> {
            Box::pin(async move { self.pop() })
        }

        fn cancel_token<'a>(
            &'a self,
            _token: &'a SecurityToken,
            _timeout: Duration,
        ) -> ProviderFuture<'a, ()> {
            Box::pin(async move { Ok(()) })
        }

        fn renew_token<'a>(
            &'a self,
            _timeout: Duration,
            current: Option<&'a SecurityToken>,
        ) -> ProviderFuture<'a, Arc<SecurityToken>> {
            Box::pin(async move {
                current.ok_or_else(|| Error::Negotiation {
                    issuer: "stub".to_string(),
                    reason: "renewal requires the current session token".to_string(),
                })?;
                self.pop()
            })
        }
    }

    /// Pass-through security engine stamping only the token ID.
    struct StubSecurity;

    impl MessageSecurity for StubSecurity {
        fn secure_outgoing(
            &self,
            mut message: Message,
            token: &SecurityToken,
            _correlation: Option<&CorrelationState>,
        ) -> Result<(Message, CorrelationState)> {
            message.security = Some(crate::message::SecurityHeader {
                token_id: token.id().to_string(),
                tag: String::new(),
            });
            let correlation = CorrelationState::new(token.id().to_string(), message.message_id);
            Ok((message, correlation))
        }

        fn verify_incoming(
            &self,
            message: Message,
            _accepted: &[Arc<SecurityToken>],
            correlation: Option<&CorrelationState>,
        ) -> Result<(Message, Option<CorrelationState>)> {
            Ok((message, correlation.cloned()))
        }
    }

    /// Transport that swallows sends.
    struct StubTransport;

    impl crate::transport::TransportChannel for StubTransport {
        fn open<'a>(&'a self, _budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn close<'a>(&'a self, _budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn abort(&self) {}

        fn send<'a>(&'a self, _message: Message, _budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn request<'a>(
            &'a self,
            _message: Message,
            _budget: &'a TimeBudget,
        ) -> TransportFuture<'a, Option<Message>> {
            Box::pin(async { Ok(None) })
        }

        fn try_receive<'a>(
            &'a self,
            _budget: &'a TimeBudget,
        ) -> TransportFuture<'a, Option<Message>> {
            Box::pin(async { Ok(None) })
        }

        fn remote_address(&self) -> &str {
            "stub://peer"
        }
    }

    fn stub_token(id: &str, fingerprint: Option<&str>) -> Arc<SecurityToken> {
        let now = Utc::now();
        let mut token = SecurityToken::new(
            TokenId::new(id),
            now,
            now + ChronoDuration::hours(1),
            vec![crate::token::SymmetricKey::new(vec![1u8; 32])],
        );
        if let Some(fp) = fingerprint {
            token = token.with_fingerprint(fp);
        }
        Arc::new(token)
    }

    fn core_with(tokens: Vec<Arc<SecurityToken>>) -> Arc<SessionCore> {
        SessionCore::new(
            Box::new(StubTransport),
            StubProvider::with(tokens),
            Arc::new(StubSecurity),
            &Config::default(),
            Arc::new(AtomicU64::new(1)),
        )
    }

    #[tokio::test]
    async fn test_open_installs_token_and_session() {
        let core = core_with(vec![stub_token("tok-1", None)]);
        let budget = TimeBudget::new(Duration::from_secs(1));

        core.open(&budget).await.unwrap();
        assert_eq!(core.state().await, ChannelState::Open);
        assert_eq!(core.session_id().await.as_deref(), Some("tok-1"));
    }

    #[tokio::test]
    async fn test_open_failure_faults_channel() {
        let core = core_with(vec![]);
        let budget = TimeBudget::new(Duration::from_secs(1));

        assert!(core.open(&budget).await.is_err());
        assert_eq!(core.state().await, ChannelState::Faulted);
    }

    #[tokio::test]
    async fn test_renewal_rejects_changed_fingerprint() {
        let core = core_with(vec![
            stub_token("tok-1", Some("cert-a")),
            stub_token("tok-2", Some("cert-b")),
        ]);
        let budget = TimeBudget::new(Duration::from_secs(1));
        core.open(&budget).await.unwrap();

        // Force the renewal path on the next send
        {
            let mut g = core.guard.lock().await;
            g.keys.force_renewal(Utc::now());
        }

        let err = core
            .secure_next(Message::application("tok-1", "x"), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecurityPolicy(_)));
        assert!(err.to_string().contains("different certificate"));
    }

    #[tokio::test]
    async fn test_renewal_accepts_same_fingerprint() {
        let core = core_with(vec![
            stub_token("tok-1", Some("cert-a")),
            stub_token("tok-2", Some("cert-a")),
        ]);
        let budget = TimeBudget::new(Duration::from_secs(1));
        core.open(&budget).await.unwrap();

        {
            let mut g = core.guard.lock().await;
            g.keys.force_renewal(Utc::now());
        }

        core.secure_next(Message::application("tok-1", "x"), &budget)
            .await
            .unwrap();
        assert_eq!(core.stats().await.renewals, 1);
    }

    #[tokio::test]
    async fn test_close_output_is_idempotent() {
        let core = core_with(vec![stub_token("tok-1", None)]);
        let budget = TimeBudget::new(Duration::from_secs(1));
        core.open(&budget).await.unwrap();

        let first = core.begin_close_output().await.unwrap();
        assert!(matches!(first, CloseSend::Close(_)));

        let second = core.begin_close_output().await.unwrap();
        assert!(matches!(second, CloseSend::AlreadyClosed));

        // Output closed, sends refused
        let err = core
            .secure_next(Message::application("tok-1", "x"), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[tokio::test]
    async fn test_send_before_open_is_rejected() {
        let core = core_with(vec![stub_token("tok-1", None)]);
        let budget = TimeBudget::new(Duration::from_secs(1));

        let err = core
            .secure_next(Message::application("tok-1", "x"), &budget)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
