//! Duplex session channel with a background receive pump.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ChannelState, ChannelStats, CloseSend, Handled, Inbound, SessionCore};
use crate::budget::TimeBudget;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{FaultCode, Message};
use crate::provider::SecurityTokenProvider;
use crate::security::MessageSecurity;
use crate::transport::TransportChannel;

/// How long one pump iteration waits before re-arming its receive budget
const PUMP_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Duplex session channel: sends do not wait for replies; a background
/// task pumps inbound messages into a delivery queue for [`receive`].
///
/// [`receive`]: DuplexSessionChannel::receive
pub struct DuplexSessionChannel {
    core: Arc<SessionCore>,
    deliveries: Mutex<mpsc::Receiver<Result<Message>>>,
    delivery_tx: Mutex<Option<mpsc::Sender<Result<Message>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DuplexSessionChannel {
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
        let (tx, rx) = mpsc::channel(64);
        Self {
            core: SessionCore::new(transport, provider, security, config, message_ids),
            deliveries: Mutex::new(rx),
            delivery_tx: Mutex::new(Some(tx)),
            pump: Mutex::new(None),
        }
    }

    /// Open the transport, obtain the initial token, and start the pump.
    pub async fn open(&self, timeout: Duration) -> Result<()> {
        let budget = TimeBudget::new(timeout);
        self.core.open(&budget).await?;

        let tx = self
            .delivery_tx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Protocol("session channel was already opened".to_string()))?;
        let core = self.core.clone();
        *self.pump.lock().await = Some(tokio::spawn(async move {
            receive_pump(core, tx).await;
        }));
        Ok(())
    }

    /// Secure and send application content without waiting for a reply.
    pub async fn send(&self, content: &str, timeout: Duration) -> Result<()> {
        let budget = TimeBudget::new(timeout);
        let message = self.core.make_application(content).await?;
        let secured = self.core.secure_next(message, &budget).await?;
        self.core.transport_send(secured, &budget).await
    }

    /// Receive the next verified application message.
    ///
    /// `Ok(None)` means the session's input side closed gracefully.
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        let budget = TimeBudget::new(timeout);
        let mut rx = self.deliveries.lock().await;
        match tokio::time::timeout(budget.remaining(), rx.recv()).await {
            Ok(Some(Ok(message))) => Ok(Some(message)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(budget.timeout_error("session receive")),
        }
    }

    /// Run the close handshake and release the channel's resources.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let budget = TimeBudget::new(timeout);

        match self.core.begin_close_output().await? {
            CloseSend::AlreadyClosed | CloseSend::Nothing => {},
            // The answering close-response arrives through the pump
            CloseSend::Close(message) | CloseSend::Response(message) => {
                self.core.transport_send(message, &budget).await?;
            },
        }

        self.core.wait_input_closed(&budget).await?;
        self.core.finish_close(&budget).await?;

        if let Some(mut pump) = self.pump.lock().await.take() {
            // The pump exits on its own once input closed; reap it within
            // the remaining budget rather than leaving a stray task.
            match tokio::time::timeout(budget.remaining(), &mut pump).await {
                Ok(joined) => joined
                    .map_err(|e| Error::Faulted(format!("receive pump panicked: {e}")))?,
                Err(_) => {
                    pump.abort();
                    return Err(budget.timeout_error("session close (reaping receive pump)"));
                },
            }
        }
        Ok(())
    }

    /// Drop the channel immediately, skipping the handshake.
    pub async fn abort(&self) {
        self.core.abort().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
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

/// Background receive loop: verifies and dispatches every inbound message,
/// delivering application traffic to the queue. Any fault aborts in-flight
/// work: the channel faults, the error is delivered, the loop stops.
async fn receive_pump(core: Arc<SessionCore>, deliveries: mpsc::Sender<Result<Message>>) {
    loop {
        let budget = TimeBudget::new(PUMP_POLL_INTERVAL);
        match core.transport_receive(&budget).await {
            Ok(Some(message)) => match core.process_incoming(message).await {
                Ok(Inbound::Delivered(message)) => {
                    if deliveries.send(Ok(message)).await.is_err() {
                        // Consumer gone; stop pumping
                        break;
                    }
                },
                Ok(Inbound::Handled(Handled::RenewalForced)) => {},
                Ok(Inbound::Handled(_)) => {
                    if core.is_input_closed().await {
                        debug!("session input closed, receive pump stopping");
                        break;
                    }
                },
                Err(e) => {
                    // Pass-through faults reach the consumer without
                    // killing the session; everything else faults it.
                    let fatal = !matches!(
                        e,
                        Error::SessionFault {
                            code: FaultCode::Other(_),
                            ..
                        }
                    );
                    if fatal {
                        core.fault("receive pump failed to process an incoming message")
                            .await;
                    }
                    let _ = deliveries.send(Err(e)).await;
                    if fatal {
                        break;
                    }
                },
            },
            Ok(None) => {
                if core.is_input_closed().await {
                    break;
                }
                core.fault("transport closed before the close handshake completed")
                    .await;
                let _ = deliveries
                    .send(Err(Error::Transport(
                        "transport closed before the close handshake completed".to_string(),
                    )))
                    .await;
                break;
            },
            Err(Error::Timeout { .. }) => {
                // Nothing arrived this interval; keep pumping unless the
                // channel has moved on.
                if core.is_input_closed().await {
                    break;
                }
            },
            Err(e) => {
                core.fault("receive pump transport failure").await;
                let _ = deliveries.send(Err(e)).await;
                break;
            },
        }
    }
}
