//! In-memory transport for tests and simulations.
//!
//! A [`MemoryListener`] hands out a [`MemoryBinder`]; every channel the
//! binder creates is paired with a server-side channel delivered through
//! [`MemoryListener::accept`]. Messages travel over unbounded in-process
//! queues, so every timing behavior comes from the caller's budgets.

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{TransportBinder, TransportChannel, TransportFuture};
use crate::budget::TimeBudget;
use crate::error::{Error, Result};
use crate::message::Message;

/// One side of an in-memory duplex channel.
pub struct MemoryChannel {
    address: String,
    outbound: mpsc::UnboundedSender<Message>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MemoryChannel {
    fn pair(address: &str) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                address: address.to_string(),
                outbound: a_tx,
                inbound: Mutex::new(b_rx),
            },
            Self {
                address: address.to_string(),
                outbound: b_tx,
                inbound: Mutex::new(a_rx),
            },
        )
    }

    async fn receive_inner(&self, budget: &TimeBudget) -> Result<Option<Message>> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(budget.remaining(), inbound.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Err(budget.timeout_error("transport receive")),
        }
    }
}

impl TransportChannel for MemoryChannel {
    fn open<'a>(&'a self, _budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            debug!(address = %self.address, "memory channel open");
            Ok(())
        })
    }

    fn close<'a>(&'a self, _budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            debug!(address = %self.address, "memory channel close");
            Ok(())
        })
    }

    fn abort(&self) {
        debug!(address = %self.address, "memory channel abort");
    }

    fn send<'a>(&'a self, message: Message, _budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.outbound
                .send(message)
                .map_err(|_| Error::Transport(format!("peer at {} is gone", self.address)))
        })
    }

    fn request<'a>(
        &'a self,
        message: Message,
        budget: &'a TimeBudget,
    ) -> TransportFuture<'a, Option<Message>> {
        Box::pin(async move {
            self.outbound
                .send(message)
                .map_err(|_| Error::Transport(format!("peer at {} is gone", self.address)))?;
            self.receive_inner(budget).await
        })
    }

    fn try_receive<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, Option<Message>> {
        Box::pin(self.receive_inner(budget))
    }

    fn remote_address(&self) -> &str {
        &self.address
    }
}

/// Binder side of an in-memory listener/binder pair.
pub struct MemoryBinder {
    address: String,
    accept_tx: mpsc::UnboundedSender<MemoryChannel>,
}

impl TransportBinder for MemoryBinder {
    fn create_channel(&self, target: &str) -> Result<Box<dyn TransportChannel>> {
        if target != self.address {
            return Err(Error::Transport(format!(
                "no listener at {target} (binder serves {})",
                self.address
            )));
        }
        let (client, server) = MemoryChannel::pair(target);
        self.accept_tx
            .send(server)
            .map_err(|_| Error::Transport(format!("listener at {} is gone", self.address)))?;
        Ok(Box::new(client))
    }
}

/// Listener side: yields the server end of every channel the binder creates.
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryChannel>,
}

impl MemoryListener {
    /// Create a listener/binder pair for an address.
    pub fn bind(address: &str) -> (MemoryBinder, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            MemoryBinder {
                address: address.to_string(),
                accept_tx,
            },
            MemoryListener { accept_rx },
        )
    }

    /// Accept the next server-side channel.
    pub async fn accept(&mut self) -> Option<MemoryChannel> {
        self.accept_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_reply() {
        let (binder, mut listener) = MemoryListener::bind("mem://peer");
        let budget = TimeBudget::new(Duration::from_secs(1));

        let client = binder.create_channel("mem://peer").unwrap();
        let server = listener.accept().await.unwrap();

        let server_task = tokio::spawn(async move {
            let budget = TimeBudget::new(Duration::from_secs(1));
            let request = server.try_receive(&budget).await.unwrap().unwrap();
            assert_eq!(request.application_content(), Some("ping"));
            server
                .send(Message::application("s", "pong"), &budget)
                .await
                .unwrap();
        });

        let reply = client
            .request(Message::application("s", "ping"), &budget)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.application_content(), Some("pong"));

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_none_when_peer_dropped() {
        let (binder, mut listener) = MemoryListener::bind("mem://peer");
        let client = binder.create_channel("mem://peer").unwrap();
        let server = listener.accept().await.unwrap();
        drop(server);

        let budget = TimeBudget::new(Duration::from_millis(100));
        let received = client.try_receive(&budget).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_receive_timeout_is_distinct_from_no_reply() {
        let (binder, mut listener) = MemoryListener::bind("mem://peer");
        let client = binder.create_channel("mem://peer").unwrap();
        // Keep the server end alive but silent
        let _server = listener.accept().await.unwrap();

        let budget = TimeBudget::new(Duration::from_millis(20));
        let err = client.try_receive(&budget).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_binder_rejects_unknown_target() {
        let (binder, _listener) = MemoryListener::bind("mem://peer");
        assert!(binder.create_channel("mem://other").is_err());
    }
}
