//! TCP transport for the session control plane.
//!
//! Length-prefixed JSON frames over a `tokio` TCP stream: a 4-byte
//! big-endian payload length followed by the serialized [`Message`]. The
//! binder is client-side only; servers accept with their own listener and
//! speak the same framing.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{TransportBinder, TransportChannel, TransportFuture};
use crate::budget::TimeBudget;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::message::Message;

/// Binder creating TCP channels.
#[derive(Debug, Clone, Default)]
pub struct TcpBinder {
    config: TransportConfig,
}

impl TcpBinder {
    /// Create a binder with the given transport settings.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl TransportBinder for TcpBinder {
    fn create_channel(&self, target: &str) -> Result<Box<dyn TransportChannel>> {
        Ok(Box::new(TcpChannel::new(target, self.config.clone())))
    }
}

/// A TCP channel to one remote endpoint.
pub struct TcpChannel {
    address: String,
    config: TransportConfig,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpChannel {
    /// Create an unopened channel to `target` (`host:port`, with an
    /// optional `tcp://` prefix).
    pub fn new(target: &str, config: TransportConfig) -> Self {
        Self {
            address: target.to_string(),
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    fn socket_address(&self) -> &str {
        self.address.strip_prefix("tcp://").unwrap_or(&self.address)
    }

    async fn write_frame(&self, message: &Message, budget: &TimeBudget) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("channel to {} is not open", self.address)))?;

        budget
            .run("transport send", async {
                writer.write_all(&frame).await?;
                writer.flush().await?;
                Ok(())
            })
            .await
    }

    async fn read_frame(&self, budget: &TimeBudget) -> Result<Option<Message>> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("channel to {} is not open", self.address)))?;

        let max_frame = self.config.max_frame_bytes;
        budget
            .run("transport receive", async {
                let mut len_buf = [0u8; 4];
                match reader.read_exact(&mut len_buf).await {
                    Ok(_) => {},
                    // Clean EOF at a frame boundary: the peer closed
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                }

                let len = u32::from_be_bytes(len_buf) as usize;
                if len > max_frame {
                    return Err(Error::Transport(format!(
                        "frame of {len} bytes exceeds limit of {max_frame}"
                    )));
                }

                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                let message = serde_json::from_slice(&payload)?;
                Ok(Some(message))
            })
            .await
    }
}

impl TransportChannel for TcpChannel {
    fn open<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let addr = self.socket_address().to_string();
            let stream = budget
                .run("transport open", async {
                    TcpStream::connect(&addr).await.map_err(Error::from)
                })
                .await
                .map_err(|e| match e {
                    Error::Io(io) => {
                        Error::Transport(format!("failed to connect to {addr}: {io}"))
                    },
                    other => other,
                })?;

            stream.set_nodelay(true).ok();
            let (read_half, write_half) = stream.into_split();
            *self.reader.lock().await = Some(read_half);
            *self.writer.lock().await = Some(write_half);

            debug!(address = %self.address, "tcp channel open");
            Ok(())
        })
    }

    fn close<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if let Some(mut writer) = self.writer.lock().await.take() {
                budget
                    .run("transport close", async {
                        writer.shutdown().await.map_err(Error::from)
                    })
                    .await?;
            }
            self.reader.lock().await.take();
            debug!(address = %self.address, "tcp channel closed");
            Ok(())
        })
    }

    fn abort(&self) {
        // Best effort: dropping the halves closes the socket. A half held
        // by an in-flight call is released when that call returns.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        warn!(address = %self.address, "tcp channel aborted");
    }

    fn send<'a>(&'a self, message: Message, budget: &'a TimeBudget) -> TransportFuture<'a, ()> {
        Box::pin(async move { self.write_frame(&message, budget).await })
    }

    fn request<'a>(
        &'a self,
        message: Message,
        budget: &'a TimeBudget,
    ) -> TransportFuture<'a, Option<Message>> {
        Box::pin(async move {
            self.write_frame(&message, budget).await?;
            self.read_frame(budget).await
        })
    }

    fn try_receive<'a>(&'a self, budget: &'a TimeBudget) -> TransportFuture<'a, Option<Message>> {
        Box::pin(self.read_frame(budget))
    }

    fn remote_address(&self) -> &str {
        &self.address
    }
}
