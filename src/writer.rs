//! Dedicated writer task for stream transports.
//!
//! Every outbound message on a byte stream goes through one task that owns
//! the write half, so concurrent senders never interleave partial writes.
//! Each message carries an ack channel; `send` resolves once the bytes are
//! flushed (or the write failed).
//!
//! # Architecture
//!
//! ```text
//! Engine reply   ─┐
//! Handler notify ─┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► stdout / pipe
//! Caller request ─┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, RpcError};
use crate::protocol::Message;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum messages coalesced into a single write.
const MAX_BATCH_SIZE: usize = 64;

/// A newline-terminated message ready to be written.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Encoded JSON followed by `\n`.
    pub bytes: Bytes,
    ack: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundMessage {
    /// Encode a message as one line.
    pub fn encode(message: &Message) -> Result<Self> {
        let mut bytes = message.encode()?;
        bytes.push(b'\n');
        Ok(Self {
            bytes: Bytes::from(bytes),
            ack: None,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn settle(self, outcome: Result<()>) {
        if let Some(ack) = self.ack {
            let _ = ack.send(outcome);
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the message queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending messages to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
}

impl WriterHandle {
    /// Encode `message`, queue it, and wait until it has been flushed.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let mut outbound = OutboundMessage::encode(message)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        outbound.ack = Some(ack_tx);

        if self.tx.send(outbound).await.is_err() {
            return Err(RpcError::ConnectionClosed);
        }

        // Writer dropped the ack without answering: it shut down mid-batch.
        ack_rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }
}

/// Spawn the writer task and return a handle for sending messages.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer));

    (WriterHandle { tx }, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }

        match write_batch(&mut writer, &batch).await {
            Ok(()) => {
                for msg in batch {
                    msg.settle(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!("Writer failed: {}", e);
                let reason = e.to_string();
                for msg in batch {
                    msg.settle(Err(RpcError::Transport(reason.clone())));
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Coalesce a batch into one buffer and write it with a single flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    if batch.len() == 1 {
        writer.write_all(&batch[0].bytes).await?;
    } else {
        let total: usize = batch.iter().map(OutboundMessage::size).sum();
        let mut buf = BytesMut::with_capacity(total);
        for msg in batch {
            buf.put_slice(&msg.bytes);
        }
        writer.write_all(&buf).await?;
    }

    writer.flush().await?;
    Ok(())
}
