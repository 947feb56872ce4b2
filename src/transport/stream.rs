//! Transport over any async byte stream pair.
//!
//! Outbound messages are written one per line through the writer task.
//! Inbound bytes go through a [`ReadBuffer`], so the peer may use either
//! newline-delimited or `Content-Length` framing.
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::transport::StreamTransport;
//!
//! // Serve on our own stdin/stdout
//! let transport = StreamTransport::stdio();
//! engine.connect(transport).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BoxFuture, Transport, TransportCallbacks};
use crate::error::{Result, RpcError};
use crate::protocol::{Message, ReadBuffer, DEFAULT_MAX_MESSAGE_SIZE};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Streams handed over at construction, consumed by `start`.
struct Halves {
    reader: BoxedReader,
    writer: BoxedWriter,
}

/// Line-oriented transport over an `AsyncRead` + `AsyncWrite` pair.
pub struct StreamTransport {
    halves: Mutex<Option<Halves>>,
    writer: Mutex<Option<WriterHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    callbacks: Arc<TransportCallbacks>,
    shutdown: CancellationToken,
    writer_config: WriterConfig,
    max_message_size: usize,
    started: AtomicBool,
}

impl StreamTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_callbacks(reader, writer, Arc::new(TransportCallbacks::new()))
    }

    /// Build over streams, reporting into callbacks owned elsewhere.
    pub(crate) fn with_callbacks<R, W>(
        reader: R,
        writer: W,
        callbacks: Arc<TransportCallbacks>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            halves: Mutex::new(Some(Halves {
                reader: Box::new(reader),
                writer: Box::new(writer),
            })),
            writer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            callbacks,
            shutdown: CancellationToken::new(),
            writer_config: WriterConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            started: AtomicBool::new(false),
        }
    }

    /// Transport over this process's own stdin and stdout.
    ///
    /// Use this on the server side of a stdio connection; stdout must not
    /// carry anything else.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Set the inbound message size limit.
    ///
    /// Default: 64 MiB
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    async fn start_inner(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted);
        }
        let Halves { reader, writer } = lock(&self.halves)
            .take()
            .ok_or(RpcError::AlreadyStarted)?;

        let (handle, writer_task) = spawn_writer_task(writer, self.writer_config.clone());
        *lock(&self.writer) = Some(handle);

        // Write failures reach the caller through the send ack; only log here.
        let writer_done = tokio::spawn(async move {
            if let Ok(Err(e)) = writer_task.await {
                tracing::error!("Writer task stopped: {}", e);
            }
        });

        let reader_task = tokio::spawn(read_loop(
            reader,
            self.callbacks.clone(),
            self.shutdown.clone(),
            self.max_message_size,
        ));

        let mut tasks = lock(&self.tasks);
        tasks.push(writer_done);
        tasks.push(reader_task);
        Ok(())
    }

    async fn send_inner(&self, message: Message) -> Result<()> {
        let writer = lock(&self.writer).clone().ok_or(RpcError::NotConnected)?;
        match writer.send(&message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.callbacks
                    .emit_error(RpcError::Transport(format!("send failed: {e}")));
                Err(e)
            }
        }
    }

    async fn close_inner(&self) -> Result<()> {
        self.shutdown.cancel();
        // Dropping the last handle ends the writer task once its queue drains.
        lock(&self.writer).take();
        lock(&self.halves).take();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.callbacks.emit_close();
        Ok(())
    }
}

impl Transport for StreamTransport {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start_inner())
    }

    fn send(&self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.send_inner(message))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.close_inner())
    }

    fn callbacks(&self) -> &TransportCallbacks {
        &self.callbacks
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Read bytes until EOF, error or shutdown, reporting each decoded message.
async fn read_loop<R>(
    mut reader: R,
    callbacks: Arc<TransportCallbacks>,
    shutdown: CancellationToken,
    max_message_size: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = ReadBuffer::with_max_message_size(max_message_size);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::debug!("Stream reached EOF");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    callbacks.emit_error(RpcError::Io(e));
                    break;
                }
            },
        };

        if let Err(e) = buffer.append(&chunk[..n]) {
            callbacks.emit_error(e);
            break;
        }
        loop {
            match buffer.read_message() {
                Ok(Some(message)) => callbacks.emit_message(message),
                Ok(None) => break,
                Err(e) => callbacks.emit_error(e),
            }
        }
    }

    buffer.close();
    callbacks.emit_close();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
