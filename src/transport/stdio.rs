//! Child-process transport.
//!
//! Spawns the server as a subprocess and speaks over its stdin/stdout.
//! stderr is never parsed: each line goes to `tracing` or a caller supplied
//! [`StderrSink`].
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::transport::{StdioClientTransport, StdioServerParameters};
//!
//! let params = StdioServerParameters::new("my-server").arg("--verbose");
//! let transport = StdioClientTransport::new(params);
//! engine.connect(transport).await?;
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::{BoxFuture, StreamTransport, Transport, TransportCallbacks};
use crate::error::{Result, RpcError};
use crate::protocol::Message;

/// Receives the child's stderr, one line at a time.
pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

/// How to launch the server process.
#[derive(Debug, Clone, Default)]
pub struct StdioServerParameters {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment variables, added to the inherited environment.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl StdioServerParameters {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// Client side of a stdio connection to a spawned server.
pub struct StdioClientTransport {
    params: StdioServerParameters,
    stderr_sink: Option<StderrSink>,
    callbacks: Arc<TransportCallbacks>,
    stream: Mutex<Option<Arc<StreamTransport>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl StdioClientTransport {
    pub fn new(params: StdioServerParameters) -> Self {
        Self {
            params,
            stderr_sink: None,
            callbacks: Arc::new(TransportCallbacks::new()),
            stream: Mutex::new(None),
            child: tokio::sync::Mutex::new(None),
            stderr_task: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Route the child's stderr to `sink` instead of `tracing`.
    pub fn stderr_sink(mut self, sink: StderrSink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    /// OS process ID of the running child, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    async fn start_inner(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(RpcError::AlreadyStarted);
        }

        let mut child = self.params.command().spawn().map_err(|e| {
            tracing::error!("Failed to spawn {}: {}", self.params.command, e);
            RpcError::Io(e)
        })?;
        tracing::debug!("Spawned {} (pid {:?})", self.params.command, child.id());

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let stderr_task = tokio::spawn(drain_stderr(stderr, self.stderr_sink.clone()));
        *lock(&self.stderr_task) = Some(stderr_task);

        let stream = Arc::new(StreamTransport::with_callbacks(
            stdout,
            stdin,
            self.callbacks.clone(),
        ));
        stream.start().await?;

        *lock(&self.stream) = Some(stream);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn send_inner(&self, message: Message) -> Result<()> {
        let stream = lock(&self.stream).clone().ok_or(RpcError::NotConnected)?;
        stream.send(message).await
    }

    async fn close_inner(&self) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Child already gone: {}", e);
            }
            match child.wait().await {
                Ok(status) => tracing::debug!("Child exited with {}", status),
                Err(e) => tracing::warn!("Failed to wait for child: {}", e),
            }
        }

        let stream = lock(&self.stream).take();
        if let Some(stream) = stream {
            stream.close().await?;
        }
        if let Some(task) = lock(&self.stderr_task).take() {
            task.abort();
        }
        self.callbacks.emit_close();
        Ok(())
    }
}

impl Transport for StdioClientTransport {
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

async fn drain_stderr(stderr: ChildStderr, sink: Option<StderrSink>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match &sink {
                Some(sink) => sink(&line),
                None => tracing::info!(target: "rpcwire::stderr", "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("stderr read failed: {}", e);
                break;
            }
        }
    }
}

fn missing_pipe(name: &str) -> RpcError {
    RpcError::Transport(format!("child {name} was not captured"))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
