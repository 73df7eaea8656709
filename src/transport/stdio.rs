//! Plugin processes over stdin/stdout
//!
//! Each envelope travels as one line of JSON. stderr is drained into the
//! host log so a chatty plugin can never block on a full pipe.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::cmp;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use super::{Channel, PluginLauncher};
use crate::error::{IpcError, Result, TransportError};
use crate::plugin::DiscoveryResult;

/// Largest accepted line.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Spawns plugin executables and talks to them over stdio.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    shutdown_grace: Duration,
}

impl Default for StdioLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioLauncher {
    pub fn new() -> Self {
        Self {
            args: vec!["-Plugin".to_string()],
            env: HashMap::new(),
            working_dir: None,
            shutdown_grace: Duration::from_secs(1),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[async_trait]
impl PluginLauncher for StdioLauncher {
    async fn launch(&self, plugin: &DiscoveryResult) -> Result<Arc<dyn Channel>> {
        let name = plugin.identity().to_string();
        let launch_error = |reason: String| IpcError::Launch {
            plugin: name.clone(),
            reason,
        };

        let mut cmd = Command::new(plugin.path());
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(format!("failed to spawn process: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("failed to get stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let plugin_name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(plugin = %plugin_name, "stderr: {}", line);
                }
            });
        }

        tracing::info!(plugin = %name, pid = ?child.id(), "Plugin process started");

        Ok(Arc::new(StdioChannel::new(
            name,
            child,
            stdin,
            stdout,
            self.shutdown_grace,
        )))
    }
}

pub struct StdioChannel {
    plugin: String,
    child: Mutex<Child>,
    writer: Mutex<FramedWrite<ChildStdin, LineCodec>>,
    reader: Mutex<FramedRead<ChildStdout, LineCodec>>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl StdioChannel {
    fn new(
        plugin: String,
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            plugin,
            child: Mutex::new(child),
            writer: Mutex::new(FramedWrite::new(stdin, LineCodec::new(MAX_FRAME_BYTES))),
            reader: Mutex::new(FramedRead::new(stdout, LineCodec::new(MAX_FRAME_BYTES))),
            closed: AtomicBool::new(false),
            shutdown_grace,
        }
    }

    #[cfg(unix)]
    fn request_termination(&self, child: &Child) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(plugin = %self.plugin, error = %e, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn request_termination(&self, _child: &Child) {}
}

#[async_trait]
impl Channel for StdioChannel {
    async fn send(&self, frame: Bytes) -> std::result::Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> std::result::Result<Option<Bytes>, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                // Blank lines carry no envelope.
                Some(Ok(Line::Frame(line))) if line.iter().all(u8::is_ascii_whitespace) => continue,
                Some(Ok(Line::Frame(line))) => return Ok(Some(line)),
                Some(Ok(Line::Oversized)) => {
                    tracing::warn!(plugin = %self.plugin, limit = MAX_FRAME_BYTES, "Dropped oversized line");
                    return Err(TransportError::FrameTooLarge {
                        limit: MAX_FRAME_BYTES,
                    });
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            // Already closed by EOF or an earlier call; make sure the
            // process is gone anyway.
            let mut child = self.child.lock().await;
            if let Ok(None) = child.try_wait() {
                let _ = child.kill().await;
            }
            return Ok(());
        }

        // Closing stdin is the polite way to ask a plugin to exit. A writer
        // stuck on a full pipe keeps the lock; the signal below covers that.
        if let Ok(mut writer) = self.writer.try_lock() {
            let closing = SinkExt::<Bytes>::close(&mut *writer);
            let _ = tokio::time::timeout(self.shutdown_grace, closing).await;
        }

        let mut child = self.child.lock().await;
        self.request_termination(&child);

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(plugin = %self.plugin, %status, "Plugin process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(plugin = %self.plugin, error = %e, "Failed to wait for plugin process");
            }
            Err(_) => {
                tracing::warn!(
                    plugin = %self.plugin,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "Plugin did not exit in time, killing it"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(plugin = %self.plugin, error = %e, "Failed to kill plugin process");
                }
            }
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One newline-delimited frame as read from a plugin.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Frame(Bytes),
    /// A line longer than the limit; its bytes were skipped.
    Oversized,
}

/// Newline framing over raw bytes.
///
/// Lines are not required to be UTF-8; a bad line reaches the envelope
/// decoder like any other. An oversized line is skipped up to its newline
/// and reported as [`Line::Oversized`], so the stream keeps going.
#[derive(Debug)]
struct LineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl LineCodec {
    fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Line>> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Line::Oversized));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(line.len() - 1);
                    }
                    return Ok(Some(Line::Frame(line.freeze())));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Line>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(Line::Oversized));
        }
        Ok(Some(Line::Frame(buf.split().freeze())))
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        dst.reserve(frame.len() + 1);
        dst.put(frame);
        dst.put_u8(b'\n');
        Ok(())
    }
}
