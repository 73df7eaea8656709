//! Request/response multiplexer over one plugin channel
//!
//! A [`Connection`] owns a single duplex [`Channel`] and lets any number of
//! callers issue requests over it concurrently:
//!
//! - **Correlation**: every request gets a fresh correlation id and a pending
//!   entry; the reader task resolves exactly that entry when the reply arrives
//! - **Single writer**: writes are serialized behind one lock, while a
//!   dedicated reader task owns the receive path
//! - **Isolation**: a malformed or unexpected frame only affects itself until
//!   violations reach the configured threshold
//! - **Failure**: when the channel breaks, every pending request is resolved
//!   with a connection fault and new requests are refused
//!
//! The plugin may also send requests to the host; those are routed to the
//! [`RequestHandler`] registered for their method.

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IpcError, Result, TransportError};
use crate::protocol::{ContractRegistry, Direction, Envelope, MessageContract, MessageType};
use crate::transport::Channel;

mod dispatch;
mod pending;

pub use dispatch::RequestHandler;
#[cfg(test)]
pub use dispatch::MockRequestHandler;

use dispatch::HandlerTable;
use pending::{PendingGuard, PendingTable, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting requests.
    Open,
    /// The channel broke or the plugin misbehaved too often.
    Faulted,
    /// Closed by the host.
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Faulted,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Faulted => 1,
            ConnectionState::Closed => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Deadline applied to requests that do not carry their own.
    pub request_timeout: Duration,
    /// Protocol violations tolerated before the connection is faulted.
    pub max_protocol_violations: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_protocol_violations: 3,
        }
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

struct Shared {
    name: String,
    channel: Arc<dyn Channel>,
    contracts: Arc<ContractRegistry>,
    options: ConnectionOptions,
    write_lock: Mutex<()>,
    pending: PendingTable,
    handlers: HandlerTable,
    inbound: DashMap<String, CancellationToken>,
    violations: AtomicU32,
    state: AtomicU8,
    fault_reason: StdMutex<Option<String>>,
    shutdown: CancellationToken,
}

enum Wait {
    Reply(Reply),
    Dropped,
    Cancelled,
    TimedOut,
}

impl Connection {
    /// Start multiplexing over `channel`. Must be called inside a tokio
    /// runtime; the reader task is spawned immediately.
    pub fn open(
        name: impl Into<String>,
        channel: Arc<dyn Channel>,
        contracts: Arc<ContractRegistry>,
        options: ConnectionOptions,
    ) -> Self {
        Self::open_with_handlers(name, channel, contracts, options, Vec::new())
    }

    /// Like [`Connection::open`], with inbound handlers installed before the
    /// first frame is read.
    pub fn open_with_handlers(
        name: impl Into<String>,
        channel: Arc<dyn Channel>,
        contracts: Arc<ContractRegistry>,
        options: ConnectionOptions,
        handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    ) -> Self {
        let table = HandlerTable::default();
        for (method, handler) in handlers {
            table.insert(method, handler);
        }

        let shared = Arc::new(Shared {
            name: name.into(),
            channel,
            contracts,
            options,
            write_lock: Mutex::new(()),
            pending: PendingTable::default(),
            handlers: table,
            inbound: DashMap::new(),
            violations: AtomicU32::new(0),
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            fault_reason: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let reader = tokio::spawn(Arc::clone(&shared).run_reader());
        debug!(plugin = %shared.name, "Connection opened");

        Self {
            shared,
            reader: StdMutex::new(Some(reader)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Why the connection faulted, if it did.
    pub fn fault_reason(&self) -> Option<String> {
        self.shared.fault_reason()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn protocol_violations(&self) -> u32 {
        self.shared.violations.load(Ordering::SeqCst)
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.shared.contracts
    }

    pub fn register_handler(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.shared.handlers.insert(method, handler);
    }

    pub fn unregister_handler(&self, method: &str) -> bool {
        self.shared.handlers.remove(method)
    }

    /// Send a typed request and wait for its typed response, using the
    /// connection's default timeout.
    pub async fn send_request<C: MessageContract>(
        &self,
        request: &C::Request,
        cancel: &CancellationToken,
    ) -> Result<C::Response> {
        self.send_request_with_timeout::<C>(request, self.shared.options.request_timeout, cancel)
            .await
    }

    pub async fn send_request_with_timeout<C: MessageContract>(
        &self,
        request: &C::Request,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<C::Response> {
        let payload = self
            .shared
            .contracts
            .encode(C::METHOD, Direction::Request, request)?;

        let response = self.call(C::METHOD, payload, timeout, cancel).await?;

        serde_json::from_value(response.unwrap_or(Value::Null)).map_err(|e| {
            IpcError::ProtocolViolation(format!("invalid {} response: {e}", C::METHOD))
        })
    }

    async fn call(
        &self,
        method: &str,
        payload: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>> {
        let shared = &self.shared;
        shared.ensure_open()?;

        if cancel.is_cancelled() {
            return Err(IpcError::RequestCancelled {
                method: method.to_string(),
            });
        }

        let mut waiter = shared.pending.insert(method);
        let correlation_id = waiter.correlation_id.clone();
        let _guard = PendingGuard::new(&shared.pending, correlation_id.clone());

        // A fault may have drained the table between the first check and
        // the insert above.
        shared.ensure_open()?;

        debug!(
            plugin = %shared.name,
            method = %method,
            correlation_id = %correlation_id,
            "Sending request"
        );

        let mut deadline = Instant::now() + timeout;
        let frame = Envelope::request(method, correlation_id.as_str(), payload).encode()?;

        // The write races the caller's deadline and cancellation too, so a
        // plugin that stops reading cannot hold the caller.
        let writing = AtomicBool::new(false);
        let written = tokio::select! {
            biased;
            result = shared.write_frame(frame, &writing) => Ok(result),
            _ = shared.shutdown.cancelled() => Err(Wait::Dropped),
            _ = cancel.cancelled() => Err(Wait::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(Wait::TimedOut),
        };

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shared.fault(format!("write failed: {e}"));
                return Err(shared.fault_error());
            }
            Err(Wait::Dropped) => return Err(shared.fault_error()),
            Err(stopped) => {
                if writing.load(Ordering::SeqCst) {
                    // Part of the frame may be on the wire; the stream can
                    // no longer be trusted.
                    shared.fault(format!("write of '{method}' request did not complete"));
                }
                return Err(shared.stopped(stopped, method, &correlation_id, timeout));
            }
        }

        let outcome = loop {
            tokio::select! {
                biased;
                reply = &mut waiter.reply => {
                    break match reply {
                        Ok(reply) => Wait::Reply(reply),
                        Err(_) => Wait::Dropped,
                    };
                }
                _ = cancel.cancelled() => break Wait::Cancelled,
                _ = waiter.progress.notified() => {
                    debug!(
                        plugin = %shared.name,
                        correlation_id = %correlation_id,
                        "Progress received, extending deadline"
                    );
                    deadline = Instant::now() + timeout;
                }
                _ = tokio::time::sleep_until(deadline) => break Wait::TimedOut,
            }
        };

        match outcome {
            Wait::Reply(Reply::Response(payload)) => Ok(payload),
            Wait::Reply(Reply::Fault(message)) => Err(IpcError::RemoteFault {
                method: method.to_string(),
                message,
            }),
            Wait::Reply(Reply::Violation(reason)) => Err(IpcError::ProtocolViolation(reason)),
            Wait::Reply(Reply::ConnectionFault(reason)) => Err(IpcError::ConnectionFault(reason)),
            Wait::Dropped => Err(shared.fault_error()),
            stopped => {
                shared.abandon(method, &correlation_id);
                Err(shared.stopped(stopped, method, &correlation_id, timeout))
            }
        }
    }

    /// Close the connection. Pending requests resolve with a connection
    /// fault. Safe to call more than once.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.transition(ConnectionState::Open, ConnectionState::Closed) {
            info!(plugin = %shared.name, "Closing connection");
            shared.fail_pending("connection closed");
        }
        shared.shutdown.cancel();

        if let Err(e) = shared.channel.close().await {
            debug!(plugin = %shared.name, error = %e, "Channel close failed");
        }

        let reader = self.reader.lock().ok().and_then(|mut reader| reader.take());
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.shutdown.cancel();
        if shared.transition(ConnectionState::Open, ConnectionState::Closed) {
            debug!(plugin = %shared.name, "Connection dropped without close");
            shared.close_channel();
        }
    }
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn fault_reason(&self) -> Option<String> {
        self.fault_reason.lock().ok().and_then(|reason| reason.clone())
    }

    fn fault_error(&self) -> IpcError {
        match self.state() {
            ConnectionState::Closed => IpcError::ConnectionFault("connection closed".to_string()),
            _ => IpcError::ConnectionFault(
                self.fault_reason()
                    .unwrap_or_else(|| "connection faulted".to_string()),
            ),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            _ => Err(self.fault_error()),
        }
    }

    /// Write one frame. `writing` is set once the write lock is held and the
    /// frame is handed to the channel.
    async fn write_frame(&self, frame: Bytes, writing: &AtomicBool) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        writing.store(true, Ordering::SeqCst);
        self.channel.send(frame).await?;
        Ok(())
    }

    /// Write an envelope from a background task, so a stalled channel never
    /// blocks the reader or a caller.
    fn send_detached(self: &Arc<Self>, envelope: Envelope) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = match envelope.encode() {
                Ok(frame) => shared.write_frame(frame, &AtomicBool::new(false)).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                debug!(
                    plugin = %shared.name,
                    message_type = %envelope.message_type,
                    correlation_id = %envelope.correlation_id,
                    error = %e,
                    "Failed to send envelope"
                );
            }
        });
    }

    /// Error for a request the caller stopped waiting for.
    fn stopped(&self, wait: Wait, method: &str, correlation_id: &str, timeout: Duration) -> IpcError {
        match wait {
            Wait::TimedOut => {
                warn!(
                    plugin = %self.name,
                    method = %method,
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                IpcError::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                }
            }
            _ => IpcError::RequestCancelled {
                method: method.to_string(),
            },
        }
    }

    /// Forget a request the caller stopped waiting for and tell the plugin,
    /// best effort.
    fn abandon(self: &Arc<Self>, method: &str, correlation_id: &str) {
        if !self.pending.abandon(correlation_id) || !self.channel_usable() {
            return;
        }
        self.send_detached(Envelope::cancel(method, correlation_id));
    }

    fn channel_usable(&self) -> bool {
        self.state() == ConnectionState::Open && !self.channel.is_closed()
    }

    fn fail_pending(&self, reason: &str) {
        for pending in self.pending.drain() {
            let _ = pending.reply.send(Reply::ConnectionFault(reason.to_string()));
        }
    }

    /// Close the channel from a background task. Outside a runtime the
    /// channel is left to its own drop.
    fn close_channel(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = Arc::clone(&self.channel);
        let name = self.name.clone();
        runtime.spawn(async move {
            if let Err(e) = channel.close().await {
                debug!(plugin = %name, error = %e, "Channel close failed");
            }
        });
    }

    fn fault(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.transition(ConnectionState::Open, ConnectionState::Faulted) {
            return;
        }

        if let Ok(mut slot) = self.fault_reason.lock() {
            *slot = Some(reason.clone());
        }

        error!(
            plugin = %self.name,
            pending = self.pending.len(),
            reason = %reason,
            "Connection faulted"
        );

        self.fail_pending(&reason);
        self.shutdown.cancel();
        self.close_channel();
    }

    fn violation(&self, reason: String) {
        let count = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.options.max_protocol_violations;

        warn!(
            plugin = %self.name,
            count = count,
            max = max,
            "Protocol violation: {}",
            reason
        );

        if count >= max {
            self.fault(format!(
                "too many protocol violations ({count}), last: {reason}"
            ));
        }
    }

    async fn run_reader(self: Arc<Self>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = self.channel.recv() => frame,
            };

            match frame {
                Ok(Some(frame)) => self.handle_frame(&frame),
                Ok(None) => {
                    self.fault("plugin closed the connection");
                    break;
                }
                Err(e @ TransportError::FrameTooLarge { .. }) => {
                    self.violation(format!("frame dropped: {e}"));
                }
                Err(e) => {
                    self.fault(format!("receive failed: {e}"));
                    break;
                }
            }

            if self.state() != ConnectionState::Open {
                break;
            }
        }

        debug!(plugin = %self.name, "Reader stopped");
    }

    fn handle_frame(self: &Arc<Self>, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.violation(format!("malformed envelope: {e}"));
                return;
            }
        };

        match envelope.message_type {
            MessageType::Response | MessageType::Fault => self.resolve(envelope),
            MessageType::Progress => {
                if !self.pending.progress(&envelope.correlation_id) {
                    debug!(
                        plugin = %self.name,
                        correlation_id = %envelope.correlation_id,
                        "Progress for unknown request dropped"
                    );
                }
            }
            MessageType::Request => self.dispatch(envelope),
            MessageType::Cancel => match self.inbound.remove(&envelope.correlation_id) {
                Some((_, token)) => token.cancel(),
                None => debug!(
                    plugin = %self.name,
                    correlation_id = %envelope.correlation_id,
                    "Cancel for unknown inbound request dropped"
                ),
            },
        }
    }

    fn resolve(&self, envelope: Envelope) {
        let correlation_id = envelope.correlation_id.as_str();

        let Some(pending) = self.pending.take(correlation_id) else {
            if self.pending.was_abandoned(correlation_id) {
                debug!(
                    plugin = %self.name,
                    correlation_id = %correlation_id,
                    "Late reply for abandoned request dropped"
                );
            } else {
                self.violation(format!(
                    "{} for unknown correlation id '{}'",
                    envelope.message_type, correlation_id
                ));
            }
            return;
        };

        if envelope.method != pending.method {
            let reason = format!(
                "{} for '{}' answered with method '{}'",
                envelope.message_type, pending.method, envelope.method
            );
            self.violation(reason.clone());
            let _ = pending.reply.send(Reply::Violation(reason));
            return;
        }

        if envelope.message_type == MessageType::Fault {
            let message = envelope.fault_message();
            debug!(
                plugin = %self.name,
                method = %pending.method,
                correlation_id = %correlation_id,
                "Plugin reported fault: {}",
                message
            );
            let _ = pending.reply.send(Reply::Fault(message));
            return;
        }

        match self
            .contracts
            .validate(&pending.method, Direction::Response, envelope.payload.as_ref())
        {
            Ok(()) => {
                debug!(
                    plugin = %self.name,
                    method = %pending.method,
                    correlation_id = %correlation_id,
                    "Response received"
                );
                let _ = pending.reply.send(Reply::Response(envelope.payload));
            }
            Err(e) => {
                let reason = e.to_string();
                self.violation(reason.clone());
                let _ = pending.reply.send(Reply::Violation(reason));
            }
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            method,
            correlation_id,
            payload,
            ..
        } = envelope;

        let Some(handler) = self.handlers.get(&method) else {
            warn!(plugin = %self.name, method = %method, "No handler for inbound request");
            let reason = format!("no handler registered for '{method}'");
            self.send_detached(Envelope::fault(method, correlation_id, reason));
            return;
        };

        if self.contracts.contains(&method) {
            if let Err(e) = self
                .contracts
                .validate(&method, Direction::Request, payload.as_ref())
            {
                self.send_detached(Envelope::fault(
                    method.as_str(),
                    correlation_id.as_str(),
                    e.to_string(),
                ));
                self.violation(e.to_string());
                return;
            }
        }

        let token = self.shutdown.child_token();
        self.inbound.insert(correlation_id.clone(), token.clone());

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = tokio::select! {
                result = handler.handle(payload, token.clone()) => Some(result),
                _ = token.cancelled() => None,
            };
            shared.inbound.remove(&correlation_id);

            let reply = match result {
                Some(Ok(response)) => Envelope::response(method, correlation_id, response),
                Some(Err(e)) => Envelope::fault(method, correlation_id, e.to_string()),
                None => {
                    debug!(
                        plugin = %shared.name,
                        correlation_id = %correlation_id,
                        "Inbound request cancelled"
                    );
                    return;
                }
            };
            shared.send_detached(reply);
        });
    }
}
