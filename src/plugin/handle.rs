//! One live plugin instance and its lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::discovery::{DiscoveryResult, PluginIdentity};
use super::registry::ReleasePolicy;
use crate::connection::{Connection, ConnectionState};
use crate::error::{IpcError, Result};
use crate::protocol::{MessageContract, ProtocolVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    Uninitialized,
    Launching,
    Handshaking,
    Ready,
    Faulted,
    Disposing,
    Disposed,
}

impl PluginState {
    pub fn can_transition_to(self, to: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, to),
            (Uninitialized, Launching)
                | (Uninitialized, Faulted)
                | (Launching, Handshaking)
                | (Launching, Faulted)
                | (Handshaking, Ready)
                | (Handshaking, Faulted)
                | (Ready, Faulted)
                | (Ready, Disposing)
                | (Faulted, Disposing)
                | (Disposing, Disposed)
        )
    }

    /// Disposing or disposed: the handle will never serve another request.
    pub fn is_retired(self) -> bool {
        matches!(self, PluginState::Disposing | PluginState::Disposed)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Diagnostic snapshot of a handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub identity: PluginIdentity,
    pub instance_id: u64,
    pub state: PluginState,
    pub ref_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<ProtocolVersion>,
}

#[derive(Debug)]
struct Lifecycle {
    state: PluginState,
    ref_count: usize,
    dispose_requested: bool,
}

/// Couples a launched plugin with its connection.
///
/// Handles are owned by the registry; callers reach them through a
/// [`PluginLease`](super::PluginLease).
pub struct PluginHandle {
    instance_id: u64,
    discovery: DiscoveryResult,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    connection: OnceLock<Arc<Connection>>,
    protocol_version: OnceLock<ProtocolVersion>,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("instance_id", &self.instance_id)
            .field("identity", self.identity())
            .field("state", &self.state())
            .finish()
    }
}

impl PluginHandle {
    pub(crate) fn new(instance_id: u64, discovery: DiscoveryResult) -> Self {
        Self {
            instance_id,
            discovery,
            created_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: PluginState::Uninitialized,
                ref_count: 0,
                dispose_requested: false,
            }),
            connection: OnceLock::new(),
            protocol_version: OnceLock::new(),
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn identity(&self) -> &PluginIdentity {
        self.discovery.identity()
    }

    pub fn discovery(&self) -> &DiscoveryResult {
        &self.discovery
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version.get().copied()
    }

    /// Current state. A ready handle whose connection broke reports
    /// `Faulted`.
    pub fn state(&self) -> PluginState {
        let state = self.lock().state;
        if state == PluginState::Ready && !self.connection_open() {
            PluginState::Faulted
        } else {
            state
        }
    }

    pub fn ref_count(&self) -> usize {
        self.lock().ref_count
    }

    pub fn is_dispose_requested(&self) -> bool {
        self.lock().dispose_requested
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            identity: self.identity().clone(),
            instance_id: self.instance_id,
            state: self.state(),
            ref_count: self.ref_count(),
            created_at: self.created_at,
            protocol_version: self.protocol_version(),
        }
    }

    /// Why the connection faulted, if it did.
    pub fn fault_reason(&self) -> Option<String> {
        self.connection
            .get()
            .and_then(|connection| connection.fault_reason())
    }

    /// The connection, as long as the handle can still serve requests.
    pub fn connection(&self) -> Result<Arc<Connection>> {
        let state = self.lock().state;
        if state.is_retired() {
            return Err(IpcError::Disposed(self.identity().to_string()));
        }

        let connection = self.connection.get().ok_or_else(|| {
            IpcError::ConnectionFault(format!("plugin '{}' is {}", self.identity(), state))
        })?;

        match connection.state() {
            ConnectionState::Open => Ok(Arc::clone(connection)),
            _ => Err(IpcError::ConnectionFault(
                connection
                    .fault_reason()
                    .unwrap_or_else(|| "connection closed".to_string()),
            )),
        }
    }

    pub async fn send_request<C: MessageContract>(
        &self,
        request: &C::Request,
        cancel: &CancellationToken,
    ) -> Result<C::Response> {
        self.connection()?.send_request::<C>(request, cancel).await
    }

    pub(crate) fn transition(&self, to: PluginState) -> Result<()> {
        let mut lifecycle = self.lock();
        self.step(&mut lifecycle, to)
    }

    pub(crate) fn attach_connection(&self, connection: Arc<Connection>) {
        let _ = self.connection.set(connection);
    }

    pub(crate) fn mark_ready(&self, version: ProtocolVersion) -> Result<()> {
        let _ = self.protocol_version.set(version);
        self.transition(PluginState::Ready)?;
        info!(
            plugin = %self.identity(),
            instance = self.instance_id,
            protocol_version = %version,
            "Plugin ready"
        );
        Ok(())
    }

    /// Record a failed creation.
    pub(crate) fn fail(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state.can_transition_to(PluginState::Faulted) {
            let _ = self.step(&mut lifecycle, PluginState::Faulted);
        }
    }

    /// Count a new lease. Only ready handles with a live connection can be
    /// leased.
    pub(crate) fn retain(&self) -> bool {
        let mut lifecycle = self.lock();
        if lifecycle.state != PluginState::Ready || !self.connection_open() {
            return false;
        }
        lifecycle.ref_count += 1;
        true
    }

    /// Return a lease. When this was the last one and the handle should go
    /// away, the handle is moved to `Disposing` and `true` is returned: the
    /// caller must then finish with [`PluginHandle::complete_dispose`].
    pub(crate) fn release(&self, dispose: bool, policy: ReleasePolicy) -> bool {
        let mut lifecycle = self.lock();
        lifecycle.ref_count = lifecycle.ref_count.saturating_sub(1);
        if dispose {
            lifecycle.dispose_requested = true;
        }

        if lifecycle.ref_count > 0 || lifecycle.state.is_retired() {
            return false;
        }

        let idle_dispose = policy == ReleasePolicy::DisposeWhenIdle;
        if lifecycle.dispose_requested || idle_dispose || !self.connection_open() {
            return self.retire(&mut lifecycle);
        }
        false
    }

    /// Move the handle to `Disposing` unless that already happened. Returns
    /// whether the caller now owns the disposal.
    pub(crate) fn begin_dispose(&self) -> bool {
        let mut lifecycle = self.lock();
        self.retire(&mut lifecycle)
    }

    pub(crate) async fn complete_dispose(&self) {
        if let Some(connection) = self.connection.get() {
            connection.close().await;
        }

        let mut lifecycle = self.lock();
        if self.step(&mut lifecycle, PluginState::Disposed).is_ok() {
            info!(
                plugin = %self.identity(),
                instance = self.instance_id,
                "Plugin disposed"
            );
        }
    }

    /// Dispose now. Idempotent.
    pub async fn dispose(&self) {
        if self.begin_dispose() {
            self.complete_dispose().await;
        }
    }

    fn retire(&self, lifecycle: &mut Lifecycle) -> bool {
        if lifecycle.state.is_retired() {
            return false;
        }
        if lifecycle.state != PluginState::Faulted
            && (lifecycle.state != PluginState::Ready || !self.connection_open())
        {
            let _ = self.step(lifecycle, PluginState::Faulted);
        }
        self.step(lifecycle, PluginState::Disposing).is_ok()
    }

    fn step(&self, lifecycle: &mut Lifecycle, to: PluginState) -> Result<()> {
        let from = lifecycle.state;
        if !from.can_transition_to(to) {
            return Err(IpcError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        lifecycle.state = to;
        debug!(
            plugin = %self.identity(),
            instance = self.instance_id,
            from = %from,
            to = %to,
            "Plugin state changed"
        );
        Ok(())
    }

    fn connection_open(&self) -> bool {
        self.connection
            .get()
            .map(|connection| connection.is_open())
            .unwrap_or(false)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
