//! Plugin registry
//!
//! Owns at most one live [`PluginHandle`] per plugin identity and hands out
//! [`PluginLease`]s on it:
//!
//! - **Shared creation**: callers racing on the same identity all wait on a
//!   single launch and handshake, which runs as its own task so an impatient
//!   caller cannot abort it for the others
//! - **Ref counting**: leases count usage; what happens when the last one is
//!   returned depends on the [`ReleasePolicy`] and on whether disposal was
//!   requested
//! - **Eviction**: a faulted handle is disposed in the background and replaced
//!   on the next acquire

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::discovery::{DiscoveryResult, PluginIdentity};
use super::handle::{PluginHandle, PluginInfo, PluginState};
use crate::connection::{Connection, ConnectionOptions, RequestHandler};
use crate::error::{IpcError, Result};
use crate::protocol::handshake::{self, HandshakeHandler};
use crate::protocol::log::LogHandler;
use crate::protocol::{methods, ContractRegistry};
use crate::transport::PluginLauncher;

/// What happens when the last lease on a handle is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleasePolicy {
    /// Keep the plugin running for the next caller.
    #[default]
    KeepAlive,
    /// Dispose the plugin as soon as nobody uses it.
    DisposeWhenIdle,
}

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub handshake_timeout: Duration,
    pub connection: ConnectionOptions,
    pub release_policy: ReleasePolicy,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            connection: ConnectionOptions::default(),
            release_policy: ReleasePolicy::default(),
        }
    }
}

type Creation = Shared<BoxFuture<'static, Result<Arc<PluginHandle>>>>;

enum Slot {
    Creating { instance_id: u64, task: Creation },
    Ready(Arc<PluginHandle>),
}

impl Slot {
    fn is_creation(&self, id: u64) -> bool {
        matches!(self, Slot::Creating { instance_id, .. } if *instance_id == id)
    }

    fn holds(&self, handle: &Arc<PluginHandle>) -> bool {
        matches!(self, Slot::Ready(current) if Arc::ptr_eq(current, handle))
    }
}

enum Lookup {
    Leased(Arc<PluginHandle>),
    Wait(Creation),
}

#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    launcher: Arc<dyn PluginLauncher>,
    contracts: Arc<ContractRegistry>,
    options: RegistryOptions,
    handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    slots: DashMap<PluginIdentity, Slot>,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl PluginRegistry {
    pub fn new(
        launcher: Arc<dyn PluginLauncher>,
        contracts: Arc<ContractRegistry>,
        options: RegistryOptions,
    ) -> Self {
        Self::with_handlers(launcher, contracts, options, Vec::new())
    }

    /// Registry whose connections also answer the given inbound methods,
    /// on top of the built-in `Handshake` and `Log` handlers.
    pub fn with_handlers(
        launcher: Arc<dyn PluginLauncher>,
        contracts: Arc<ContractRegistry>,
        options: RegistryOptions,
        handlers: Vec<(String, Arc<dyn RequestHandler>)>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                launcher,
                contracts,
                options,
                handlers,
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.inner.contracts
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Lease a ready handle for `discovery`, creating it if needed.
    ///
    /// Cancelling `cancel` abandons the wait with `AcquireCancelled`; a
    /// creation already under way keeps running for the other waiters.
    pub async fn acquire(
        &self,
        discovery: &DiscoveryResult,
        cancel: &CancellationToken,
    ) -> Result<PluginLease> {
        let plugin = discovery.identity().to_string();

        if !discovery.is_valid() {
            return Err(IpcError::Launch {
                plugin,
                reason: format!("plugin file state is {:?}", discovery.file_state()),
            });
        }

        let mut retried = false;
        loop {
            if self.is_closed() {
                return Err(IpcError::RegistryClosed);
            }

            let creation = match self.inner.lookup(discovery) {
                Lookup::Leased(handle) => return Ok(self.lease(handle)),
                Lookup::Wait(creation) => creation,
            };

            let handle = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(plugin = %plugin, "Acquire cancelled while waiting for creation");
                    return Err(IpcError::AcquireCancelled { plugin });
                }
                result = creation => result?,
            };

            if handle.retain() {
                return Ok(self.lease(handle));
            }

            // The plugin died between its handshake and our lease. Report it
            // to this waiter instead of launching it again.
            if let Some(reason) = handle.fault_reason() {
                warn!(
                    plugin = %plugin,
                    instance = handle.instance_id(),
                    reason = %reason,
                    "Plugin failed right after creation"
                );
                self.inner.evict(&handle);
                tokio::spawn(async move { handle.dispose().await });
                return Err(IpcError::ConnectionFault(reason));
            }

            if retried {
                return Err(IpcError::Disposed(plugin));
            }
            retried = true;
            debug!(
                plugin = %plugin,
                instance = handle.instance_id(),
                "Created plugin was disposed before it could be leased, retrying"
            );
        }
    }

    /// Return a lease. The handle stays alive unless the release policy or
    /// an earlier dispose request says otherwise.
    pub async fn release(&self, lease: PluginLease) {
        let handle = lease.into_handle();
        self.inner.finish(handle, false).await;
    }

    /// Return a lease and dispose the handle once no other lease remains.
    pub async fn release_and_dispose(&self, lease: PluginLease) {
        let handle = lease.into_handle();
        self.inner.finish(handle, true).await;
    }

    /// Snapshot of every ready handle.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.inner
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Ready(handle) => Some(handle.info()),
                Slot::Creating { .. } => None,
            })
            .collect()
    }

    /// Dispose every handle, let in-flight creations settle, and refuse any
    /// further `acquire`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(plugins = inner.slots.len(), "Shutting down plugin registry");
        inner.shutdown.cancel();

        let identities: Vec<PluginIdentity> =
            inner.slots.iter().map(|slot| slot.key().clone()).collect();

        for identity in identities {
            let Some((_, slot)) = inner.slots.remove(&identity) else {
                continue;
            };
            match slot {
                Slot::Ready(handle) => handle.dispose().await,
                Slot::Creating { task, .. } => {
                    // The creation sees the registry closed and disposes
                    // its own handle.
                    if let Ok(handle) = task.await {
                        handle.dispose().await;
                    }
                }
            }
        }

        info!("Plugin registry shut down");
    }

    fn lease(&self, handle: Arc<PluginHandle>) -> PluginLease {
        PluginLease {
            handle,
            registry: Arc::clone(&self.inner),
            released: false,
        }
    }
}

impl RegistryInner {
    fn lookup(self: &Arc<Self>, discovery: &DiscoveryResult) -> Lookup {
        match self.slots.entry(discovery.identity().clone()) {
            Entry::Occupied(mut entry) => {
                let stale = match entry.get() {
                    Slot::Creating { task, .. } => return Lookup::Wait(task.clone()),
                    Slot::Ready(handle) if handle.retain() => {
                        return Lookup::Leased(Arc::clone(handle))
                    }
                    Slot::Ready(handle) => Arc::clone(handle),
                };

                warn!(
                    plugin = %stale.identity(),
                    instance = stale.instance_id(),
                    state = %stale.state(),
                    "Evicting unusable plugin"
                );
                tokio::spawn(async move { stale.dispose().await });

                let (instance_id, task) = self.start_creation(discovery);
                entry.insert(Slot::Creating {
                    instance_id,
                    task: task.clone(),
                });
                Lookup::Wait(task)
            }
            Entry::Vacant(entry) => {
                let (instance_id, task) = self.start_creation(discovery);
                entry.insert(Slot::Creating {
                    instance_id,
                    task: task.clone(),
                });
                Lookup::Wait(task)
            }
        }
    }

    fn start_creation(self: &Arc<Self>, discovery: &DiscoveryResult) -> (u64, Creation) {
        let instance_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let plugin = discovery.identity().to_string();

        let inner = Arc::clone(self);
        let discovery = discovery.clone();
        let span = tracing::info_span!("create_plugin", plugin = %plugin, instance = instance_id);
        let task = tokio::spawn(
            async move { inner.create(instance_id, discovery).await }.instrument(span),
        );

        let creation = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(IpcError::Launch {
                    plugin,
                    reason: format!("creation task failed: {e}"),
                }),
            }
        }
        .boxed()
        .shared();

        (instance_id, creation)
    }

    async fn create(
        self: Arc<Self>,
        instance_id: u64,
        discovery: DiscoveryResult,
    ) -> Result<Arc<PluginHandle>> {
        let handle = Arc::new(PluginHandle::new(instance_id, discovery));
        let identity = handle.identity().clone();

        match self.initialize(&handle).await {
            Ok(()) => {
                if self.promote(&handle) {
                    Ok(handle)
                } else {
                    debug!(plugin = %identity, "Registry closed during creation");
                    self.slots
                        .remove_if(&identity, |_, slot| slot.is_creation(instance_id));
                    handle.dispose().await;
                    Err(IpcError::RegistryClosed)
                }
            }
            Err(e) => {
                warn!(plugin = %identity, error = %e, "Plugin creation failed");
                self.slots
                    .remove_if(&identity, |_, slot| slot.is_creation(instance_id));
                handle.fail();
                handle.dispose().await;
                if self.closed.load(Ordering::SeqCst) {
                    return Err(IpcError::RegistryClosed);
                }
                Err(e)
            }
        }
    }

    async fn initialize(&self, handle: &PluginHandle) -> Result<()> {
        let name = handle.identity().to_string();

        handle.transition(PluginState::Launching)?;
        let channel = self.launcher.launch(handle.discovery()).await?;

        handle.transition(PluginState::Handshaking)?;
        let mut handlers: Vec<(String, Arc<dyn RequestHandler>)> = vec![
            (methods::HANDSHAKE.to_string(), Arc::new(HandshakeHandler)),
            (methods::LOG.to_string(), Arc::new(LogHandler::new(name.clone()))),
        ];
        handlers.extend(self.handlers.iter().cloned());

        let connection = Arc::new(Connection::open_with_handlers(
            name.clone(),
            channel,
            Arc::clone(&self.contracts),
            self.options.connection.clone(),
            handlers,
        ));
        handle.attach_connection(Arc::clone(&connection));

        let version = handshake::perform(
            &connection,
            &name,
            self.options.handshake_timeout,
            &self.shutdown,
        )
        .await?;

        handle.mark_ready(version)
    }

    /// Replace the creation slot with the finished handle, unless the
    /// registry was shut down meanwhile.
    fn promote(&self, handle: &Arc<PluginHandle>) -> bool {
        let Some(mut slot) = self.slots.get_mut(handle.identity()) else {
            return false;
        };
        if self.closed.load(Ordering::SeqCst) || !slot.is_creation(handle.instance_id()) {
            return false;
        }
        *slot = Slot::Ready(Arc::clone(handle));
        true
    }

    fn evict(&self, handle: &Arc<PluginHandle>) {
        self.slots
            .remove_if(handle.identity(), |_, slot| slot.holds(handle));
    }

    async fn finish(&self, handle: Arc<PluginHandle>, dispose: bool) {
        if handle.release(dispose, self.options.release_policy) {
            self.evict(&handle);
            handle.complete_dispose().await;
        }
    }
}

/// A counted borrow of a ready plugin.
///
/// Hand it back with [`PluginRegistry::release`] or
/// [`PluginRegistry::release_and_dispose`]. Dropping it releases it too.
pub struct PluginLease {
    handle: Arc<PluginHandle>,
    registry: Arc<RegistryInner>,
    released: bool,
}

impl PluginLease {
    pub fn handle(&self) -> &Arc<PluginHandle> {
        &self.handle
    }

    fn into_handle(mut self) -> Arc<PluginHandle> {
        self.released = true;
        Arc::clone(&self.handle)
    }
}

impl Deref for PluginLease {
    type Target = PluginHandle;

    fn deref(&self) -> &PluginHandle {
        &self.handle
    }
}

impl std::fmt::Debug for PluginLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLease")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for PluginLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let handle = Arc::clone(&self.handle);
        if !handle.release(false, self.registry.options.release_policy) {
            return;
        }

        self.registry.evict(&handle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handle.complete_dispose().await });
            }
            Err(_) => warn!(
                plugin = %handle.identity(),
                "Lease dropped outside a runtime, plugin left to kill_on_drop"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginFileState;
    use crate::protocol::{Envelope, MessageType};
    use crate::transport::memory::duplex;
    use crate::transport::Channel;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    /// Holds every launch until released, then answers the handshake.
    #[derive(Default)]
    struct GatedLauncher {
        release: Notify,
    }

    #[async_trait]
    impl PluginLauncher for GatedLauncher {
        async fn launch(&self, _plugin: &DiscoveryResult) -> Result<Arc<dyn Channel>> {
            self.release.notified().await;

            let (host, plugin) = duplex();
            tokio::spawn(async move {
                while let Ok(Some(frame)) = plugin.recv().await {
                    let Ok(request) = Envelope::decode(&frame) else { continue };
                    if request.message_type != MessageType::Request {
                        continue;
                    }
                    let reply = Envelope::response(
                        request.method,
                        request.correlation_id,
                        json!({"responseCode": "Success", "protocolVersion": "2.0.0"}),
                    );
                    if plugin.send(reply.encode().unwrap()).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Arc::new(host))
        }
    }

    #[tokio::test]
    async fn test_creation_finishing_after_close_leaves_no_slot() {
        let launcher = Arc::new(GatedLauncher::default());
        let registry = PluginRegistry::new(
            launcher.clone(),
            Arc::new(ContractRegistry::with_defaults()),
            RegistryOptions::default(),
        );
        let discovery = DiscoveryResult::new("/plugins/gated", "gated", PluginFileState::Valid);

        let acquire = tokio::spawn({
            let registry = registry.clone();
            async move {
                registry
                    .acquire(&discovery, &CancellationToken::new())
                    .await
            }
        });
        while registry.inner.slots.is_empty() {
            tokio::task::yield_now().await;
        }

        registry.inner.closed.store(true, Ordering::SeqCst);
        launcher.release.notify_one();

        let err = acquire.await.unwrap().err().expect("lease granted after close");
        assert!(matches!(err, IpcError::RegistryClosed));
        assert!(registry.inner.slots.is_empty());
    }
}
