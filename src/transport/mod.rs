use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::plugin::DiscoveryResult;

pub mod memory;
pub mod stdio;

pub use memory::MemoryChannel;
pub use stdio::{StdioChannel, StdioLauncher};

/// A framed duplex byte channel to one plugin.
///
/// One frame carries one envelope. `recv` is only ever called from a single
/// reader task, while `send` may be called from many tasks; implementations
/// must keep the two directions independent so a slow write never stalls a
/// read.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn send(&self, frame: Bytes) -> std::result::Result<(), TransportError>;

    /// Next inbound frame, or `None` once the peer has closed its side.
    async fn recv(&self) -> std::result::Result<Option<Bytes>, TransportError>;

    /// Close the channel and release the process behind it, if any.
    async fn close(&self) -> std::result::Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Starts (or attaches to) a plugin and hands back its channel.
#[async_trait]
pub trait PluginLauncher: Send + Sync + 'static {
    async fn launch(&self, plugin: &DiscoveryResult) -> Result<Arc<dyn Channel>>;
}
