//! Plugin instances and their registry
//!
//! # Modules
//!
//! - `discovery`: what the caller found on disk, and the identity used as the
//!   registry key
//! - `handle`: one running plugin, its connection and lifecycle state
//! - `registry`: creation, sharing, ref counting and disposal of handles

pub mod discovery;
pub mod handle;
pub mod registry;

pub use discovery::{DiscoveryResult, PluginFileState, PluginIdentity};
pub use handle::{PluginHandle, PluginInfo, PluginState};
pub use registry::{PluginLease, PluginRegistry, RegistryOptions, ReleasePolicy};
