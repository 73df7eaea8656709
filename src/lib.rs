pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod transport;
