//! Terrafeed relay - authority that peers replicate cell edits through
//!
//! Run the relay in your app:
//! ```ignore
//! let relay = Arc::new(Relay::new(RelayConfig::default())?);
//! let _server = RelayServer::start(relay).await?;
//! ```

pub mod config;
pub mod relay;
pub mod server;

pub use config::{RelayConfig, RelayError, DEFAULT_BIND_ADDR};
pub use relay::{PeerId, Relay};
pub use server::RelayServer;
