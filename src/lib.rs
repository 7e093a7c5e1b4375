//! vpnctl - client-side VPN connection orchestrator
//!
//! Selects an exit node, provisions a local tunnel interface, supervises
//! the helper services that implement the tunnel, and drives a privileged
//! daemon that performs the actual routing and firewall mutations.

pub mod connection;
pub mod daemon;
pub mod dns;
pub mod routing;
pub mod selector;
pub mod session;
pub mod settings;
pub mod storage;
pub mod supervisor;

pub use connection::{Connection, ConnectionError, StatusReport};
pub use session::Session;
pub use settings::Settings;
