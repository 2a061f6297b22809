//! SOCKS5 to multiplexed WebSocket tunnel proxy

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod meter;
pub mod relay;
pub mod server;
pub mod session;
pub mod socks5;
pub mod tunnel;
pub mod version;


// Re-export commonly used items
pub use crate::cli::CLI;
pub use crate::client::{ClientOption, DispatchMode, Socks5Gateway};
pub use crate::error::{Error, Result};
pub use crate::server::{EgressServer, ServerOption};
pub use crate::session::{SessionBroker, TransportSession};
pub use crate::tunnel::{Tunnel, TunnelEvent};
pub use crate::version::VERSION;
