//! Burrow: IP-over-DNS tunnel server
//!
//! Burrow terminates DNS queries for a configured parent domain and turns
//! them into a datagram link: queries carry encoded upstream IP fragments
//! in their owner names, answers carry downstream fragments in their
//! records. A recursive resolver in the middle neither knows nor cares.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  DNS   ┌────────────┐        ┌───────────────┐
//! │ resolver │───────▶│ dispatcher │───────▶│ session slots │
//! └──────────┘        └────────────┘        │ windows/qmem/ │
//!      ▲                     │              │ answer cache  │
//!      │              ┌───────────┐         └──────┬────────┘
//!      └──────────────│ scheduler │◀───────────────┘
//!                     └───────────┘      virtual interface
//! ```
//!
//! The dispatcher classifies each query under the parent label and runs the
//! matching command handler; the scheduler pairs parked queries with
//! outgoing fragments and answers them at the latest safe moment. All of it
//! runs on a single task, so per-user state needs no locking.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use burrow::{Server, ServerConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), burrow::TunnelError> {
//!     let config = ServerConfig {
//!         topdomain: "t.example.com".into(),
//!         password: "secret".into(),
//!         ..ServerConfig::default()
//!     };
//!     let (handle, _backend) = burrow::tun::channel();
//!     Server::bind(config, handle).await?.run().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod dns;
pub mod dnscache;
pub mod frame;
pub mod fwquery;
pub mod login;
pub mod qmem;
pub mod server;
pub mod tun;
pub mod users;
pub mod window;

// Re-export core types
pub use codec::{Codec, Downenc};
pub use config::ServerConfig;
pub use dns::{Query, QueryType};
pub use server::{Server, PROTOCOL_VERSION};
pub use users::{TunUser, UserTable, MAX_USERS};
pub use window::{Fragment, WindowBuffer};

/// Tunnel error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Payload failed to decode under the selected codec
    #[error("codec error: {0}")]
    Codec(String),

    /// Malformed wire data
    #[error("bad packet: {0}")]
    BadPacket(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
