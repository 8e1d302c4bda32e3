//! `snp_core`
//!
//! A connection-oriented, message-oriented transport over UDP: reliable and
//! unreliable messages multiplexed onto one packet stream, authenticated
//! encryption via a Curve25519/Ed25519 handshake, and the congestion,
//! reliability, and statistics machinery a real-time application needs on
//! top of raw datagrams.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (wire format, reliability, congestion,
//!   crypto, connection state machine, public API surface).
//! - Traits for abstraction and dependency injection (`DatagramTransport`).
//! - No `unsafe`.

pub mod api;
pub mod certstore;
pub mod clock;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod ipaddr;
pub mod listener;
pub mod lock;
pub mod percentile;
pub mod pollgroup;
pub mod reliability;
pub mod snp;
pub mod stats;
pub mod transport;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::api::{ConnectionInfo, NetworkingService, QuickStatus};
    pub use crate::config::NetworkingConfig;
    pub use crate::connection::{ConnectionHandle, ConnectionState};
    pub use crate::error::{CloseReason, NetError, Result};
    pub use crate::identity::Identity;
    pub use crate::ipaddr::{IpAddr, IpEndpoint};
    pub use crate::listener::ListenSocketHandle;
    pub use crate::pollgroup::PollGroupHandle;
    pub use crate::snp::{Message, SendFlags};
    pub use crate::transport::{DatagramTransport, UdpTransport};
}
