//! `snp_server`
//!
//! Sample listener driving `snp_core`'s listener/poll-group API: accepts
//! inbound connections, drains them through a shared poll group, and
//! echoes/broadcasts messages back out.

pub mod server;

pub use server::Server;
