//! `snp_client`
//!
//! Sample client driving `snp_core`'s connection API: dial a listener,
//! exchange reliable and unreliable messages, and surface connection
//! status through a tiny console command set.

pub mod client;

pub use client::Client;
