//! Configuration: the recognized option set from the external interfaces,
//! plus the fault-injection and fragment-GC knobs.

use serde::{Deserialize, Serialize};

fn default_send_rate_min() -> u32 {
    128_000 / 8
}
fn default_send_rate_max() -> u32 {
    512_000 / 8
}
fn default_mtu() -> usize {
    1200
}
fn default_timeout_initial() -> u64 {
    10_000
}
fn default_timeout_connected() -> u64 {
    20_000
}
fn default_nagle_time_usec() -> u64 {
    5_000
}
fn default_keepalive_ms() -> u64 {
    10_000
}
fn default_linger_timeout_ms() -> u64 {
    15_000
}
fn default_lurch_window() -> u64 {
    128
}
fn default_fragment_max_age_ms() -> u64 {
    10_000
}
fn default_fragment_max_newer_messages() -> u32 {
    64
}
fn default_reply_timeout_max_count() -> u32 {
    5
}
fn default_reservoir_capacity() -> usize {
    1000
}

/// The recognized configuration option set. Every field corresponds to a
/// named option key from the public configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkingConfig {
    /// `SendRateMin`, bytes/sec.
    #[serde(default = "default_send_rate_min")]
    pub send_rate_min: u32,
    /// `SendRateMax`, bytes/sec.
    #[serde(default = "default_send_rate_max")]
    pub send_rate_max: u32,

    /// `FakePacketLoss_Send`, percent in [0, 100].
    #[serde(default)]
    pub fake_packet_loss_send: f32,
    /// `FakePacketLoss_Recv`, percent in [0, 100].
    #[serde(default)]
    pub fake_packet_loss_recv: f32,
    /// `FakePacketLag_Send`, milliseconds of extra one-way delay.
    #[serde(default)]
    pub fake_packet_lag_send_ms: u32,
    /// `FakePacketLag_Recv`, milliseconds of extra one-way delay.
    #[serde(default)]
    pub fake_packet_lag_recv_ms: u32,
    /// `FakePacketReorder_Send`, percent chance a packet is reordered.
    #[serde(default)]
    pub fake_packet_reorder_send: f32,
    /// `FakePacketReorder_Time`, max milliseconds a reordered packet is
    /// held back.
    #[serde(default)]
    pub fake_packet_reorder_time_ms: u32,

    /// `IP_AllowWithoutAuth`: accept connections without a valid identity
    /// certificate (loopback/testing).
    #[serde(default)]
    pub ip_allow_without_auth: bool,

    /// `TimeoutInitial`, milliseconds allowed for handshake completion.
    #[serde(default = "default_timeout_initial")]
    pub timeout_initial_ms: u64,
    /// `TimeoutConnected`, milliseconds of silence before declaring the
    /// connection lost.
    #[serde(default = "default_timeout_connected")]
    pub timeout_connected_ms: u64,
    /// Keep-alive interval: emit an empty data packet after this much
    /// silence on send.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Consecutive reply timeouts before the connection is declared lost.
    #[serde(default = "default_reply_timeout_max_count")]
    pub reply_timeout_max_count: u32,
    /// Bound on a linger close (§4.1): a `FinWait` connection that has not
    /// finished acking its pending reliable bytes within this many
    /// milliseconds is torn down anyway, rather than lingering forever.
    #[serde(default = "default_linger_timeout_ms")]
    pub linger_timeout_ms: u64,

    /// `NagleTime`, microseconds to batch small reliable writes.
    #[serde(default = "default_nagle_time_usec")]
    pub nagle_time_usec: u64,

    /// `MTU`, maximum UDP payload size in bytes.
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// `LogLevel`: minimum tracing level name emitted by the library
    /// (`"trace"`..`"error"`); binaries decide how to apply this to
    /// their own subscriber.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Out-of-order/lurch boundary (packet numbers). Open Question #2:
    /// exposed as a runtime option rather than a compile-time constant.
    #[serde(default = "default_lurch_window")]
    pub lurch_window: u64,

    /// Open Question #3: age-based fragment GC, milliseconds.
    #[serde(default = "default_fragment_max_age_ms")]
    pub fragment_max_age_ms: u64,
    /// Open Question #3: displacement-based fragment GC, message count.
    #[serde(default = "default_fragment_max_newer_messages")]
    pub fragment_max_newer_messages: u32,

    /// Reservoir capacity for `PercentileGenerator` instances.
    #[serde(default = "default_reservoir_capacity")]
    pub percentile_reservoir_capacity: usize,

    /// `SNP_*` debug flags: free-form toggles consumed by the SNP layer
    /// for diagnostics (e.g. forcing small packets). Unrecognized keys
    /// are retained but ignored, per the forward-compatibility rule.
    #[serde(default)]
    pub snp_debug_flags: std::collections::BTreeMap<String, bool>,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        NetworkingConfig {
            send_rate_min: default_send_rate_min(),
            send_rate_max: default_send_rate_max(),
            fake_packet_loss_send: 0.0,
            fake_packet_loss_recv: 0.0,
            fake_packet_lag_send_ms: 0,
            fake_packet_lag_recv_ms: 0,
            fake_packet_reorder_send: 0.0,
            fake_packet_reorder_time_ms: 0,
            ip_allow_without_auth: false,
            timeout_initial_ms: default_timeout_initial(),
            timeout_connected_ms: default_timeout_connected(),
            keepalive_ms: default_keepalive_ms(),
            reply_timeout_max_count: default_reply_timeout_max_count(),
            linger_timeout_ms: default_linger_timeout_ms(),
            nagle_time_usec: default_nagle_time_usec(),
            mtu: default_mtu(),
            log_level: None,
            lurch_window: default_lurch_window(),
            fragment_max_age_ms: default_fragment_max_age_ms(),
            fragment_max_newer_messages: default_fragment_max_newer_messages(),
            percentile_reservoir_capacity: default_reservoir_capacity(),
            snp_debug_flags: Default::default(),
        }
    }
}

impl NetworkingConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
