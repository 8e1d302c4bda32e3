//! Per-connection state machine: handshake sequencing, keep-alive, reply
//! timeout, close/linger, and the queues a connection owns.

use std::collections::VecDeque;

use crate::clock::UsecTime;
use crate::congestion::Pacer;
use crate::crypto::SessionKeys;
use crate::error::{CloseReason, NetError, Result};
use crate::identity::Identity;
use crate::ipaddr::IpEndpoint;
use crate::reliability::{ReceiveTracker, RetransmitQueue};
use crate::snp::message::Message;
use crate::snp::segment::{MessageDecoder, ReliableRecvBuffer};
use crate::stats::{InstantaneousStats, LifetimeStats};

/// Opaque 32-bit connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    FindingRoute,
    Connected,
    ClosedByPeer,
    ProblemDetectedLocally,
    FinWait,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Handshake sequencing state, tracked separately from the top-level
/// connection state since it only matters while `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStep {
    AwaitingServerHello,
    AwaitingClientFinish,
    Done,
}

pub struct Connection {
    pub handle: ConnectionHandle,
    pub role: Role,
    pub state: ConnectionState,
    pub local_identity: Identity,
    pub peer_identity: Identity,
    pub peer_addr: IpEndpoint,

    handshake_step: Option<HandshakeStep>,
    pub session_keys: Option<SessionKeys>,

    pub send_pkt_num: u64,
    pub recv_tracker: ReceiveTracker,
    pub retransmit: RetransmitQueue,
    pub pacer: Pacer,

    pub recv_buffer: ReliableRecvBuffer,
    pub decoder: MessageDecoder,
    pub inbound: VecDeque<Message>,
    pub next_send_stream_pos: u64,
    pub next_outbound_message_number: u64,
    pub next_inbound_reliable_message_number: u64,

    pub instantaneous_stats: InstantaneousStats,
    pub lifetime_stats: LifetimeStats,

    pub poll_group: Option<u32>,
    pub user_cookie: u64,
    pub name: String,

    pub close_reason: Option<CloseReason>,
    pub close_debug: String,
    pub linger: bool,
    /// Set when entering `FinWait`; `on_tick` forces the connection `Dead`
    /// once `now` reaches this even if reliable bytes are still unacked
    /// (§4.1: linger waits for acks "or until a timeout, whichever comes
    /// first").
    linger_deadline: Option<UsecTime>,

    pub last_send_time: UsecTime,
    pub last_recv_time: UsecTime,
    pub reply_timeout_count: u32,
}

impl Connection {
    pub fn new(
        handle: ConnectionHandle,
        role: Role,
        local_identity: Identity,
        peer_addr: IpEndpoint,
        lurch_window: u64,
        reservoir_capacity: usize,
        pacer_initial_rate: u32,
        mtu: usize,
        now: UsecTime,
    ) -> Self {
        Self {
            handle,
            role,
            state: ConnectionState::None,
            local_identity,
            peer_identity: Identity::Invalid,
            peer_addr,
            handshake_step: None,
            session_keys: None,
            send_pkt_num: 0,
            recv_tracker: ReceiveTracker::new(lurch_window),
            retransmit: RetransmitQueue::new(),
            pacer: Pacer::new(pacer_initial_rate, 2 * mtu as u32, now),
            recv_buffer: ReliableRecvBuffer::new(),
            decoder: MessageDecoder::new(),
            inbound: VecDeque::new(),
            next_send_stream_pos: 0,
            next_outbound_message_number: 0,
            next_inbound_reliable_message_number: 0,
            instantaneous_stats: InstantaneousStats::default(),
            lifetime_stats: LifetimeStats::new(reservoir_capacity),
            poll_group: None,
            user_cookie: 0,
            name: String::new(),
            close_reason: None,
            close_debug: String::new(),
            linger: false,
            linger_deadline: None,
            last_send_time: now,
            last_recv_time: now,
            reply_timeout_count: 0,
        }
    }

    /// Event: `AppConnect`. Only valid from `None`.
    pub fn on_app_connect(&mut self) -> Result<()> {
        self.require_state(ConnectionState::None)?;
        self.state = ConnectionState::Connecting;
        self.handshake_step = Some(HandshakeStep::AwaitingServerHello);
        Ok(())
    }

    /// Event: `AppAccept`, on the callee side after an inbound handshake
    /// request has produced a `Connecting` connection.
    pub fn on_app_accept(&mut self) -> Result<()> {
        self.require_state(ConnectionState::Connecting)?;
        self.handshake_step = Some(HandshakeStep::AwaitingClientFinish);
        Ok(())
    }

    /// Event: `RecvHandshakeReply` (caller receives ServerHello).
    pub fn on_recv_server_hello(&mut self, peer_identity: Identity, session_keys: SessionKeys, now: UsecTime) -> Result<()> {
        self.require_state(ConnectionState::Connecting)?;
        if self.handshake_step != Some(HandshakeStep::AwaitingServerHello) {
            return Err(NetError::InvalidState("not awaiting ServerHello".to_string()));
        }
        self.peer_identity = peer_identity;
        self.session_keys = Some(session_keys);
        self.handshake_step = Some(HandshakeStep::Done);
        self.state = ConnectionState::Connected;
        self.last_recv_time = now;
        Ok(())
    }

    /// Event: `RecvHandshakeRequest`/Finish (callee receives ClientFinish
    /// after having accepted).
    pub fn on_recv_client_finish(&mut self, session_keys: SessionKeys, now: UsecTime) -> Result<()> {
        self.require_state(ConnectionState::Connecting)?;
        if self.handshake_step != Some(HandshakeStep::AwaitingClientFinish) {
            return Err(NetError::InvalidState("not awaiting ClientFinish".to_string()));
        }
        self.session_keys = Some(session_keys);
        self.handshake_step = Some(HandshakeStep::Done);
        self.state = ConnectionState::Connected;
        self.last_recv_time = now;
        Ok(())
    }

    /// Event: `RecvData`. Only meaningful while `Connected` (or `FinWait`,
    /// where inbound data continues to be processed so that a lingering
    /// peer's final bytes are still delivered).
    pub fn on_recv_data(&mut self, now: UsecTime) -> Result<()> {
        match self.state {
            ConnectionState::Connected | ConnectionState::FinWait => {
                self.last_recv_time = now;
                Ok(())
            }
            _ => Err(NetError::InvalidState(format!("cannot receive data in state {:?}", self.state))),
        }
    }

    /// Event: `RecvClose`. The peer sent a close frame (I4: this state
    /// never transitions back to `Connected`).
    pub fn on_recv_close(&mut self, reason: CloseReason, debug: String) {
        if matches!(self.state, ConnectionState::Dead) {
            return;
        }
        self.state = ConnectionState::ClosedByPeer;
        self.close_reason = Some(reason);
        self.close_debug = debug;
        self.inbound.clear();
    }

    /// Event: `AppClose(reason, debug, linger)`. `now`/`linger_timeout_ms`
    /// bound how long a linger close is allowed to wait for pending
    /// reliable bytes to be acked before `on_tick` tears it down anyway.
    pub fn on_app_close(&mut self, reason: CloseReason, debug: String, linger: bool, now: UsecTime, linger_timeout_ms: u64) {
        if matches!(self.state, ConnectionState::Dead | ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally) {
            self.state = ConnectionState::Dead;
            return;
        }
        self.close_reason = Some(reason);
        self.close_debug = debug;
        if linger && self.retransmit.in_flight_count() > 0 {
            self.linger = true;
            self.linger_deadline = Some(now.saturating_add(std::time::Duration::from_millis(linger_timeout_ms)));
            self.state = ConnectionState::FinWait;
        } else {
            self.inbound.clear();
            self.state = ConnectionState::Dead;
        }
    }

    /// Event: `Tick`. Drives linger completion (or its timeout) and is the
    /// hook a connection-owner calls once per scheduler wakeup.
    pub fn on_tick(&mut self, now: UsecTime) {
        if self.state != ConnectionState::FinWait {
            return;
        }
        let acked_out = self.retransmit.in_flight_count() == 0;
        let timed_out = self.linger_deadline.is_some_and(|deadline| now >= deadline);
        if acked_out || timed_out {
            self.inbound.clear();
            self.linger_deadline = None;
            self.state = ConnectionState::Dead;
        }
    }

    /// Event: a fault was detected locally (malformed packet on a
    /// connected endpoint, AEAD failure, etc).
    pub fn on_problem_detected(&mut self, reason: CloseReason, debug: String) {
        if matches!(self.state, ConnectionState::Dead) {
            return;
        }
        self.state = ConnectionState::ProblemDetectedLocally;
        self.close_reason = Some(reason);
        self.close_debug = debug;
        self.inbound.clear();
    }

    /// Event: `ReplyTimeout`. After `max_count` consecutive timeouts the
    /// connection is declared lost.
    pub fn on_reply_timeout(&mut self, max_count: u32) {
        self.reply_timeout_count += 1;
        if self.reply_timeout_count >= max_count {
            self.on_problem_detected(CloseReason::ReplyTimeoutAggregate, "reply timeout aggregate".to_string());
        }
    }

    pub fn on_reply_received(&mut self) {
        self.reply_timeout_count = 0;
    }

    /// Checks silence against `timeout_connected_ms`; called periodically
    /// by the owning service.
    pub fn check_silence_timeout(&mut self, now: UsecTime, timeout_connected_ms: u64) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let silence = now.saturating_sub(self.last_recv_time);
        if silence.as_millis() as u64 >= timeout_connected_ms {
            self.on_problem_detected(CloseReason::Timeout, "no packets received within timeout".to_string());
        }
    }

    pub fn needs_keepalive(&self, now: UsecTime, keepalive_ms: u64) -> bool {
        self.state == ConnectionState::Connected
            && now.saturating_sub(self.last_send_time).as_millis() as u64 >= keepalive_ms
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ConnectionState::Dead)
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }

    fn require_state(&self, expected: ConnectionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NetError::InvalidState(format!("expected {:?}, got {:?}", expected, self.state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_session_keys;
    use crate::ipaddr::IpAddr;

    fn test_conn(role: Role) -> Connection {
        Connection::new(
            ConnectionHandle(1),
            role,
            Identity::Invalid,
            IpEndpoint { ip: IpAddr::v4(127, 0, 0, 1), port: 27015 },
            128,
            1000,
            128_000,
            1200,
            UsecTime(0),
        )
    }

    fn fake_keys() -> SessionKeys {
        derive_session_keys(&[0u8; 32], b"transcript")
    }

    #[test]
    fn conn_001_caller_handshake_sequence() {
        let mut c = test_conn(Role::Caller);
        assert_eq!(c.state, ConnectionState::None);
        c.on_app_connect().unwrap();
        assert_eq!(c.state, ConnectionState::Connecting);
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(100)).unwrap();
        assert_eq!(c.state, ConnectionState::Connected);
    }

    #[test]
    fn conn_002_callee_handshake_sequence() {
        let mut c = test_conn(Role::Callee);
        c.state = ConnectionState::Connecting;
        c.on_app_accept().unwrap();
        c.on_recv_client_finish(fake_keys(), UsecTime(100)).unwrap();
        assert_eq!(c.state, ConnectionState::Connected);
    }

    #[test]
    fn conn_003_app_close_without_linger_is_immediate() {
        let mut c = test_conn(Role::Caller);
        c.on_app_connect().unwrap();
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(0)).unwrap();
        c.on_app_close(CloseReason::AppDefined(0), "bye".to_string(), false, UsecTime(0), 15_000);
        assert_eq!(c.state, ConnectionState::Dead);
    }

    #[test]
    fn s6_linger_close_waits_for_in_flight() {
        let mut c = test_conn(Role::Caller);
        c.on_app_connect().unwrap();
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(0)).unwrap();
        c.retransmit.on_send(1, 0, vec![0u8; 1024]);
        c.on_app_close(CloseReason::AppDefined(0), "bye".to_string(), true, UsecTime(0), 15_000);
        assert_eq!(c.state, ConnectionState::FinWait);
        c.on_tick(UsecTime(0));
        assert_eq!(c.state, ConnectionState::FinWait);
        c.retransmit.on_ack(&[1]);
        c.on_tick(UsecTime(0));
        assert_eq!(c.state, ConnectionState::Dead);
    }

    #[test]
    fn conn_007_linger_close_times_out_if_peer_never_acks() {
        let mut c = test_conn(Role::Caller);
        c.on_app_connect().unwrap();
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(0)).unwrap();
        c.retransmit.on_send(1, 0, vec![0u8; 1024]);
        c.on_app_close(CloseReason::AppDefined(0), "bye".to_string(), true, UsecTime(0), 15_000);
        assert_eq!(c.state, ConnectionState::FinWait);
        // Peer never acks; still within the linger timeout.
        c.on_tick(UsecTime(14_999_000));
        assert_eq!(c.state, ConnectionState::FinWait);
        // Past the linger timeout: torn down regardless of in-flight bytes.
        c.on_tick(UsecTime(15_000_000));
        assert_eq!(c.state, ConnectionState::Dead);
    }

    #[test]
    fn conn_004_recv_close_sets_closed_by_peer_and_is_sticky() {
        let mut c = test_conn(Role::Caller);
        c.on_app_connect().unwrap();
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(0)).unwrap();
        c.on_recv_close(CloseReason::RemoteClose, "done".to_string());
        assert_eq!(c.state, ConnectionState::ClosedByPeer);
        // I4: never transitions back to Connected.
        assert!(c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(1)).is_err());
        assert_eq!(c.state, ConnectionState::ClosedByPeer);
    }

    #[test]
    fn conn_005_reply_timeout_aggregate_kills_connection() {
        let mut c = test_conn(Role::Caller);
        c.on_app_connect().unwrap();
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(0)).unwrap();
        for _ in 0..4 {
            c.on_reply_timeout(5);
            assert_eq!(c.state, ConnectionState::Connected);
        }
        c.on_reply_timeout(5);
        assert_eq!(c.state, ConnectionState::ProblemDetectedLocally);
        assert_eq!(c.close_reason, Some(CloseReason::ReplyTimeoutAggregate));
    }

    #[test]
    fn conn_006_silence_timeout() {
        let mut c = test_conn(Role::Caller);
        c.on_app_connect().unwrap();
        c.on_recv_server_hello(Identity::Invalid, fake_keys(), UsecTime(0)).unwrap();
        c.check_silence_timeout(UsecTime(20_000_000), 20_000);
        assert_eq!(c.state, ConnectionState::ProblemDetectedLocally);
        assert_eq!(c.close_reason, Some(CloseReason::Timeout));
    }
}
