//! Datagram transport abstraction: a real UDP socket, and a fault-injecting
//! decorator implementing the `FakePacketLoss`/`FakePacketLag`/
//! `FakePacketReorder` configuration knobs for testing.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::clock::{Clock, UsecTime};
use crate::config::NetworkingConfig;
use crate::error::{NetError, Result};
use crate::ipaddr::{IpAddr, IpEndpoint};

fn ip_endpoint_to_socket_addr(ep: IpEndpoint) -> SocketAddr {
    match ep.ip {
        IpAddr::V4 { octets } => SocketAddr::from((octets, ep.port)),
        IpAddr::V6 { octets, .. } => SocketAddr::from((octets, ep.port)),
    }
}

fn socket_addr_to_ip_endpoint(addr: SocketAddr) -> IpEndpoint {
    match addr {
        SocketAddr::V4(a) => IpEndpoint { ip: IpAddr::V4 { octets: a.ip().octets() }, port: a.port() },
        SocketAddr::V6(a) => IpEndpoint { ip: IpAddr::V6 { octets: a.ip().octets(), scope_id: a.scope_id() }, port: a.port() },
    }
}

/// The boundary between the SNP/connection layer and the operating
/// system's network stack. Swappable so tests can inject loss, lag, and
/// reordering without touching a real socket.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, dst: IpEndpoint, payload: &[u8]) -> Result<()>;
    async fn recv_from(&self) -> Result<(IpEndpoint, Vec<u8>)>;
    fn local_addr(&self) -> Result<IpEndpoint>;
}

/// A real UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(local: IpEndpoint) -> Result<Self> {
        let socket = UdpSocket::bind(ip_endpoint_to_socket_addr(local))
            .await
            .map_err(|e| NetError::Internal(format!("UDP bind failed: {e}")))?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, dst: IpEndpoint, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, ip_endpoint_to_socket_addr(dst))
            .await
            .map_err(|e| NetError::Internal(format!("UDP send failed: {e}")))?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(IpEndpoint, Vec<u8>)> {
        let mut buf = vec![0u8; 65536];
        let (n, addr) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| NetError::Internal(format!("UDP recv failed: {e}")))?;
        buf.truncate(n);
        Ok((socket_addr_to_ip_endpoint(addr), buf))
    }

    fn local_addr(&self) -> Result<IpEndpoint> {
        self.socket
            .local_addr()
            .map(socket_addr_to_ip_endpoint)
            .map_err(|e| NetError::Internal(format!("local_addr failed: {e}")))
    }
}

struct HeldPacket {
    release_at: UsecTime,
    seq: u64,
    dst: IpEndpoint,
    payload: Vec<u8>,
}

impl PartialEq for HeldPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}
impl Eq for HeldPacket {}
impl PartialOrd for HeldPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeldPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        other.release_at.cmp(&self.release_at).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Wraps an inner transport and applies the `FakePacketLoss_*`,
/// `FakePacketLag_*`, and `FakePacketReorder_*` knobs to outbound sends,
/// for deterministic-ish loss/jitter/reorder testing without real network
/// impairment.
pub struct FaultInjectingTransport<T: DatagramTransport> {
    inner: Arc<T>,
    cfg: std::sync::Mutex<NetworkingConfig>,
    held: Mutex<BinaryHeap<HeldPacket>>,
    seq: std::sync::atomic::AtomicU64,
    clock: Clock,
}

impl<T: DatagramTransport> FaultInjectingTransport<T> {
    pub fn new(inner: T, cfg: NetworkingConfig) -> Self {
        Self::with_inner(Arc::new(inner), cfg)
    }

    /// Like `new`, but takes an `Arc` the caller already holds so it can
    /// keep inspecting the wrapped transport afterwards.
    pub fn with_inner(inner: Arc<T>, cfg: NetworkingConfig) -> Self {
        Self {
            inner,
            cfg: std::sync::Mutex::new(cfg),
            held: Mutex::new(BinaryHeap::new()),
            seq: std::sync::atomic::AtomicU64::new(0),
            clock: Clock::new(),
        }
    }

    fn roll_percent(pct: f32) -> bool {
        if pct <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f32>() * 100.0 < pct
    }

    /// Live-adjusts the `FakePacketLoss_Send` knob, mirroring the
    /// real-time-tunable console variable it is named after.
    pub fn set_fake_packet_loss_send(&self, pct: f32) {
        self.cfg.lock().unwrap().fake_packet_loss_send = pct;
    }
}

#[async_trait]
impl<T: DatagramTransport> DatagramTransport for FaultInjectingTransport<T> {
    async fn send_to(&self, dst: IpEndpoint, payload: &[u8]) -> Result<()> {
        let (loss_send, lag_send_ms, reorder_send, reorder_time_ms) = {
            let cfg = self.cfg.lock().unwrap();
            (cfg.fake_packet_loss_send, cfg.fake_packet_lag_send_ms, cfg.fake_packet_reorder_send, cfg.fake_packet_reorder_time_ms)
        };

        if Self::roll_percent(loss_send) {
            return Ok(());
        }

        let mut delay_ms = lag_send_ms as u64;
        if Self::roll_percent(reorder_send) && reorder_time_ms > 0 {
            delay_ms += rand::thread_rng().gen_range(0..=reorder_time_ms as u64);
        }

        if delay_ms == 0 {
            return self.inner.send_to(dst, payload).await;
        }

        // Held packets are released by a caller invoking `pump_held`; this
        // transport does not spawn its own timer task.
        let seq = self.seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let release_at = self.clock.now().saturating_add(std::time::Duration::from_millis(delay_ms));
        self.held.lock().await.push(HeldPacket { release_at, seq, dst, payload: payload.to_vec() });
        Ok(())
    }

    async fn recv_from(&self) -> Result<(IpEndpoint, Vec<u8>)> {
        self.inner.recv_from().await
    }

    fn local_addr(&self) -> Result<IpEndpoint> {
        self.inner.local_addr()
    }
}

impl<T: DatagramTransport> FaultInjectingTransport<T> {
    /// Releases every held packet whose delay has elapsed as of `now`,
    /// sending it on the inner transport. Tests drive this explicitly
    /// rather than relying on a background timer.
    pub async fn pump_held(&self, now: UsecTime) -> Result<usize> {
        let mut released = 0;
        loop {
            let next = {
                let mut heap = self.held.lock().await;
                match heap.peek() {
                    Some(p) if p.release_at <= now => heap.pop(),
                    _ => None,
                }
            };
            match next {
                Some(p) => {
                    self.inner.send_to(p.dst, &p.payload).await?;
                    released += 1;
                }
                None => break,
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    #[async_trait]
    impl DatagramTransport for NullTransport {
        async fn send_to(&self, _dst: IpEndpoint, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn recv_from(&self) -> Result<(IpEndpoint, Vec<u8>)> {
            Err(NetError::Internal("no data".to_string()))
        }
        fn local_addr(&self) -> Result<IpEndpoint> {
            Ok(IpEndpoint { ip: IpAddr::v4(0, 0, 0, 0), port: 0 })
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        sent: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl DatagramTransport for CountingTransport {
        async fn send_to(&self, _dst: IpEndpoint, _payload: &[u8]) -> Result<()> {
            self.sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
        async fn recv_from(&self) -> Result<(IpEndpoint, Vec<u8>)> {
            Err(NetError::Internal("no data".to_string()))
        }
        fn local_addr(&self) -> Result<IpEndpoint> {
            Ok(IpEndpoint { ip: IpAddr::v4(0, 0, 0, 0), port: 0 })
        }
    }

    #[tokio::test]
    async fn transport_001_loss_drops_everything_at_100_percent() {
        let cfg = NetworkingConfig { fake_packet_loss_send: 100.0, ..Default::default() };
        let t = FaultInjectingTransport::new(NullTransport, cfg);
        let dst = IpEndpoint { ip: IpAddr::v4(1, 2, 3, 4), port: 1 };
        t.send_to(dst, b"hello").await.unwrap();
        assert_eq!(t.pump_held(UsecTime(1_000_000)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_002_lag_holds_then_releases() {
        let cfg = NetworkingConfig { fake_packet_lag_send_ms: 50, ..Default::default() };
        let t = FaultInjectingTransport::new(NullTransport, cfg);
        let dst = IpEndpoint { ip: IpAddr::v4(1, 2, 3, 4), port: 1 };
        t.send_to(dst, b"hello").await.unwrap();
        assert_eq!(t.pump_held(UsecTime(10_000)).await.unwrap(), 0);
        assert_eq!(t.pump_held(UsecTime(60_000)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transport_003_no_impairment_sends_immediately() {
        let t = FaultInjectingTransport::new(NullTransport, NetworkingConfig::default());
        let dst = IpEndpoint { ip: IpAddr::v4(1, 2, 3, 4), port: 1 };
        t.send_to(dst, b"hello").await.unwrap();
        assert_eq!(t.pump_held(UsecTime(0)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_004_set_fake_packet_loss_send_takes_effect_live() {
        let inner = Arc::new(CountingTransport::default());
        let t = FaultInjectingTransport::with_inner(inner.clone(), NetworkingConfig::default());
        let dst = IpEndpoint { ip: IpAddr::v4(1, 2, 3, 4), port: 1 };

        t.send_to(dst, b"hello").await.unwrap();
        assert_eq!(inner.sent.load(std::sync::atomic::Ordering::Relaxed), 1);

        t.set_fake_packet_loss_send(100.0);
        t.send_to(dst, b"hello").await.unwrap();
        assert_eq!(inner.sent.load(std::sync::atomic::Ordering::Relaxed), 1, "loss knob set after construction should still apply");
    }
}
