//! Server implementation: accepts inbound connections on one listen
//! socket, funnels all of their traffic through a single poll group, and
//! echoes/broadcasts messages back out. Console commands (`status`,
//! `say`, `quit`) mirror the client's.

use std::collections::HashMap;

use anyhow::Context;
use snp_core::api::NetworkingService;
use snp_core::config::NetworkingConfig;
use snp_core::connection::{ConnectionHandle, ConnectionState};
use snp_core::crypto::SigningIdentity;
use snp_core::error::CloseReason;
use snp_core::identity::Identity;
use snp_core::ipaddr::IpEndpoint;
use snp_core::listener::ListenSocketHandle;
use snp_core::pollgroup::PollGroupHandle;
use snp_core::snp::message::SendFlags;
use snp_core::transport::{DatagramTransport, UdpTransport};
use tracing::info;

/// A connected client, tracked only for `status` output.
struct ClientSlot {
    peer_addr: IpEndpoint,
    peer_identity: Identity,
}

pub struct Server {
    service: NetworkingService<UdpTransport>,
    listener: ListenSocketHandle,
    group: PollGroupHandle,
    local_addr: IpEndpoint,
    clients: HashMap<ConnectionHandle, ClientSlot>,
}

impl Server {
    pub async fn bind(local: IpEndpoint, config: NetworkingConfig) -> anyhow::Result<Self> {
        let transport = UdpTransport::bind(local).await.context("bind server socket")?;
        let local_addr = transport.local_addr()?;
        let service = NetworkingService::new(transport, config, Identity::Invalid, SigningIdentity::generate());
        let listener = service.create_listen_ip(local_addr).await;
        let group = service.create_poll_group().await;
        Ok(Self { service, listener, group, local_addr, clients: HashMap::new() })
    }

    pub fn local_addr(&self) -> IpEndpoint {
        self.local_addr
    }

    /// Runs housekeeping, accepts any newly-handshaken connections, and
    /// echoes everything received on the shared poll group back to its
    /// sender. Call this once per tick.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.service.run_callbacks().await?;

        while let Some(conn) = self.service.get_pending_accept(self.listener).await? {
            self.service.accept(conn).await?;
            self.service.set_conn_poll_group(conn, Some(self.group)).await?;
            let info = self.service.get_connection_info(conn).await?;
            info!(handle = conn.0, peer = %info.peer_addr, identity = %info.peer_identity, "client accepted");
            self.clients.insert(conn, ClientSlot { peer_addr: info.peer_addr, peer_identity: info.peer_identity });
        }

        for (from, msg) in self.service.recv_on_poll_group(self.group, 256).await? {
            let flags = if msg.reliable { SendFlags::RELIABLE } else { SendFlags::empty() };
            if let Err(e) = self.service.send_message(from, msg.data, flags).await {
                info!(handle = from.0, error = %e, "echo send failed");
            }
        }

        let mut dead = Vec::new();
        for &conn in self.clients.keys() {
            match self.service.get_connection_info(conn).await {
                Ok(info) if matches!(info.state, ConnectionState::Dead | ConnectionState::ClosedByPeer | ConnectionState::ProblemDetectedLocally) => {
                    dead.push(conn);
                }
                Ok(_) => {}
                Err(_) => dead.push(conn),
            }
        }
        for conn in dead {
            self.clients.remove(&conn);
            info!(handle = conn.0, "client disconnected");
        }

        Ok(())
    }

    pub fn exec_console(&self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };
        match cmd {
            "status" => {
                let mut out = vec![format!("clients: {}", self.clients.len())];
                for (conn, slot) in &self.clients {
                    out.push(format!("  {:?}: peer={} identity={}", conn, slot.peer_addr, slot.peer_identity));
                }
                out
            }
            other => vec![format!("unknown command: {other}")],
        }
    }

    /// Broadcasts `data` reliably to every connected client.
    pub async fn broadcast(&self, data: &[u8]) -> anyhow::Result<()> {
        for &conn in self.clients.keys() {
            self.service.send_message(conn, data.to_vec(), SendFlags::RELIABLE).await?;
        }
        Ok(())
    }

    pub async fn close_all(&self, reason: &str) -> anyhow::Result<()> {
        for &conn in self.clients.keys() {
            let _ = self.service.close_connection(conn, CloseReason::AppDefined(0), reason.to_string(), false).await;
        }
        Ok(())
    }
}
