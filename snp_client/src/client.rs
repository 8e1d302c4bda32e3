//! Client connection wrapper: dials a server, drives the handshake to
//! completion, and exposes send/recv/status/close plus a small console
//! command set for the interactive binary.

use std::time::Duration;

use anyhow::{bail, Context};
use snp_core::api::NetworkingService;
use snp_core::config::NetworkingConfig;
use snp_core::connection::{ConnectionHandle, ConnectionState};
use snp_core::crypto::SigningIdentity;
use snp_core::error::CloseReason;
use snp_core::identity::Identity;
use snp_core::ipaddr::IpEndpoint;
use snp_core::snp::message::{Message, SendFlags};
use snp_core::transport::UdpTransport;
use tracing::info;

/// How long `Client::connect` waits for the handshake before giving up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    service: NetworkingService<UdpTransport>,
    conn: ConnectionHandle,
    server_addr: IpEndpoint,
}

impl Client {
    /// Binds `local`, dials `server`, and blocks until the handshake
    /// completes (or `HANDSHAKE_TIMEOUT` elapses).
    pub async fn connect(local: IpEndpoint, server: IpEndpoint, identity: Identity, config: NetworkingConfig) -> anyhow::Result<Self> {
        let transport = UdpTransport::bind(local).await.context("bind client socket")?;
        let service = NetworkingService::new(transport, config, identity, SigningIdentity::generate());
        let conn = service.connect_ip(server).await.context("send ClientHello")?;

        let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            service.run_callbacks().await?;
            if service.get_connection_info(conn).await?.state == ConnectionState::Connected {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("handshake with {server} timed out");
            }
        }

        info!(%server, "connected");
        Ok(Self { service, conn, server_addr: server })
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.conn
    }

    pub async fn send(&self, data: Vec<u8>, reliable: bool) -> anyhow::Result<()> {
        let flags = if reliable { SendFlags::RELIABLE } else { SendFlags::empty() };
        self.service.send_message(self.conn, data, flags).await?;
        Ok(())
    }

    /// Drives the connection's callback pump and returns whatever messages
    /// arrived since the last call.
    pub async fn poll(&self) -> anyhow::Result<Vec<Message>> {
        self.service.run_callbacks().await?;
        Ok(self.service.recv_on_conn(self.conn, 256).await?)
    }

    pub async fn state(&self) -> anyhow::Result<ConnectionState> {
        Ok(self.service.get_connection_info(self.conn).await?.state)
    }

    pub async fn detailed_status(&self) -> anyhow::Result<String> {
        Ok(self.service.get_detailed_status(self.conn).await?)
    }

    pub async fn close(&self, debug: impl Into<String>) -> anyhow::Result<()> {
        self.service.close_connection(self.conn, CloseReason::AppDefined(0), debug.into(), false).await?;
        Ok(())
    }

    /// Executes a console command line, returning output lines to print.
    pub async fn exec_console(&self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "status" => {
                let info = self.service.get_connection_info(self.conn).await?;
                let quick = self.service.get_quick_status(self.conn).await?;
                Ok(vec![
                    format!("server: {}", self.server_addr),
                    format!("state: {:?}", info.state),
                    format!("peer identity: {}", info.peer_identity),
                    format!("ping: {:?}ms", quick.ping_ms),
                    format!("quality: {:?}", quick.quality),
                    format!("send rate: {} B/s", quick.send_rate_bytes_per_sec),
                    format!("pending bytes: {}", quick.pending_bytes),
                ])
            }
            "reliable" | "unreliable" => {
                let msg = tokens[1..].join(" ");
                if msg.is_empty() {
                    return Ok(vec![format!("usage: {cmd} <message>")]);
                }
                self.send(msg.clone().into_bytes(), cmd == "reliable").await?;
                Ok(vec![format!("sent ({cmd}): {msg}")])
            }
            "quit" | "exit" => {
                self.close("user quit".to_string()).await?;
                std::process::exit(0);
            }
            other => Ok(vec![format!("unknown command: {other}")]),
        }
    }
}
