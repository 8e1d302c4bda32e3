//! Full socket-based integration tests for client <-> server communication.

use std::time::Duration;

use snp_client::Client;
use snp_core::config::NetworkingConfig;
use snp_core::identity::Identity;
use snp_core::ipaddr::{IpAddr, IpEndpoint};
use snp_server::Server;

fn loopback(port: u16) -> IpEndpoint {
    IpEndpoint { ip: IpAddr::v4(127, 0, 0, 1), port }
}

/// Full integration: spawn a server, connect a client, exchange a
/// reliable and an unreliable message, and confirm the echoed replies
/// come back.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_echo_roundtrip() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();

    let mut server = Server::bind(loopback(0), NetworkingConfig::default()).await?;
    let server_addr = server.local_addr();

    let server_handle = tokio::spawn(async move {
        for _ in 0..200 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(())
    });

    let client = Client::connect(loopback(0), server_addr, Identity::GenericString("test-client".to_string()), NetworkingConfig::default()).await?;

    client.send(b"hello reliable".to_vec(), true).await?;
    client.send(b"hello unreliable".to_vec(), false).await?;

    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while received.len() < 2 && tokio::time::Instant::now() < deadline {
        for msg in client.poll().await? {
            received.push(msg.data);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(received.contains(&b"hello reliable".to_vec()), "expected reliable echo, got {received:?}");
    assert!(received.contains(&b"hello unreliable".to_vec()), "expected unreliable echo, got {received:?}");

    client.close("test done").await?;
    server_handle.await??;
    Ok(())
}

/// A single connection's status surface reports the expected state once
/// the handshake completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reports_connected_after_handshake() -> anyhow::Result<()> {
    let mut server = Server::bind(loopback(0), NetworkingConfig::default()).await?;
    let server_addr = server.local_addr();

    let server_handle = tokio::spawn(async move {
        for _ in 0..50 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(())
    });

    let client = Client::connect(loopback(0), server_addr, Identity::Invalid, NetworkingConfig::default()).await?;
    use snp_core::connection::ConnectionState;
    assert_eq!(client.state().await?, ConnectionState::Connected);

    client.close("done").await?;
    server_handle.await??;
    Ok(())
}
