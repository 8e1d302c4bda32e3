//! Standalone client binary.
//!
//! Usage:
//!   snp-client --addr 127.0.0.1:27015 [--bind 0.0.0.0:0] [--name bot-1]
//!
//! Connects to an SNP listener and drops into a small console: `reliable
//! <text>`/`unreliable <text>` send a message, `status` prints connection
//! info, `quit` closes the connection and exits.

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use snp_core::config::NetworkingConfig;
use snp_core::connection::ConnectionState;
use snp_core::identity::Identity;
use snp_core::ipaddr::{parse_ip_endpoint, IpEndpoint};
use snp_client::Client;
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    addr: String,
    bind: String,
    name: String,
}

fn parse_args() -> Args {
    let mut args = Args { addr: "127.0.0.1:27015".to_string(), bind: "0.0.0.0:0".to_string(), name: "player".to_string() };
    let raw: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--addr" if i + 1 < raw.len() => {
                args.addr = raw[i + 1].clone();
                i += 2;
            }
            "--bind" if i + 1 < raw.len() => {
                args.bind = raw[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < raw.len() => {
                args.name = raw[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    args
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = parse_args();
    let server: IpEndpoint = parse_ip_endpoint(&args.addr).map_err(|_| anyhow::anyhow!("invalid --addr {:?}", args.addr))?;
    let bind: IpEndpoint = parse_ip_endpoint(&args.bind).map_err(|_| anyhow::anyhow!("invalid --bind {:?}", args.bind))?;
    let identity = Identity::GenericString(args.name.clone());

    info!(server = %server, name = %args.name, "connecting");
    let client = Client::connect(bind, server, identity, NetworkingConfig::default()).await.context("connect")?;
    println!("Connected to {server}. Type 'status' for info, 'quit' to exit.");
    println!();

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    loop {
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("error: {e}"),
            }
        }

        for msg in client.poll().await? {
            info!(bytes = msg.data.len(), reliable = msg.reliable, msg_num = msg.message_number, "received message");
        }

        if client.state().await? == ConnectionState::Dead {
            println!("connection closed.");
            break;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Ok(())
}
