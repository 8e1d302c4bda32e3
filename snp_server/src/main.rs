//! Standalone server binary.
//!
//! Usage:
//!   snp-server --addr 127.0.0.1:27015 [--tick-ms 15]
//!
//! Listens for SNP connections, echoes every message it receives back to
//! its sender, and exposes a small console: `status`, `say <text>`
//! (broadcast), `quit`.

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use snp_core::config::NetworkingConfig;
use snp_core::ipaddr::{parse_ip_endpoint, IpEndpoint};
use snp_server::Server;
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    addr: String,
    tick_ms: u64,
}

fn parse_args() -> Args {
    let mut args = Args { addr: "127.0.0.1:27015".to_string(), tick_ms: 15 };
    let raw: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--addr" if i + 1 < raw.len() => {
                args.addr = raw[i + 1].clone();
                i += 2;
            }
            "--tick-ms" if i + 1 < raw.len() => {
                args.tick_ms = raw[i + 1].parse().unwrap_or(15);
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
    let addr: IpEndpoint = parse_ip_endpoint(&args.addr).map_err(|_| anyhow::anyhow!("invalid --addr {:?}", args.addr))?;

    let mut server = Server::bind(addr, NetworkingConfig::default()).await.context("bind server")?;
    info!(local = %server.local_addr(), "server listening");

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

    println!("Server ready. Type 'status' for info, 'say <text>' to broadcast, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_millis(args.tick_ms);
    loop {
        while let Ok(line) = console_rx.try_recv() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.first() {
                Some(&"say") => {
                    let msg = tokens[1..].join(" ");
                    if let Err(e) = server.broadcast(msg.as_bytes()).await {
                        println!("broadcast error: {e}");
                    }
                }
                Some(&"quit") | Some(&"exit") => {
                    server.close_all("server shutting down").await.ok();
                    info!("server shutting down");
                    return Ok(());
                }
                _ => {
                    for out_line in server.exec_console(&line) {
                        println!("{out_line}");
                    }
                }
            }
        }

        server.step().await?;
        tokio::time::sleep(tick_interval).await;
    }
}
