//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p tilenet_server -- [--config server.json] [--addr 127.0.0.1:40000]
//!       [--tick-hz 60] [--name tilenet] [--world lobby]
//!
//! The server hosts one world, accepts clients, runs the player simulation at
//! a fixed timestep and broadcasts every accepted tile mutation.
//!
//! Console commands:
//!   status                             - Show server status
//!   worlds                             - List hosted worlds
//!   tile <world> <x> <y> <layer> <id>  - Set a tile
//!   flash <world> <x> <y> <layer> <id> <ms> - Set a tile temporarily
//!   quit                               - Shutdown server

use std::{
    env,
    io::{BufRead, Write},
    path::Path,
};

use anyhow::Context;
use tilenet_server::server::GameServer;
use tilenet_shared::config::EngineConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => EngineConfig::from_file(Path::new(&args[i + 1]))?,
        _ => EngineConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.server_name = args[i + 1].clone();
                i += 2;
            }
            "--world" if i + 1 < args.len() => {
                cfg.world.name = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, world = %cfg.world.name, "Starting server");

    let server = GameServer::bind(cfg).await.context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    let shared = server.shared().clone();
    let handle = server.spawn()?;

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    while let Some(line) = console_rx.recv().await {
        if matches!(line.as_str(), "quit" | "exit") {
            break;
        }
        for out in shared.exec_console(&line) {
            println!("{out}");
        }
    }

    info!("Server shutting down");
    handle.shutdown();
    Ok(())
}
