//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p tilenet_client -- [--config client.json] [--addr 127.0.0.1:40000]
//!       [--name Player] [--world lobby] [--tick-hz 60]
//!
//! The client logs in, joins a world, sends input every tick and keeps a
//! replica of the world and the players in it.
//!
//! Console commands:
//!   status                      - Show client status
//!   tile <x> <y> <layer> <id>   - Request a tile change
//!   cell                        - Show the cell under the local player
//!   left | right | stop | jump  - Change held input
//!   disconnect                  - Disconnect from server
//!   quit                        - Exit client

use std::{
    env,
    io::{BufRead, Write},
    path::Path,
    time::{Duration, Instant},
};

use anyhow::Context;
use tilenet_client::{
    client::{ClientEvent, ClientState, GameClient},
    input::InputState,
};
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
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--world" if i + 1 < args.len() => {
                cfg.world.name = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

/// Applies movement console commands; returns false if `line` is not one.
fn update_input(input: &mut InputState, line: &str) -> bool {
    match line {
        "left" => {
            input.left = true;
            input.right = false;
        }
        "right" => {
            input.right = true;
            input.left = false;
        }
        "stop" => *input = InputState::default(),
        "jump" => input.jump = true,
        _ => return false,
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, world = %cfg.world.name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    info!(player_id = client.player_id, motd = %client.server_info.motd, "Connected to server");

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32);
    let mut input = InputState::default();
    let mut next_tick = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if matches!(line.as_str(), "quit" | "exit") {
                client.disconnect("quit").await.ok();
                return Ok(());
            }
            if update_input(&mut input, &line) {
                continue;
            }
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e:#}"),
            }
        }

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        client.send_input(input).await?;
        input.jump = false;

        // Drain whatever arrived during the last tick.
        next_tick += tick_interval;
        loop {
            let budget = next_tick.saturating_duration_since(tokio::time::Instant::now());
            if budget.is_zero() {
                break;
            }
            match client.poll(budget).await? {
                Some(ClientEvent::Tile(u)) => {
                    info!(x = u.x, y = u.y, layer = u.layer, tile = u.tile.0, "Tile changed")
                }
                Some(ClientEvent::Disconnected(reason)) => {
                    info!(%reason, "Server closed the connection");
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        client.smooth(Instant::now());
    }

    Ok(())
}
