//! Helpers shared by the integration tests.

use std::time::Duration;

use anyhow::bail;
use tilenet_client::{
    client::{ClientEvent, ClientState, GameClient},
    input::InputState,
};
use tilenet_server::server::{bind_ephemeral_with, ServerHandle};
use tilenet_shared::{config::EngineConfig, messages::TileUpdate};
use tokio::time::Instant;

/// Default time budget for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Small world, fast reversion polling.
pub fn test_config() -> EngineConfig {
    let mut cfg = EngineConfig {
        tick_hz: 60,
        reversion_poll_ms: 10,
        server_name: "test-server".into(),
        motd: "hello".into(),
        ..Default::default()
    };
    cfg.world.width = 24;
    cfg.world.height = 16;
    cfg
}

/// Starts a server on an ephemeral port and returns its handle plus a client
/// config pointing at it.
pub async fn start_server(cfg: EngineConfig) -> anyhow::Result<(ServerHandle, EngineConfig)> {
    let (server, cfg) = bind_ephemeral_with(cfg).await?;
    let handle = server.spawn()?;
    Ok((handle, cfg))
}

pub async fn connect_as(cfg: &EngineConfig, name: &str) -> anyhow::Result<GameClient> {
    let mut cfg = cfg.clone();
    cfg.player_name = name.to_string();
    GameClient::connect(&cfg).await
}

/// Polls `client` until `f` accepts an event or `within` elapses.
pub async fn wait_for<T>(
    client: &mut GameClient,
    within: Duration,
    mut f: impl FnMut(&ClientEvent) -> Option<T>,
) -> anyhow::Result<T> {
    let deadline = Instant::now() + within;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            bail!("timed out waiting for event");
        }
        match client.poll(left).await? {
            Some(ev) => {
                if let Some(t) = f(&ev) {
                    return Ok(t);
                }
                if let ClientEvent::Disconnected(reason) = ev {
                    bail!("disconnected while waiting: {reason}");
                }
            }
            None => tokio::task::yield_now().await,
        }
    }
}

pub async fn next_tile(client: &mut GameClient) -> anyhow::Result<TileUpdate> {
    wait_for(client, WAIT, |ev| match ev {
        ClientEvent::Tile(u) => Some(*u),
        _ => None,
    })
    .await
}

/// Waits until the server closes the connection.
pub async fn wait_disconnected(client: &mut GameClient) -> anyhow::Result<String> {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if client.state == ClientState::Disconnected {
            return Ok("already disconnected".into());
        }
        if left.is_zero() {
            bail!("connection still open");
        }
        if let Some(ClientEvent::Disconnected(reason)) = client.poll(left).await? {
            return Ok(reason);
        }
    }
}

pub fn holding_right() -> InputState {
    InputState {
        right: true,
        ..Default::default()
    }
}
