//! Full socket-based integration tests for client <-> server communication.

use std::{sync::Arc, time::Duration};

use tilenet_client::client::{ClientEvent, ClientState};
use tilenet_server::server::{ExtensionHandler, ServerShared};
use tilenet_shared::{
    builtin::{PlayerInput, PlayerLeft, PlayerState},
    config::EngineConfig,
    level::{TileWorld, WorldHooks},
    message_type::{ExtensionId, ExtensionMessage, MessageType, EXTENSION_ID_BASE},
    messages::{encode_frame, NetMsg, TileUpdate, WorldInit},
    net::PeerId,
    tile::{Layer, Tile},
    wire::{Context, DecodeError, WireReader, WireWriter},
};
use tilenet_tests::{
    connect_as, holding_right, init_tracing, next_tile, start_server, test_config,
    wait_disconnected, wait_for, WAIT,
};
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_delivers_world_and_registry() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;

    let client = connect_as(&cfg, "ada").await?;
    assert_eq!(client.state, ClientState::Joined);
    assert_eq!(client.server_info.name, "test-server");
    assert_eq!(client.server_info.motd, "hello");
    assert_eq!(client.server_info.players, 1);
    assert_eq!(client.registry().names(), handle.shared.registry().names());

    let host = handle.shared.worlds.get("lobby").expect("default world");
    assert_eq!(client.world.id(), host.id());
    assert_eq!(client.world.to_stream(), host.with_world(|w| w.to_stream()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn login_is_rejected_for_unknown_world() -> anyhow::Result<()> {
    init_tracing();
    let (_handle, mut cfg) = start_server(test_config()).await?;
    cfg.world.name = "nowhere".into();

    let err = connect_as(&cfg, "ada").await.err().expect("login must fail");
    assert!(format!("{err:#}").contains("unknown world"), "{err:#}");

    cfg.world.name = "lobby".into();
    let err = connect_as(&cfg, "  ").await.err().expect("login must fail");
    assert!(format!("{err:#}").contains("empty username"), "{err:#}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tile_request_reaches_every_peer() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut a = connect_as(&cfg, "a").await?;
    let mut b = connect_as(&cfg, "b").await?;

    a.request_tile(4, 5, Layer::Background, Tile(9)).await?;
    let expected = TileUpdate {
        x: 4,
        y: 5,
        layer: 1,
        tile: Tile(9),
    };
    assert_eq!(next_tile(&mut a).await?, expected);
    assert_eq!(next_tile(&mut b).await?, expected);

    assert_eq!(a.world.get(4, 5, Layer::Background)?, Tile(9));
    assert_eq!(b.world.get(4, 5, Layer::Background)?, Tile(9));
    let host = handle.shared.worlds.get("lobby").expect("default world");
    assert_eq!(host.get(4, 5, Layer::Background)?, Tile(9));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_bounds_request_is_ignored() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut client = connect_as(&cfg, "a").await?;
    let host = handle.shared.worlds.get("lobby").expect("default world");
    let before = host.with_world(|w| w.to_stream());

    client.request_tile(500, 0, Layer::Foreground, Tile(3)).await?;
    let bad_layer = NetMsg::TileUpdate(TileUpdate {
        x: 0,
        y: 0,
        layer: 7,
        tile: Tile(3),
    });
    client
        .send_frame(&encode_frame(&bad_layer, Context::Server))
        .await?;
    client.request_tile(1, 1, Layer::Foreground, Tile(3)).await?;

    // The only broadcast is the valid request; the connection stays up.
    let got = next_tile(&mut client).await?;
    assert_eq!((got.x, got.y), (1, 1));
    assert_eq!(client.state, ClientState::Joined);

    let after = host.with_world(|w| w.to_stream());
    let mut expected = TileWorld::from_stream(
        host.meta().clone(),
        &before,
        WorldHooks::local(Default::default()),
    )?;
    expected.mutate(1, 1, Layer::Foreground, Tile(3))?;
    assert_eq!(after, expected.to_stream());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_arrive_in_one_order() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut a = connect_as(&cfg, "a").await?;
    let mut b = connect_as(&cfg, "b").await?;
    const N: i32 = 20;

    let host = handle.shared.worlds.get("lobby").expect("default world");
    let server_side = {
        let host = host.clone();
        tokio::task::spawn_blocking(move || {
            for x in 0..N {
                host.mutate(x, 2, Layer::Background, Tile(300)).ok();
            }
        })
    };
    for x in 0..N {
        a.request_tile(x, 0, Layer::Foreground, Tile(100)).await?;
        b.request_tile(x, 1, Layer::Foreground, Tile(200)).await?;
    }
    server_side.await?;

    let mut seen_a = Vec::new();
    let mut seen_b = Vec::new();
    for _ in 0..3 * N {
        seen_a.push(next_tile(&mut a).await?);
        seen_b.push(next_tile(&mut b).await?);
    }
    assert_eq!(seen_a, seen_b);
    assert_eq!(a.world.to_stream(), host.with_world(|w| w.to_stream()));
    for x in 0..N {
        assert_eq!(host.get(x, 0, Layer::Foreground)?, Tile(100));
        assert_eq!(host.get(x, 1, Layer::Foreground)?, Tile(200));
        assert_eq!(host.get(x, 2, Layer::Background)?, Tile(300));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_closes_connection() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut bad = connect_as(&cfg, "bad").await?;
    let mut good = connect_as(&cfg, "good").await?;

    // Unregistered extension id.
    bad.send_frame(&[0xff, 0xff, 1, 2, 3]).await?;
    wait_disconnected(&mut bad).await?;

    // Server-only message sent by a client.
    let mut bad2 = connect_as(&cfg, "bad2").await?;
    let init = NetMsg::WorldInit(WorldInit {
        meta: handle.shared.worlds.get("lobby").expect("world").meta().clone(),
        tiles: Vec::new(),
    });
    bad2.send_frame(&encode_frame(&init, Context::Client)).await?;
    wait_disconnected(&mut bad2).await?;

    // Truncated core payload.
    let mut bad3 = connect_as(&cfg, "bad3").await?;
    let mut frame = encode_frame(
        &NetMsg::TileUpdate(TileUpdate {
            x: 1,
            y: 1,
            layer: 0,
            tile: Tile(1),
        }),
        Context::Server,
    )
    .to_vec();
    frame.truncate(frame.len() - 1);
    bad3.send_frame(&frame).await?;
    wait_disconnected(&mut bad3).await?;

    // Other peers are unaffected.
    good.request_tile(2, 2, Layer::Foreground, Tile(5)).await?;
    assert_eq!(next_tile(&mut good).await?.tile, Tile(5));
    Ok(())
}

/// Test-only extension message.
#[derive(Debug, Clone, PartialEq)]
struct Chat {
    text: String,
}

impl ExtensionMessage for Chat {
    const NAME: &'static str = "test.chat";

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_str(&self.text);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            text: r.read_str()?,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extension_ids_come_from_server_table() -> anyhow::Result<()> {
    init_tracing();
    let cfg = EngineConfig {
        extensions: vec!["test.emote".into(), Chat::NAME.into()],
        ..test_config()
    };
    let (handle, cfg) = start_server(cfg).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, String)>();
    let chat = handle
        .shared
        .registry()
        .resolve::<Chat>()
        .expect("configured");
    let handler: ExtensionHandler = Arc::new(move |_: &ServerShared, peer: PeerId, payload: &[u8]| -> Result<(), DecodeError> {
        let msg = chat.decode(payload, Context::Server)?;
        let _ = tx.send((peer, msg.text));
        Ok(())
    });
    handle.shared.on_extension(Chat::NAME, handler);

    let mut client = connect_as(&cfg, "ada").await?;
    let reg = client.registry();
    let names = [
        PlayerInput::NAME,
        PlayerState::NAME,
        PlayerLeft::NAME,
        "test.emote",
        Chat::NAME,
    ];
    for (index, name) in names.into_iter().enumerate() {
        let id = reg.get_id(name).expect("registered");
        assert_eq!(id, ExtensionId(index as u16));
        assert_eq!(
            MessageType::Extension(id).to_wire(),
            EXTENSION_ID_BASE + index as u16
        );
    }
    assert_eq!(reg.get_id("not.registered"), None);

    client
        .send_extension(Chat {
            text: "hi there".into(),
        })
        .await?;
    let (_, text) = tokio::time::timeout(WAIT, rx.recv())
        .await?
        .expect("handler called");
    assert_eq!(text, "hi there");

    // Messages the server never registered cannot be sent.
    #[derive(Debug)]
    struct Unknown;
    impl ExtensionMessage for Unknown {
        const NAME: &'static str = "test.unknown";
        fn encode(&self, _w: &mut WireWriter, _ctx: Context) {}
        fn decode(_r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
            Ok(Unknown)
        }
    }
    assert!(client.send_extension(Unknown).await.is_err());

    // Extension frames with no handler are ignored, not fatal.
    let emote_id = client.registry().get_id("test.emote").expect("registered");
    let mut frame = MessageType::Extension(emote_id).to_wire().to_be_bytes().to_vec();
    frame.extend_from_slice(b"wave");
    client.send_frame(&frame).await?;
    client.request_tile(0, 0, Layer::Background, Tile(1)).await?;
    assert_eq!(next_tile(&mut client).await?.tile, Tile(1));
    assert_eq!(client.state, ClientState::Joined);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn input_moves_the_player_for_everyone() -> anyhow::Result<()> {
    init_tracing();
    let (_handle, cfg) = start_server(test_config()).await?;
    let mut mover = connect_as(&cfg, "mover").await?;
    let mut watcher = connect_as(&cfg, "watcher").await?;
    let id = mover.player_id;

    wait_for(&mut watcher, WAIT, |ev| match ev {
        ClientEvent::Player(p) if *p == id => Some(()),
        _ => None,
    })
    .await?;
    let start_x = watcher.players[&id].body.simulation.position.x;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        mover.send_input(holding_right()).await?;
        watcher.poll(Duration::from_millis(20)).await?;
        if watcher.players[&id].body.simulation.position.x > start_x {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "player never moved");
    }

    watcher.smooth(std::time::Instant::now());
    let body = &watcher.players[&id].body;
    let (lo, hi) = (body.previous.position.x, body.simulation.position.x);
    assert!(body.display.position.x >= lo.min(hi) && body.display.position.x <= lo.max(hi));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_reversion_is_broadcast() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut client = connect_as(&cfg, "ada").await?;
    let host = handle.shared.worlds.get("lobby").expect("default world");

    let old = host.place_temporary(6, 6, Layer::Foreground, Tile(77), Duration::from_millis(100))?;

    let placed = next_tile(&mut client).await?;
    assert_eq!((placed.x, placed.y, placed.tile), (6, 6, Tile(77)));
    let restored = next_tile(&mut client).await?;
    assert_eq!((restored.x, restored.y, restored.tile), (6, 6, old));
    assert_eq!(client.world.get(6, 6, Layer::Foreground)?, old);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_removes_peer() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut client = connect_as(&cfg, "ada").await?;
    let host = handle.shared.worlds.get("lobby").expect("default world");
    assert_eq!(host.peer_count(), 1);

    client.disconnect("bye").await?;
    let deadline = tokio::time::Instant::now() + WAIT;
    while host.peer_count() != 0 || handle.shared.player_count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "peer never removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn departed_player_is_forgotten_by_peers() -> anyhow::Result<()> {
    init_tracing();
    let (handle, cfg) = start_server(test_config()).await?;
    let mut leaver = connect_as(&cfg, "leaver").await?;
    let mut watcher = connect_as(&cfg, "watcher").await?;
    let id = leaver.player_id;

    wait_for(&mut watcher, WAIT, |ev| match ev {
        ClientEvent::Player(p) if *p == id => Some(()),
        _ => None,
    })
    .await?;
    assert!(watcher.players.contains_key(&id));

    leaver.disconnect("bye").await?;
    wait_for(&mut watcher, WAIT, |ev| match ev {
        ClientEvent::PlayerLeft(p) if *p == id => Some(()),
        _ => None,
    })
    .await?;
    assert!(!watcher.players.contains_key(&id));
    assert_eq!(handle.shared.player_count(), 1);

    // Later ticks do not bring the departed player back.
    let until = tokio::time::Instant::now() + Duration::from_millis(200);
    while tokio::time::Instant::now() < until {
        watcher.poll(Duration::from_millis(20)).await?;
    }
    assert!(!watcher.players.contains_key(&id));
    assert!(watcher.players.contains_key(&watcher.player_id));
    Ok(())
}
