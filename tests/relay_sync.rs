use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use playsync_server::config::{CatchUpPeer, RelayConfig};
use playsync_server::websocket::{Envelope, MessageKind, RelayServer};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

async fn start_relay(config: RelayConfig) -> (Arc<RelayServer>, String) {
    let server = Arc::new(RelayServer::new(config));
    let listener = server.bind().await.expect("Failed to bind relay");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.clone().serve(listener));
    (server, format!("ws://{}", addr))
}

async fn connect(base: &str, path: &str) -> Client {
    let url = Url::parse(&format!("{}/{}", base, path)).unwrap();
    let (ws, _) = connect_async(url).await.expect("Failed to connect");
    ws
}

async fn wait_for_count(server: &RelayServer, expected: usize) {
    for _ in 0..200 {
        if server.registry().count().await == expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never reached {} connections", expected);
}

async fn next_text(client: &mut Client) -> String {
    loop {
        let msg = timeout(FRAME_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = msg {
            return text;
        }
    }
}

async fn next_envelope(client: &mut Client) -> Envelope {
    serde_json::from_str(&next_text(client).await).expect("frame is not an envelope")
}

/// Returns the next text frame, if one shows up within the quiet period.
async fn try_next_text(client: &mut Client) -> Option<String> {
    match timeout(QUIET_PERIOD, client.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text),
        _ => None,
    }
}

fn user_name(envelope: &Envelope) -> Option<String> {
    let data: serde_json::Value =
        serde_json::from_str(envelope.payload.as_deref().expect("notice has data")).unwrap();
    data["UserName"].as_str().map(str::to_owned)
}

#[test_log::test(tokio::test)]
async fn test_three_clients_join_in_order() {
    let (server, base) = start_relay(RelayConfig::default()).await;

    let mut a = connect(&base, "a").await;
    wait_for_count(&server, 1).await;

    let mut b = connect(&base, "b").await;
    wait_for_count(&server, 2).await;

    let join = next_envelope(&mut a).await;
    assert_eq!(join.kind, MessageKind::Join);
    assert_eq!(user_name(&join).as_deref(), Some("b"));
    assert_eq!(next_envelope(&mut a).await, Envelope::request_current_status());

    let mut c = connect(&base, "c").await;
    wait_for_count(&server, 3).await;

    let join_at_a = next_envelope(&mut a).await;
    let join_at_b = next_envelope(&mut b).await;
    assert_eq!(join_at_a.kind, MessageKind::Join);
    assert_eq!(join_at_b.kind, MessageKind::Join);
    assert_eq!(user_name(&join_at_b).as_deref(), Some("c"));

    // Exactly one existing peer is asked to catch C up
    let request = serde_json::to_string(&Envelope::request_current_status()).unwrap();
    let extra_a = try_next_text(&mut a).await;
    let extra_b = try_next_text(&mut b).await;
    let asked = [extra_a, extra_b]
        .into_iter()
        .flatten()
        .filter(|text| *text == request)
        .count();
    assert_eq!(asked, 1);

    // Nobody hears about their own arrival
    assert!(try_next_text(&mut c).await.is_none());
}

#[test_log::test(tokio::test)]
async fn test_status_update_reaches_everyone_but_sender() {
    let (server, base) = start_relay(RelayConfig::default()).await;
    let mut a = connect(&base, "a").await;
    wait_for_count(&server, 1).await;
    let mut b = connect(&base, "b").await;
    wait_for_count(&server, 2).await;
    let mut c = connect(&base, "c").await;
    wait_for_count(&server, 3).await;

    // Drain join and catch-up traffic
    while try_next_text(&mut a).await.is_some() {}
    while try_next_text(&mut b).await.is_some() {}

    let payload = r#"{"IsPlaying":true,"VideoTime":"00:01:02","PlaybackRate":1.5}"#;
    a.send(Message::Text(payload.to_string())).await.unwrap();

    let expected = serde_json::to_string(&Envelope::status_update(payload)).unwrap();
    assert_eq!(next_text(&mut b).await, expected);
    assert_eq!(next_text(&mut c).await, expected);
    assert!(try_next_text(&mut a).await.is_none());

    assert_eq!(server.registry().last_status().await.as_deref(), Some(payload));
}

#[test_log::test(tokio::test)]
async fn test_abrupt_disconnect_notifies_remaining_peers() {
    let (server, base) = start_relay(RelayConfig::default()).await;
    let mut a = connect(&base, "a").await;
    wait_for_count(&server, 1).await;
    let b = connect(&base, "b").await;
    wait_for_count(&server, 2).await;
    let mut c = connect(&base, "c").await;
    wait_for_count(&server, 3).await;

    a.send(Message::Text("paused".into())).await.unwrap();
    while try_next_text(&mut a).await.is_some() {}
    while try_next_text(&mut c).await.is_some() {}

    // No closing handshake, just drop the socket
    drop(b);
    wait_for_count(&server, 2).await;

    for client in [&mut a, &mut c] {
        let leave = next_envelope(client).await;
        assert_eq!(leave.kind, MessageKind::Leave);
        assert!(try_next_text(client).await.is_none());
    }

    let snapshot = server.registry().snapshot().await;
    assert_eq!(snapshot.total_connected_clients, 2);
    assert_eq!(snapshot.last_status_received.as_deref(), Some("paused"));
}

#[test_log::test(tokio::test)]
async fn test_graceful_close_is_acknowledged() {
    let (server, base) = start_relay(RelayConfig::default()).await;
    let mut a = connect(&base, "a").await;
    wait_for_count(&server, 1).await;
    let mut b = connect(&base, "sync").await;
    wait_for_count(&server, 2).await;
    while try_next_text(&mut a).await.is_some() {}

    b.close(None).await.unwrap();
    // The relay answers the close and the stream ends
    while let Ok(Some(Ok(_))) = timeout(FRAME_TIMEOUT, b.next()).await {}

    wait_for_count(&server, 1).await;
    let leave = next_envelope(&mut a).await;
    assert_eq!(leave.kind, MessageKind::Leave);
    assert_eq!(user_name(&leave), None);
}

#[test_log::test(tokio::test)]
async fn test_last_status_policy_when_empty() {
    for clear in [false, true] {
        let (server, base) = start_relay(RelayConfig {
            clear_status_when_empty: clear,
            ..RelayConfig::default()
        })
        .await;

        let mut a = connect(&base, "a").await;
        wait_for_count(&server, 1).await;
        a.send(Message::Text("seek:10".into())).await.unwrap();
        for _ in 0..100 {
            if server.registry().last_status().await.is_some() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        a.close(None).await.unwrap();
        wait_for_count(&server, 0).await;

        let last = server.registry().last_status().await;
        if clear {
            assert_eq!(last, None);
        } else {
            assert_eq!(last.as_deref(), Some("seek:10"));
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_random_catch_up_peer_still_asks_exactly_one() {
    let (server, base) = start_relay(RelayConfig {
        catch_up_peer: CatchUpPeer::Random,
        ..RelayConfig::default()
    })
    .await;

    let mut peers = Vec::new();
    for i in 0..3 {
        peers.push(connect(&base, &format!("p{}", i)).await);
        wait_for_count(&server, i + 1).await;
    }
    for peer in peers.iter_mut() {
        while try_next_text(peer).await.is_some() {}
    }

    let _newcomer = connect(&base, "late").await;
    wait_for_count(&server, 4).await;

    let request = serde_json::to_string(&Envelope::request_current_status()).unwrap();
    let mut asked = 0;
    for peer in peers.iter_mut() {
        while let Some(text) = try_next_text(peer).await {
            if text == request {
                asked += 1;
            }
        }
    }
    assert_eq!(asked, 1);
}

#[test_log::test(tokio::test)]
async fn test_unknown_path_is_rejected() {
    let (server, base) = start_relay(RelayConfig::default()).await;

    for path in ["", "sync/alice", "a/b"] {
        let url = Url::parse(&format!("{}/{}", base, path)).unwrap();
        match connect_async(url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
            Err(other) => panic!("unexpected error for /{}: {}", path, other),
            Ok(_) => panic!("upgrade on /{} succeeded", path),
        }
    }
    assert_eq!(server.registry().count().await, 0);
}

#[test_log::test(tokio::test)]
async fn test_user_name_comes_from_the_only_segment() {
    let (server, base) = start_relay(RelayConfig::default()).await;
    let mut a = connect(&base, "sync").await;
    wait_for_count(&server, 1).await;

    let _b = connect(&base, "%E5%B0%8F%E6%98%8E").await;
    wait_for_count(&server, 2).await;

    let join = next_envelope(&mut a).await;
    assert_eq!(join.kind, MessageKind::Join);
    assert_eq!(user_name(&join).as_deref(), Some("小明"));
}

#[test_log::test(tokio::test)]
async fn test_shutdown_closes_every_session() {
    let (server, base) = start_relay(RelayConfig::default()).await;
    let mut a = connect(&base, "a").await;
    wait_for_count(&server, 1).await;

    server.shutdown();

    let frame = timeout(FRAME_TIMEOUT, a.next()).await.unwrap();
    match frame {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected a close frame, got {:?}", other),
    }
    wait_for_count(&server, 0).await;
}
