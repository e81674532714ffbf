#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end scenarios over real loopback sockets: RPC round trips,
//! authentication rejection, flow control, heartbeat failure detection,
//! and graceful close.

use conduit::config::{ClientConfig, ServerConfig};
use conduit::connection::ConnectionState;
use conduit::core::frame::{Frame, FrameType};
use conduit::core::payload::{self, PeerInfo};
use conduit::core::FrameCodec;
use conduit::error::ConduitError;
use conduit::protocol::auth;
use conduit::protocol::router::{MethodSchema, ParamKind, ParamSpec};
use conduit::transport;
use conduit::{Client, Server};
use rmpv::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PASSWORD: &str = "kaede123";

fn server_config() -> ServerConfig {
    ServerConfig {
        password: PASSWORD.into(),
        host: "127.0.0.1".into(),
        port: 0,
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(700),
        auth_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

fn client_config(port: u16) -> ClientConfig {
    ClientConfig {
        password: PASSWORD.into(),
        server_host: "127.0.0.1".into(),
        server_port: port,
        connect_timeout: Duration::from_secs(3),
        auth_timeout: Duration::from_secs(2),
        rpc_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(700),
        reconnect_enabled: false,
        ..Default::default()
    }
}

async fn wait_until<F>(mut condition: F, deadline: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn int_param(params: &Value, name: &str) -> i64 {
    payload::map_get(params, name)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

/// Happy path RPC: add(a, b) returns a + b inside the deadline.
#[tokio::test]
async fn happy_path_rpc() {
    let server = Server::new(server_config());
    server
        .rpc(
            "add",
            "Add two integers",
            MethodSchema::new(vec![
                ParamSpec::required("a", ParamKind::Integer),
                ParamSpec::required("b", ParamKind::Integer),
            ]),
            |_conn, params| async move {
                Ok(Value::from(int_param(&params, "a") + int_param(&params, "b")))
            },
        )
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(client_config(port));
    client.connect().await.unwrap();

    let envelope = client
        .call_envelope(
            "add",
            payload::value_map([("a", Value::from(10)), ("b", Value::from(20))]),
            None,
        )
        .await
        .unwrap();
    assert!(envelope.success);
    assert_eq!(envelope.data, Some(Value::from(30)));
    assert!(!envelope.correlation_id.is_empty());

    client.disconnect().await.unwrap();
    server.stop().await;
}

/// Wrong password: AUTH_FAILURE with retry_allowed=false, terminal.
#[tokio::test]
async fn wrong_password_is_terminal() {
    let server = Server::new(server_config());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut config = client_config(port);
    config.password = "letmein".into();
    let client = Client::new(config);

    match client.connect().await {
        Err(ConduitError::AuthenticationFailed { retry_allowed, .. }) => {
            assert!(!retry_allowed);
        }
        other => panic!("expected authentication failure, got {other:?}"),
    }
    assert!(!client.is_connected());
    assert_eq!(server.connection_count(), 0);

    server.stop().await;
}

/// An unknown RPC method yields code 4000 and the connection stays
/// healthy for subsequent calls.
#[tokio::test]
async fn method_not_found_leaves_connection_healthy() {
    let server = Server::new(server_config());
    server
        .rpc("echo", "Echo params", MethodSchema::default(), |_conn, params| async move {
            Ok(params)
        })
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(client_config(port));
    client.connect().await.unwrap();

    let envelope = client
        .call_envelope("nope", Value::Nil, None)
        .await
        .unwrap();
    assert!(!envelope.success);
    assert_eq!(envelope.code, Some(4000));

    // Connection must remain usable
    let conn = client.connection().unwrap();
    assert_eq!(conn.state(), ConnectionState::Active);
    let echoed = client
        .call("echo", payload::value_map([("k", Value::from(1))]), None)
        .await
        .unwrap();
    assert_eq!(
        payload::map_get(&echoed, "k").and_then(Value::as_i64),
        Some(1)
    );

    client.disconnect().await.unwrap();
    server.stop().await;
}

/// Heartbeat death: a peer that answers one ping then goes silent
/// is FAILED at the heartbeat deadline; in-flight calls see
/// ConnectionLost.
#[tokio::test]
async fn heartbeat_death_fails_connection() {
    let listener = transport::bind("127.0.0.1", 0, false, 0).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut writer, mut reader) =
            transport::split(stream, FrameCodec::new(), Duration::from_secs(5));
        let expected = auth::hash_password(PASSWORD);
        let info = PeerInfo {
            name: "simulator".into(),
            version: "0.0.0".into(),
        };
        auth::authenticate_server(&mut writer, &mut reader, &expected, info, Duration::from_secs(5))
            .await
            .unwrap();

        // Answer exactly one ping so the client reaches ACTIVE, then
        // neither read nor reply again
        loop {
            let frame = reader.next().await.unwrap();
            if frame.frame_type == FrameType::HeartbeatPing {
                writer
                    .send(Frame::new(
                        FrameType::HeartbeatPong,
                        frame.correlation,
                        frame.payload,
                    ))
                    .await
                    .unwrap();
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(writer);
    });

    let client = Client::new(client_config(port));
    client.connect().await.unwrap();
    let conn = client.connection().unwrap();
    assert_eq!(conn.state(), ConnectionState::Active);

    // In-flight call with a deadline well past the heartbeat timeout
    let call_conn = conn.clone();
    let in_flight = tokio::spawn(async move {
        call_conn
            .call("anything", Value::Nil, Some(Duration::from_secs(10)))
            .await
    });

    // heartbeat_timeout (700ms) + heartbeat_interval (200ms) plus margin
    assert!(
        wait_until(
            || conn.state() == ConnectionState::Failed,
            Duration::from_secs(3)
        )
        .await,
        "connection should fail at the heartbeat deadline, state = {}",
        conn.state()
    );

    let result = in_flight.await.unwrap();
    assert!(
        matches!(result, Err(ConduitError::ConnectionLost)),
        "in-flight call should see ConnectionLost, got {result:?}"
    );
}

/// Backpressure: a flood against a slow consumer is paused and
/// resumed without losing, duplicating, or reordering messages.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_flood_is_lossless() {
    let mut config = server_config();
    config.receive_queue_size = 10;
    let total: usize = 100;

    let received: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    let server = Server::new(config);
    server
        .on("flood", move |_conn, data| {
            let sink = sink.clone();
            async move {
                // Slow consumer
                tokio::time::sleep(Duration::from_millis(5)).await;
                let seq = payload::map_get(&data, "seq")
                    .and_then(Value::as_i64)
                    .unwrap_or(-1);
                sink.lock().unwrap().push(seq);
                Ok(None)
            }
        })
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let pauses_before = conduit::utils::global_metrics().snapshot().pauses_sent;

    let client = Client::new(client_config(port));
    client.connect().await.unwrap();

    for seq in 0..total {
        client
            .send(
                "flood",
                payload::value_map([("seq", Value::from(seq as i64))]),
            )
            .await
            .unwrap();
    }

    assert!(
        wait_until(
            || received.lock().unwrap().len() == total,
            Duration::from_secs(20)
        )
        .await,
        "only {} of {total} messages arrived",
        received.lock().unwrap().len()
    );

    let seen = received.lock().unwrap().clone();
    let expected: Vec<i64> = (0..total as i64).collect();
    assert_eq!(seen, expected, "messages lost, duplicated, or reordered");

    let pauses_after = conduit::utils::global_metrics().snapshot().pauses_sent;
    assert!(
        pauses_after > pauses_before,
        "flow control should have paused the sender at least once"
    );

    client.disconnect().await.unwrap();
    server.stop().await;
}

/// Graceful close: queued messages drain before the transport
/// closes, the state ends CLOSED, and post-close sends raise
/// NotConnected.
#[tokio::test]
async fn graceful_close_drains_queue() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();

    let server = Server::new(server_config());
    server
        .on("tail", move |_conn, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(client_config(port));
    client.connect().await.unwrap();
    let conn = client.connection().unwrap();

    let tail: usize = 20;
    for seq in 0..tail {
        client
            .send("tail", payload::value_map([("seq", Value::from(seq as i64))]))
            .await
            .unwrap();
    }
    // Close immediately; everything already queued must still arrive
    client.disconnect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(
        wait_until(
            || delivered.load(Ordering::SeqCst) == tail,
            Duration::from_secs(10)
        )
        .await,
        "only {} of {tail} queued messages were drained",
        delivered.load(Ordering::SeqCst)
    );

    match conn.send("tail", Value::Nil).await {
        Err(ConduitError::NotConnected) => {}
        other => panic!("post-close send should be NotConnected, got {other:?}"),
    }

    assert!(
        wait_until(|| server.connection_count() == 0, Duration::from_secs(5)).await,
        "server should remove the closed connection from the pool"
    );
    server.stop().await;
}

/// Discovery: listall reports every registered method with its schema.
#[tokio::test]
async fn listall_discovery() {
    let server = Server::new(server_config());
    server
        .rpc(
            "add",
            "Add two integers",
            MethodSchema::new(vec![
                ParamSpec::required("a", ParamKind::Integer),
                ParamSpec::required("b", ParamKind::Integer),
            ]),
            |_conn, params| async move {
                Ok(Value::from(int_param(&params, "a") + int_param(&params, "b")))
            },
        )
        .unwrap();
    server
        .rpc("status", "Server status", MethodSchema::default(), |_conn, _| async move {
            Ok(Value::from("ok"))
        })
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(client_config(port));
    client.connect().await.unwrap();

    let listing = client.call("listall", Value::Nil, None).await.unwrap();
    let entries = listing.as_array().expect("listall returns an array");
    let names: Vec<&str> = entries
        .iter()
        .filter_map(|entry| payload::map_get(entry, "name").and_then(Value::as_str))
        .collect();
    assert!(names.contains(&"listall"));
    assert!(names.contains(&"add"));
    assert!(names.contains(&"status"));

    let add_entry = entries
        .iter()
        .find(|entry| payload::map_get(entry, "name").and_then(Value::as_str) == Some("add"))
        .expect("add is listed");
    let params = payload::map_get(add_entry, "parameters")
        .and_then(Value::as_array)
        .expect("parameters array");
    assert_eq!(params.len(), 2);

    client.disconnect().await.unwrap();
    server.stop().await;
}

/// Broadcast respects exclude filters and reports the delivered count.
#[tokio::test]
async fn broadcast_with_exclusion() {
    let server = Server::new(server_config());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let hit_one = Arc::new(AtomicBool::new(false));
    let hit_two = Arc::new(AtomicBool::new(false));

    let mut config_one = client_config(port);
    config_one.name = "client-one".into();
    let client_one = Client::new(config_one);
    {
        let hit = hit_one.clone();
        client_one
            .on("news", move |_conn, _data| {
                let hit = hit.clone();
                async move {
                    hit.store(true, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .unwrap();
    }
    client_one.connect().await.unwrap();

    let mut config_two = client_config(port);
    config_two.name = "client-two".into();
    let client_two = Client::new(config_two);
    {
        let hit = hit_two.clone();
        client_two
            .on("news", move |_conn, _data| {
                let hit = hit.clone();
                async move {
                    hit.store(true, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .unwrap();
    }
    client_two.connect().await.unwrap();

    assert!(
        wait_until(|| server.connection_count() == 2, Duration::from_secs(5)).await,
        "both clients should be pooled"
    );

    let excluded = server
        .connections()
        .into_iter()
        .find(|conn| conn.peer_info().name == "client-one")
        .expect("client-one pooled")
        .id();

    let delivered = server
        .broadcast(
            "news",
            payload::value_map([("headline", Value::from("hello"))]),
            None,
            Some(&[excluded]),
        )
        .await;
    assert_eq!(delivered, 1);

    assert!(
        wait_until(|| hit_two.load(Ordering::SeqCst), Duration::from_secs(5)).await,
        "client-two should receive the broadcast"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !hit_one.load(Ordering::SeqCst),
        "excluded client must not receive the broadcast"
    );

    client_one.disconnect().await.unwrap();
    client_two.disconnect().await.unwrap();
    server.stop().await;
}

/// Reconnect supervisor: a server-initiated close triggers a fresh
/// connection attempt and the on_reconnect hook.
#[tokio::test]
async fn reconnect_after_server_close() {
    let server = Server::new(server_config());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut config = client_config(port);
    config.reconnect_enabled = true;
    config.reconnect_attempts = 5;
    config.reconnect_delay = Duration::from_millis(100);
    config.reconnect_delay_multiplier = 1.0;
    config.reconnect_delay_max = Duration::from_secs(1);

    let reconnected = Arc::new(AtomicBool::new(false));
    let client = Client::new(config);
    {
        let flag = reconnected.clone();
        client.on_reconnect(move |_client| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
            }
        });
    }
    client.connect().await.unwrap();
    let first_id = client.connection().unwrap().id();

    assert!(
        wait_until(|| server.connection_count() == 1, Duration::from_secs(5)).await,
        "first connection should be pooled"
    );

    // Server hangs up; the client should come back on its own
    let server_side = server.connections().pop().unwrap();
    server_side.close().await.unwrap();

    assert!(
        wait_until(
            || reconnected.load(Ordering::SeqCst) && client.is_connected(),
            Duration::from_secs(10)
        )
        .await,
        "client should reconnect and fire on_reconnect"
    );
    let second_id = client.connection().unwrap().id();
    assert_ne!(first_id, second_id, "reconnect must be a fresh connection");

    client.disconnect().await.unwrap();
    server.stop().await;
}

/// An AUTH frame after authentication is a protocol violation that fails
/// the connection immediately.
#[tokio::test]
async fn auth_frame_after_authentication_is_fatal() {
    let server = Server::new(server_config());
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let stream = transport::connect("127.0.0.1", port, false, Duration::from_secs(3), 0)
        .await
        .unwrap();
    let (mut writer, mut reader) =
        transport::split(stream, FrameCodec::new(), Duration::from_secs(2));
    let config = client_config(port);
    auth::authenticate_client(&mut writer, &mut reader, &config)
        .await
        .unwrap();

    // Replay the handshake on the live connection
    let replay = payload::encode(&payload::AuthRequestPayload {
        password_hash: auth::hash_password(PASSWORD),
        client_info: PeerInfo {
            name: "rogue".into(),
            version: "0".into(),
        },
    })
    .unwrap();
    writer
        .send(Frame::new(FrameType::AuthRequest, 0, replay))
        .await
        .unwrap();

    // The server must drop us promptly, well before its heartbeat
    // deadline (700ms) could be blamed instead
    let started = tokio::time::Instant::now();
    let mut dead = false;
    while started.elapsed() < Duration::from_millis(600) {
        match reader.next_timeout(Duration::from_millis(100)).await {
            Err(ConduitError::Timeout) => continue,
            Err(_) => {
                dead = true;
                break;
            }
            Ok(_) => continue,
        }
    }
    assert!(dead, "server should close the connection after the violation");
    server.stop().await;
}
