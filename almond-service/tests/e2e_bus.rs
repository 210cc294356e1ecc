use std::time::Duration;

use almond_core::{
    BusMessage, CallResult, Hello, MAX_BUS_MESSAGE_BYTES, Method, MethodCall, OBJECT_PATH,
    PREF_ENABLE_VOICE_INPUT, PREF_STORE_LOG, PrefValue, SERVICE_NAME, Signal, decode_frame,
    encode_frame,
};
use almond_service::{ServiceState, build_router};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestClient {
    write: WsWrite,
    read: WsRead,
}

#[tokio::test]
async fn hello_is_answered_with_welcome() {
    let (address, shutdown_tx) = start_service(ServiceState::default()).await;

    let mut client = open_socket(&address).await;
    send(&mut client, &hello(SERVICE_NAME, OBJECT_PATH)).await;

    match recv_next_bus_message(&mut client, Duration::from_secs(2)).await {
        Some(BusMessage::Welcome(welcome)) => {
            assert_eq!(welcome.service_name, SERVICE_NAME);
            assert_eq!(welcome.object_path, OBJECT_PATH);
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn hello_for_unknown_service_is_rejected_and_closed() {
    let (address, shutdown_tx) = start_service(ServiceState::default()).await;

    let mut client = open_socket(&address).await;
    send(&mut client, &hello("org.example.Other", OBJECT_PATH)).await;

    match recv_next_bus_message(&mut client, Duration::from_secs(2)).await {
        Some(BusMessage::Error { message }) => {
            assert!(message.contains("org.example.Other"), "unexpected: {message}")
        }
        other => panic!("expected error, got {other:?}"),
    }

    let closed = timeout(Duration::from_secs(2), client.read.next())
        .await
        .expect("service should close the socket quickly");
    assert!(
        closed.is_none()
            || matches!(closed, Some(Ok(Message::Close(_))))
            || matches!(closed, Some(Err(_))),
        "expected websocket termination after rejected hello"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn call_before_hello_is_rejected() {
    let (address, shutdown_tx) = start_service(ServiceState::default()).await;

    let mut client = open_socket(&address).await;
    send(&mut client, &call(1, Method::ListPreferences)).await;

    assert!(matches!(
        recv_next_bus_message(&mut client, Duration::from_secs(2)).await,
        Some(BusMessage::Error { .. })
    ));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn get_and_set_preferences() {
    let state = ServiceState::default();
    let (address, shutdown_tx) = start_service(state.clone()).await;
    let mut client = connect_client(&address).await;

    send(
        &mut client,
        &call(
            1,
            Method::GetPreference {
                key: PREF_STORE_LOG.to_owned(),
            },
        ),
    )
    .await;
    assert_eq!(
        recv_reply(&mut client, 1).await,
        CallResult::Value(PrefValue::String("no".to_owned()))
    );

    send(
        &mut client,
        &call(
            2,
            Method::SetPreference {
                key: PREF_STORE_LOG.to_owned(),
                value: PrefValue::String("yes".to_owned()),
            },
        ),
    )
    .await;
    assert_eq!(recv_reply(&mut client, 2).await, CallResult::Done);
    assert_eq!(
        state.preference(PREF_STORE_LOG).await.unwrap(),
        PrefValue::String("yes".to_owned())
    );

    send(
        &mut client,
        &call(
            3,
            Method::GetPreference {
                key: "no-such-key".to_owned(),
            },
        ),
    )
    .await;
    assert!(matches!(
        recv_reply(&mut client, 3).await,
        CallResult::Failed { .. }
    ));

    send(&mut client, &call(4, Method::ListPreferences)).await;
    match recv_reply(&mut client, 4).await {
        CallResult::Values(values) => {
            assert_eq!(values.len(), 3);
            assert_eq!(
                values.get(PREF_ENABLE_VOICE_INPUT),
                Some(&PrefValue::Bool(false))
            );
        }
        other => panic!("expected values, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn change_is_signalled_to_other_clients_only() {
    let state = ServiceState::default();
    let (address, shutdown_tx) = start_service(state.clone()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;
    assert_eq!(state.connected_clients().await, 2);
    assert_eq!(state.identity().service_name, SERVICE_NAME);

    send(
        &mut client_a,
        &call(
            1,
            Method::SetPreference {
                key: PREF_ENABLE_VOICE_INPUT.to_owned(),
                value: PrefValue::Bool(true),
            },
        ),
    )
    .await;
    assert_eq!(recv_reply(&mut client_a, 1).await, CallResult::Done);

    let signal = recv_signal(&mut client_b, Duration::from_secs(2))
        .await
        .expect("client B receives change signal");
    assert_eq!(
        signal,
        Signal::PreferenceChanged {
            key: PREF_ENABLE_VOICE_INPUT.to_owned(),
            value: PrefValue::Bool(true),
        }
    );

    let own = recv_signal(&mut client_a, Duration::from_millis(400)).await;
    assert!(own.is_none(), "setter unexpectedly received its own change");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unchanged_value_is_not_signalled() {
    let (address, shutdown_tx) = start_service(ServiceState::default()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    send(
        &mut client_a,
        &call(
            1,
            Method::SetPreference {
                key: PREF_ENABLE_VOICE_INPUT.to_owned(),
                value: PrefValue::Bool(false),
            },
        ),
    )
    .await;
    assert_eq!(recv_reply(&mut client_a, 1).await, CallResult::Done);

    let signal = recv_signal(&mut client_b, Duration::from_millis(400)).await;
    assert!(signal.is_none(), "unchanged value was signalled");

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn mistyped_set_fails_without_signal() {
    let (address, shutdown_tx) = start_service(ServiceState::default()).await;

    let mut client_a = connect_client(&address).await;
    let mut client_b = connect_client(&address).await;

    send(
        &mut client_a,
        &call(
            9,
            Method::SetPreference {
                key: PREF_STORE_LOG.to_owned(),
                value: PrefValue::Bool(true),
            },
        ),
    )
    .await;
    match recv_reply(&mut client_a, 9).await {
        CallResult::Failed { message } => assert!(message.contains("type"), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(
        recv_signal(&mut client_b, Duration::from_millis(400))
            .await
            .is_none()
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_and_oversized_frames_are_dropped() {
    let (address, shutdown_tx) = start_service(ServiceState::default()).await;
    let mut client = connect_client(&address).await;

    client
        .write
        .send(Message::Binary(vec![0xFF, 0x00, 0xAB, 0xCD].into()))
        .await
        .expect("send malformed frame");
    client
        .write
        .send(Message::Binary(vec![0_u8; MAX_BUS_MESSAGE_BYTES + 1].into()))
        .await
        .ok();

    // The service keeps accepting sessions afterwards.
    let mut client = connect_client(&address).await;
    send(&mut client, &call(5, Method::ListPreferences)).await;
    assert!(matches!(
        recv_reply(&mut client, 5).await,
        CallResult::Values(_)
    ));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn healthz_reports_service_name() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral service socket");
    let address = listener.local_addr().expect("service local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, build_router(ServiceState::default())).await;
    });

    let mut stream = tokio::net::TcpStream::connect(address)
        .await
        .expect("connect healthz");
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(SERVICE_NAME), "{response}");
}

async fn start_service(state: ServiceState) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral service socket");
    let address = listener.local_addr().expect("service local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, build_router(state)).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}/bus", address), shutdown_tx)
}

fn hello(service_name: &str, object_path: &str) -> BusMessage {
    BusMessage::Hello(Hello {
        service_name: service_name.to_owned(),
        object_path: object_path.to_owned(),
    })
}

fn call(serial: u64, method: Method) -> BusMessage {
    BusMessage::Call(MethodCall { serial, method })
}

async fn open_socket(ws_url: &str) -> TestClient {
    let (ws_stream, _) = connect_async(ws_url).await.expect("connect websocket");
    let (write, read) = ws_stream.split();
    TestClient { write, read }
}

async fn connect_client(ws_url: &str) -> TestClient {
    let mut client = open_socket(ws_url).await;
    send(&mut client, &hello(SERVICE_NAME, OBJECT_PATH)).await;
    match recv_next_bus_message(&mut client, Duration::from_secs(2)).await {
        Some(BusMessage::Welcome(_)) => client,
        other => panic!("expected welcome, got {other:?}"),
    }
}

async fn send(client: &mut TestClient, message: &BusMessage) {
    let frame = encode_frame(message).expect("encode frame");
    client
        .write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send frame");
}

async fn recv_reply(client: &mut TestClient, serial: u64) -> CallResult {
    loop {
        match recv_next_bus_message(client, Duration::from_secs(2)).await {
            Some(BusMessage::Return(reply)) if reply.reply_serial == serial => {
                return reply.result;
            }
            Some(_) => continue,
            None => panic!("no reply for serial {serial}"),
        }
    }
}

async fn recv_signal(client: &mut TestClient, wait: Duration) -> Option<Signal> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_next_bus_message(client, remaining).await {
            Some(BusMessage::Signal(signal)) => return Some(signal),
            Some(_) => continue,
            None => return None,
        }
    }
}

async fn recv_next_bus_message(client: &mut TestClient, wait: Duration) -> Option<BusMessage> {
    loop {
        let next = timeout(wait, client.read.next()).await.ok()?;
        let message = next?.ok()?;

        match message {
            Message::Binary(bytes) => return decode_frame(&bytes).ok(),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}
