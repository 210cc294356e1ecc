use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use almond_core::{
    BusMessage, CallResult, Hello, MAX_BUS_MESSAGE_BYTES, Method, MethodCall, MethodReturn,
    OBJECT_PATH, PrefValue, SERVICE_NAME, Signal, Welcome, decode_frame, encode_frame,
};
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

pub mod store;

pub use store::{PreferenceStore, StoreError};

type ClientId = u64;

/// The well-known name and object path this service answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub service_name: String,
    pub object_path: String,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_owned(),
            object_path: OBJECT_PATH.to_owned(),
        }
    }
}

#[derive(Debug)]
struct BusState {
    store: PreferenceStore,
    clients: HashMap<ClientId, mpsc::UnboundedSender<Message>>,
    next_client_id: ClientId,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    identity: Arc<ServiceIdentity>,
    inner: Arc<RwLock<BusState>>,
}

impl ServiceState {
    #[must_use]
    pub fn new(identity: ServiceIdentity, store: PreferenceStore) -> Self {
        Self {
            identity: Arc::new(identity),
            inner: Arc::new(RwLock::new(BusState {
                store,
                clients: HashMap::new(),
                next_client_id: 1,
            })),
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub async fn preference(&self, key: &str) -> Result<PrefValue, StoreError> {
        self.inner.read().await.store.get(key)
    }

    pub async fn connected_clients(&self) -> usize {
        self.inner.read().await.clients.len()
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new(ServiceIdentity::default(), PreferenceStore::in_memory())
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/bus", get(bus_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: ServiceState) -> Result<(), String> {
    serve_with_shutdown(listener, state, std::future::pending()).await
}

pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: ServiceState,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        service_name = %state.identity.service_name,
        object_path = %state.identity.object_path,
        "bus listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<ServiceState>) -> impl IntoResponse {
    Json(serde_json::json!({"ok": true, "service": state.identity.service_name}))
}

async fn bus_handler(ws: WebSocketUpgrade, State(state): State<ServiceState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_BUS_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("bus session ended with error: {}", err);
            }
        })
}

async fn handle_socket(state: ServiceState, socket: WebSocket) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before hello".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    if let Err(reason) = parse_hello_message(&first_message, &state.identity) {
        if let Ok(frame) = encode_frame(&BusMessage::Error {
            message: reason.clone(),
        }) {
            let _ = ws_sender.send(Message::Binary(frame.into())).await;
        }
        let _ = ws_sender.close().await;
        return Err(reason);
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Registered before the welcome goes out so that a client which has seen
    // the welcome never misses a change signal.
    let client_id = register_client(&state, outbound_tx.clone()).await;

    let welcome = encode_frame(&BusMessage::Welcome(Welcome {
        service_name: state.identity.service_name.clone(),
        object_path: state.identity.object_path.clone(),
    }))
    .map_err(|err| err.to_string());
    let sent = match welcome {
        Ok(frame) => ws_sender
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|err| err.to_string()),
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        unregister_client(&state, client_id).await;
        return Err(err);
    }
    info!(client_id, "client attached");

    // Split streams only flush queued pongs when the write half sends, so
    // the write half pings on its own to keep idle clients alive.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(client_id, "websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_BUS_MESSAGE_BYTES {
                    warn!(client_id, "dropping oversized message");
                    continue;
                }

                let call = match decode_frame(&data) {
                    Ok(BusMessage::Call(call)) => call,
                    Ok(other) => {
                        warn!(client_id, "unexpected message after hello: {:?}", other);
                        continue;
                    }
                    Err(err) => {
                        warn!(client_id, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                let reply = handle_call(&state, client_id, call).await;
                send_message(&outbound_tx, &BusMessage::Return(reply));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_client(&state, client_id).await;
    send_task.abort();
    info!(client_id, "client detached");
    Ok(())
}

fn parse_hello_message(message: &Message, identity: &ServiceIdentity) -> Result<Hello, String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be binary hello frame".to_owned()),
    };

    let frame = decode_frame(data).map_err(|err| format!("invalid hello frame: {}", err))?;
    match frame {
        BusMessage::Hello(hello) => {
            if hello.service_name != identity.service_name {
                return Err(format!("no service named {:?}", hello.service_name));
            }
            if hello.object_path != identity.object_path {
                return Err(format!("no object at path {:?}", hello.object_path));
            }
            Ok(hello)
        }
        _ => Err("first message must be Hello".to_owned()),
    }
}

async fn register_client(state: &ServiceState, tx: mpsc::UnboundedSender<Message>) -> ClientId {
    let mut bus = state.inner.write().await;
    let client_id = bus.next_client_id;
    bus.next_client_id += 1;
    bus.clients.insert(client_id, tx);
    client_id
}

async fn unregister_client(state: &ServiceState, client_id: ClientId) {
    state.inner.write().await.clients.remove(&client_id);
}

async fn handle_call(state: &ServiceState, client_id: ClientId, call: MethodCall) -> MethodReturn {
    let result = match call.method {
        Method::GetPreference { key } => match state.inner.read().await.store.get(&key) {
            Ok(value) => CallResult::Value(value),
            Err(err) => failed(err),
        },
        Method::SetPreference { key, value } => {
            let mut bus = state.inner.write().await;
            let outcome = bus.store.set(&key, value.clone());
            match outcome {
                Ok(changed) => {
                    let recipients = if changed {
                        bus.clients
                            .iter()
                            .filter(|(id, _)| **id != client_id)
                            .map(|(_, tx)| tx.clone())
                            .collect::<Vec<_>>()
                    } else {
                        Vec::new()
                    };
                    drop(bus);

                    if changed {
                        info!(client_id, key = %key, value = %value, "preference changed");
                        broadcast_signal(recipients, Signal::PreferenceChanged { key, value });
                    } else {
                        debug!(client_id, key = %key, "preference unchanged");
                    }
                    CallResult::Done
                }
                Err(err) => failed(err),
            }
        }
        Method::ListPreferences => CallResult::Values(state.inner.read().await.store.snapshot()),
    };

    MethodReturn {
        reply_serial: call.serial,
        result,
    }
}

fn failed(err: StoreError) -> CallResult {
    CallResult::Failed {
        message: err.to_string(),
    }
}

fn send_message(tx: &mpsc::UnboundedSender<Message>, message: &BusMessage) {
    match encode_frame(message) {
        Ok(frame) => {
            let _ = tx.send(Message::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize bus message: {}", err),
    }
}

fn broadcast_signal(recipients: Vec<mpsc::UnboundedSender<Message>>, signal: Signal) {
    let frame = match encode_frame(&BusMessage::Signal(signal)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize signal: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Binary(frame.clone().into()));
    }
}
