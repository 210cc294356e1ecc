//! Client side of the service bus.
//!
//! A [`ServiceConnector`] turns a [`ServiceEndpoint`] into a [`ServiceHandle`]
//! exactly once per call. [`BusConnector`] is the WebSocket implementation;
//! the handle it produces is a [`BusProxy`] that multiplexes method calls by
//! serial over a single socket and fans change signals out to subscribers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use almond_core::{
    BusMessage, CallResult, CoreError, Hello, Method, MethodCall, PrefValue, Serial, Signal,
    decode_frame, encode_frame, validate_object_path, validate_service_name,
};
use futures::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;
type PendingCalls = Arc<Mutex<HashMap<Serial, oneshot::Sender<CallResult>>>>;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub address: Url,
    pub service_name: String,
    pub object_path: String,
}

impl ServiceEndpoint {
    pub fn new(
        address: &str,
        service_name: &str,
        object_path: &str,
    ) -> Result<Self, ConnectionError> {
        let url = Url::parse(address)
            .map_err(|err| ConnectionError::InvalidEndpoint(format!("{address}: {err}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "{address}: bus address must start with ws:// or wss://"
            )));
        }
        validate_service_name(service_name)
            .and_then(|()| validate_object_path(object_path))
            .map_err(|err| ConnectionError::InvalidEndpoint(err.to_string()))?;

        Ok(Self {
            address: url,
            service_name: service_name.to_owned(),
            object_path: object_path.to_owned(),
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("invalid service endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("could not reach {address} after {attempts} attempts: {reason}")]
    Unreachable {
        address: String,
        attempts: u32,
        reason: String,
    },
    #[error("service handshake failed: {0}")]
    Handshake(String),
    #[error("service rejected connection: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service connection closed")]
    Disconnected,
    #[error("service call timed out after {0:?}")]
    Timeout(Duration),
    #[error("service call failed: {0}")]
    Remote(String),
    #[error("unexpected reply to {method}")]
    UnexpectedReply { method: &'static str },
    #[error(transparent)]
    Protocol(#[from] CoreError),
}

/// A preference change announced by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceChange {
    pub key: String,
    pub value: PrefValue,
}

/// The operations the shell needs from the background service.
pub trait RemoteService: Send + Sync {
    fn get_preference(&self, key: &str) -> BoxFuture<'_, Result<PrefValue, ServiceError>>;

    fn set_preference(
        &self,
        key: &str,
        value: PrefValue,
    ) -> BoxFuture<'_, Result<(), ServiceError>>;

    fn list_preferences(&self) -> BoxFuture<'_, Result<BTreeMap<String, PrefValue>, ServiceError>>;

    fn subscribe(&self) -> broadcast::Receiver<PreferenceChange>;
}

pub type ServiceHandle = Arc<dyn RemoteService>;

pub type ConnectFuture = BoxFuture<'static, Result<ServiceHandle, ConnectionError>>;

pub trait ServiceConnector: Send + Sync {
    /// Starts one connection attempt. The returned future resolves exactly once.
    fn connect(&self, endpoint: ServiceEndpoint) -> ConnectFuture;
}

#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub backoff_base: Duration,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        // The companion service is usually spawned moments before the first
        // activation, so early refusals are expected.
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusConnector {
    policy: ConnectPolicy,
}

impl BusConnector {
    pub fn new(policy: ConnectPolicy) -> Self {
        Self { policy }
    }
}

impl ServiceConnector for BusConnector {
    fn connect(&self, endpoint: ServiceEndpoint) -> ConnectFuture {
        let policy = self.policy.clone();
        async move {
            let proxy = BusProxy::connect(endpoint, policy).await?;
            let handle: ServiceHandle = proxy;
            Ok(handle)
        }
        .boxed()
    }
}

pub struct BusProxy {
    endpoint: ServiceEndpoint,
    next_serial: AtomicU64,
    outbound: mpsc::UnboundedSender<BusMessage>,
    pending: PendingCalls,
    changes: broadcast::Sender<PreferenceChange>,
    call_timeout: Duration,
}

impl std::fmt::Debug for BusProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusProxy")
            .field("endpoint", &self.endpoint)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl BusProxy {
    pub async fn connect(
        endpoint: ServiceEndpoint,
        policy: ConnectPolicy,
    ) -> Result<Arc<Self>, ConnectionError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 1;
        let (ws_stream, _) = loop {
            debug!(
                attempt,
                max_attempts,
                address = %endpoint.address,
                "connecting to service bus"
            );

            let reason = match timeout(
                policy.attempt_timeout,
                connect_async(endpoint.address.as_str()),
            )
            .await
            {
                Ok(Ok(ok)) => break ok,
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {:?}", policy.attempt_timeout),
            };

            warn!(attempt, address = %endpoint.address, "bus connect failed: {reason}");
            if attempt >= max_attempts {
                return Err(ConnectionError::Unreachable {
                    address: endpoint.address.to_string(),
                    attempts: attempt,
                    reason,
                });
            }

            let backoff = policy.backoff_base.saturating_mul(1_u32 << (attempt - 1).min(16));
            tokio::time::sleep(backoff).await;
            attempt += 1;
        };

        let (mut write, mut read) = ws_stream.split();

        let hello = encode_frame(&BusMessage::Hello(Hello {
            service_name: endpoint.service_name.clone(),
            object_path: endpoint.object_path.clone(),
        }))
        .map_err(|err| ConnectionError::Handshake(err.to_string()))?;
        write
            .send(Message::Binary(hello.into()))
            .await
            .map_err(|err| ConnectionError::Handshake(err.to_string()))?;

        let reply = timeout(policy.handshake_timeout, next_bus_message(&mut read))
            .await
            .map_err(|_| {
                ConnectionError::Handshake(format!(
                    "no welcome within {:?}",
                    policy.handshake_timeout
                ))
            })?
            .ok_or_else(|| ConnectionError::Handshake("service closed the connection".to_owned()))?;

        match reply {
            BusMessage::Welcome(welcome)
                if welcome.service_name == endpoint.service_name
                    && welcome.object_path == endpoint.object_path => {}
            BusMessage::Welcome(welcome) => {
                return Err(ConnectionError::Handshake(format!(
                    "welcomed by {} at {}",
                    welcome.service_name, welcome.object_path
                )));
            }
            BusMessage::Error { message } => return Err(ConnectionError::Rejected(message)),
            other => {
                return Err(ConnectionError::Handshake(format!(
                    "unexpected first message {other:?}"
                )));
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<BusMessage>();
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        tokio::spawn(network_send_task(write, outbound_rx));
        tokio::spawn(network_receive_task(read, pending.clone(), changes.clone()));

        info!(
            service_name = %endpoint.service_name,
            object_path = %endpoint.object_path,
            address = %endpoint.address,
            "attached to service"
        );

        Ok(Arc::new(Self {
            endpoint,
            next_serial: AtomicU64::new(1),
            outbound: outbound_tx,
            pending,
            changes,
            call_timeout: policy.call_timeout,
        }))
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    async fn call(&self, method: Method) -> Result<CallResult, ServiceError> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| ServiceError::Disconnected)?
            .insert(serial, reply_tx);

        if self
            .outbound
            .send(BusMessage::Call(MethodCall { serial, method }))
            .is_err()
        {
            self.forget(serial);
            return Err(ServiceError::Disconnected);
        }

        match timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ServiceError::Disconnected),
            Err(_) => {
                self.forget(serial);
                Err(ServiceError::Timeout(self.call_timeout))
            }
        }
    }

    fn forget(&self, serial: Serial) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&serial);
        }
    }
}

impl RemoteService for BusProxy {
    fn get_preference(&self, key: &str) -> BoxFuture<'_, Result<PrefValue, ServiceError>> {
        let key = key.to_owned();
        async move {
            match self.call(Method::GetPreference { key }).await? {
                CallResult::Value(value) => Ok(value),
                CallResult::Failed { message } => Err(ServiceError::Remote(message)),
                _ => Err(ServiceError::UnexpectedReply {
                    method: "GetPreference",
                }),
            }
        }
        .boxed()
    }

    fn set_preference(
        &self,
        key: &str,
        value: PrefValue,
    ) -> BoxFuture<'_, Result<(), ServiceError>> {
        let key = key.to_owned();
        async move {
            match self.call(Method::SetPreference { key, value }).await? {
                CallResult::Done => Ok(()),
                CallResult::Failed { message } => Err(ServiceError::Remote(message)),
                _ => Err(ServiceError::UnexpectedReply {
                    method: "SetPreference",
                }),
            }
        }
        .boxed()
    }

    fn list_preferences(&self) -> BoxFuture<'_, Result<BTreeMap<String, PrefValue>, ServiceError>> {
        async move {
            match self.call(Method::ListPreferences).await? {
                CallResult::Values(values) => Ok(values),
                CallResult::Failed { message } => Err(ServiceError::Remote(message)),
                _ => Err(ServiceError::UnexpectedReply {
                    method: "ListPreferences",
                }),
            }
        }
        .boxed()
    }

    fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
        self.changes.subscribe()
    }
}

async fn next_bus_message(read: &mut WsRead) -> Option<BusMessage> {
    while let Some(next) = read.next().await {
        match next {
            Ok(Message::Binary(bytes)) => match decode_frame(&bytes) {
                Ok(message) => return Some(message),
                Err(err) => warn!("decode frame failed: {}", err),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

async fn network_send_task(mut write: WsWrite, mut outbound_rx: mpsc::UnboundedReceiver<BusMessage>) {
    while let Some(message) = outbound_rx.recv().await {
        match encode_frame(&message) {
            Ok(frame) => {
                if write.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
    let _ = write.close().await;
}

async fn network_receive_task(
    mut read: WsRead,
    pending: PendingCalls,
    changes: broadcast::Sender<PreferenceChange>,
) {
    while let Some(message) = next_bus_message(&mut read).await {
        match message {
            BusMessage::Return(reply) => {
                let waiter = pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&reply.reply_serial));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply.result);
                    }
                    None => debug!(serial = reply.reply_serial, "reply for unknown call"),
                }
            }
            BusMessage::Signal(Signal::PreferenceChanged { key, value }) => {
                debug!(key = %key, value = %value, "preference changed remotely");
                let _ = changes.send(PreferenceChange { key, value });
            }
            other => warn!("unexpected message from service: {:?}", other),
        }
    }

    // Dropping the waiters fails every outstanding call with `Disconnected`.
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    info!("service bus closed");
}
