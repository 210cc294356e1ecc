//! Single-instance activation over a loopback socket.
//!
//! The first process to bind the activation address is the primary. Later
//! launches connect to it, ask it to activate, and exit.

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::event_loop::AppEvent;

pub const DEFAULT_ACTIVATION_ADDRESS: &str = "127.0.0.1:3233";

const ACTIVATE_COMMAND: &str = "activate";
const MAX_COMMAND_BYTES: usize = 256;
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum InstanceRole {
    Primary(ActivationListener),
    Secondary,
}

pub async fn acquire(address: SocketAddr) -> io::Result<InstanceRole> {
    match TcpListener::bind(address).await {
        Ok(listener) => Ok(InstanceRole::Primary(ActivationListener { listener })),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => Ok(InstanceRole::Secondary),
        Err(err) => Err(err),
    }
}

/// Asks the primary instance at `address` to activate.
pub async fn notify_primary(address: SocketAddr) -> io::Result<()> {
    let mut stream = timeout(NOTIFY_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "primary instance not responding"))??;
    stream
        .write_all(format!("{ACTIVATE_COMMAND}\n").as_bytes())
        .await?;
    stream.shutdown().await
}

#[derive(Debug)]
pub struct ActivationListener {
    listener: TcpListener,
}

impl ActivationListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Turns every `activate` request into an [`AppEvent::Activate`].
    pub fn spawn(self, events: mpsc::UnboundedSender<AppEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("activation accept failed: {}", err);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                if events.is_closed() {
                    break;
                }
                debug!(%peer, "activation request");
                tokio::spawn(read_requests(stream, events.clone()));
            }
        })
    }
}

async fn read_requests(stream: TcpStream, events: mpsc::UnboundedSender<AppEvent>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match timeout(NOTIFY_TIMEOUT, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) | Err(_) => return,
            Ok(Err(err)) => {
                debug!("activation request read failed: {}", err);
                return;
            }
        };

        if line.len() > MAX_COMMAND_BYTES {
            warn!("dropping oversized activation request");
            return;
        }
        match line.trim() {
            ACTIVATE_COMMAND => {
                info!("activated by another instance");
                if events.send(AppEvent::Activate).is_err() {
                    return;
                }
            }
            other => warn!(request = %other, "unknown activation request"),
        }
    }
}
