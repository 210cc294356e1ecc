//! Companion service process management.

use std::{
    net::SocketAddr,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Duration,
};

use tokio::{net::TcpStream, time::timeout};
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// When something already answers here the service is not spawned again.
    pub probe_address: Option<SocketAddr>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceSupervisor {
    launch: ServiceLaunch,
}

impl ServiceSupervisor {
    pub fn new(launch: ServiceLaunch) -> Self {
        Self { launch }
    }

    /// Starts the companion service unless it is disabled or already running.
    ///
    /// A failed launch is logged and reported as `None`; the bus connector
    /// reports the consequence if nothing ends up listening.
    pub async fn spawn(&self) -> Option<ServiceProcess> {
        if !self.launch.enabled {
            debug!("service spawning disabled");
            return None;
        }

        if let Some(address) = self.launch.probe_address {
            if let Ok(Ok(_)) = timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await {
                info!(%address, "background service already running");
                return None;
            }
        }

        let spawned = Command::new(&self.launch.program)
            .args(&self.launch.args)
            .stdin(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                info!(
                    pid = child.id(),
                    program = %self.launch.program.display(),
                    "background service started"
                );
                Some(ServiceProcess { child })
            }
            Err(err) => {
                warn!(
                    program = %self.launch.program.display(),
                    "failed to start background service: {}",
                    err
                );
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct ServiceProcess {
    child: Child,
}

impl ServiceProcess {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Sends SIGTERM without waiting for the process to exit.
    #[cfg(unix)]
    pub fn terminate(&mut self) {
        use nix::{
            sys::signal::{Signal, kill},
            unistd::Pid,
        };

        let pid = self.child.id();
        let Ok(raw) = i32::try_from(pid) else {
            warn!(pid, "service pid out of range");
            return;
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => info!(pid, "sent SIGTERM to background service"),
            Err(err) => warn!(pid, "failed to signal background service: {}", err),
        }
    }

    #[cfg(not(unix))]
    pub fn terminate(&mut self) {
        let pid = self.child.id();
        match self.child.kill() {
            Ok(()) => info!(pid, "stopped background service"),
            Err(err) => warn!(pid, "failed to stop background service: {}", err),
        }
    }
}
