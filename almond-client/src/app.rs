use std::{io, sync::Arc};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    bus::{BusConnector, ConnectPolicy, ConnectionError},
    config::ClientConfig,
    console::{self, ConsoleWindowFactory},
    controller::{AppController, ProcessLifetime},
    event_loop::{self, AppEvent},
    instance::{self, InstanceRole},
    preference::default_preferences,
    supervisor::ServiceSupervisor,
    webview::WebViewProfile,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("single-instance setup failed: {0}")]
    Instance(#[source] io::Error),
}

/// Runs the shell until it quits. A second launch hands activation to the
/// running instance and returns immediately.
pub async fn run(config: ClientConfig) -> Result<(), AppError> {
    let listener = match instance::acquire(config.activation_address)
        .await
        .map_err(AppError::Instance)?
    {
        InstanceRole::Primary(listener) => listener,
        InstanceRole::Secondary => {
            info!(
                address = %config.activation_address,
                "already running, activating the existing instance"
            );
            instance::notify_primary(config.activation_address)
                .await
                .map_err(AppError::Instance)?;
            return Ok(());
        }
    };

    let profile = WebViewProfile::new(&config.dirs);
    if let Err(err) = profile.prepare() {
        warn!("failed to prepare web view profile: {}", err);
    }

    let mut service_process = ServiceSupervisor::new(config.service.clone()).spawn().await;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<AppEvent>();
    let _activation_task = listener.spawn(events_tx.clone());
    console::spawn_stdin_reader(events_tx.clone());

    let lifetime = ProcessLifetime::default();
    let _background_hold = config.background.then(|| lifetime.hold());

    let mut controller = AppController::new(
        Arc::new(BusConnector::new(ConnectPolicy::default())),
        config.endpoint.clone(),
        Box::new(ConsoleWindowFactory::new(profile)),
        default_preferences(),
        lifetime,
    );
    controller.startup();

    let _ = events_tx.send(AppEvent::Activate);
    let result = event_loop::run(&mut controller, &events_tx, &mut events_rx).await;
    drop(controller);

    if let Some(process) = service_process.as_mut() {
        info!(pid = process.id(), "stopping background service");
        process.terminate();
    }

    result.map_err(AppError::from)
}
