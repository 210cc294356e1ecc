use std::path::PathBuf;

use almond_core::{
    DEFAULT_BIND_ADDRESS, OBJECT_PATH, SERVICE_NAME, validate_object_path, validate_service_name,
};
use almond_service::{PreferenceStore, ServiceIdentity, ServiceState, serve_with_shutdown};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "almond-service")]
struct ServiceArgs {
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    bind_address: String,
    #[arg(long, default_value = SERVICE_NAME)]
    service_name: String,
    #[arg(long, default_value = OBJECT_PATH)]
    object_path: String,
    /// Where preferences are persisted. Defaults to the user config directory.
    #[arg(long)]
    state_file: Option<PathBuf>,
    /// Keep preferences in memory only.
    #[arg(long, default_value_t = false)]
    no_persist: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ServiceArgs::parse();
    if let Err(err) = validate_service_name(&args.service_name)
        .and_then(|()| validate_object_path(&args.object_path))
    {
        error!("{}", err);
        std::process::exit(2);
    }

    let store = if args.no_persist {
        PreferenceStore::in_memory()
    } else {
        let path = args.state_file.clone().unwrap_or_else(default_state_file);
        match PreferenceStore::open(path.clone()) {
            Ok(store) => store,
            Err(err) => {
                warn!(
                    "preferences at {} unusable, starting from defaults: {}",
                    path.display(),
                    err
                );
                PreferenceStore::in_memory()
            }
        }
    };

    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let identity = ServiceIdentity {
        service_name: args.service_name,
        object_path: args.object_path,
    };
    info!("service starting on {}", args.bind_address);
    if let Err(err) =
        serve_with_shutdown(listener, ServiceState::new(identity, store), shutdown_signal()).await
    {
        warn!("service exited: {}", err);
    }
    info!("service stopped");
}

fn default_state_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("almond")
        .join("service-preferences.json")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received"),
        _ = terminate => info!("termination signal received"),
    }
}
