use std::time::Duration;

use almond_client::{
    app,
    config::{AppDirs, ClientArgs, load_saved_config_from, resolve_config},
    logging::init_logging,
};
use clap::Parser;
use tracing::{error, info, warn};

fn main() {
    let args = ClientArgs::parse();
    let dirs = AppDirs::resolve(args.config_dir.as_deref());
    if let Some(log_path) = init_logging(&dirs.log_dir()) {
        eprintln!("logging to {}", log_path.display());
    }

    let config_file = dirs.config_file();
    let saved = match load_saved_config_from(&config_file) {
        Ok(saved) => saved,
        Err(err) => {
            warn!("ignoring saved config: {}", err);
            None
        }
    };

    let config = match resolve_config(&args, saved.as_ref(), dirs) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to create tokio runtime: {}", err);
            std::process::exit(1);
        }
    };

    info!(
        bus = %config.endpoint.address,
        background = config.background,
        "almond starting"
    );
    let result = runtime.block_on(app::run(config));
    runtime.shutdown_timeout(Duration::from_millis(200));

    match result {
        Ok(()) => info!("almond exited"),
        Err(err) => {
            error!("almond failed: {}", err);
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
