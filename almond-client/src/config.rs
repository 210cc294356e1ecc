use std::{
    env, fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use almond_core::{DEFAULT_BUS_ADDRESS, OBJECT_PATH, SERVICE_NAME};
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
    bus::ServiceEndpoint, instance::DEFAULT_ACTIVATION_ADDRESS, supervisor::ServiceLaunch,
};

pub const CONFIG_DIR_ENV: &str = "ALMOND_CONFIG_DIR";
pub const MAX_CONFIG_FILE_BYTES: u64 = 64 * 1024;
const APP_DIR_NAME: &str = "almond";
const CONFIG_FILE_NAME: &str = "client.json";
const SERVICE_PROGRAM_NAME: &str = "almond-service";

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "almond", about = "Almond desktop shell")]
pub struct ClientArgs {
    /// WebSocket address of the background service bus.
    #[arg(long)]
    pub bus_address: Option<String>,
    /// Background service executable. Defaults to `almond-service` next to this binary.
    #[arg(long)]
    pub service_program: Option<PathBuf>,
    /// Never start the background service; connect to an existing one.
    #[arg(long, default_value_t = false)]
    pub no_spawn_service: bool,
    /// Keep running after the window is closed.
    #[arg(long, default_value_t = false)]
    pub background: bool,
    /// Loopback address used to hand activation to an already running instance.
    #[arg(long)]
    pub activation_address: Option<String>,
    /// Overrides the configuration directory (also `ALMOND_CONFIG_DIR`).
    #[arg(long)]
    pub config_dir: Option<PathBuf>,
}

/// Defaults read from `client.json`. Every field is optional; command-line
/// flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavedClientConfig {
    pub bus_address: Option<String>,
    pub service_program: Option<PathBuf>,
    pub spawn_service: Option<bool>,
    pub background: Option<bool>,
    pub activation_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    pub config: PathBuf,
    pub cache: PathBuf,
}

impl AppDirs {
    /// Resolves the per-user directories, honouring an explicit override
    /// and then `ALMOND_CONFIG_DIR`.
    pub fn resolve(override_dir: Option<&Path>) -> Self {
        if let Some(dir) = override_dir {
            return Self::in_dir(dir);
        }
        if let Some(dir) = env::var_os(CONFIG_DIR_ENV) {
            return Self::in_dir(Path::new(&dir));
        }

        let base_config = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        let base_cache = dirs::cache_dir().unwrap_or_else(|| base_config.clone());
        Self {
            config: base_config.join(APP_DIR_NAME),
            cache: base_cache.join(APP_DIR_NAME),
        }
    }

    /// Keeps everything under a single directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.to_path_buf(),
            cache: dir.join("cache"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cache.join("logs")
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: ServiceEndpoint,
    pub service: ServiceLaunch,
    pub background: bool,
    pub activation_address: SocketAddr,
    pub dirs: AppDirs,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file {} is too large ({size} > {max} bytes)", path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration:\n- {}", .0.join("\n- "))]
    Invalid(Vec<String>),
}

/// Loads `client.json`, returning `None` when the file does not exist.
pub fn load_saved_config_from(path: &Path) -> Result<Option<SavedClientConfig>, ConfigError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if meta.len() > MAX_CONFIG_FILE_BYTES {
        return Err(ConfigError::TooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            max: MAX_CONFIG_FILE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let cfg = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(cfg))
}

/// Merges command-line flags over saved defaults over built-in defaults and
/// validates the result, reporting every problem at once.
pub fn resolve_config(
    args: &ClientArgs,
    saved: Option<&SavedClientConfig>,
    dirs: AppDirs,
) -> Result<ClientConfig, ConfigError> {
    let saved = saved.cloned().unwrap_or_default();
    let mut errors: Vec<String> = Vec::new();

    let bus_address = args
        .bus_address
        .clone()
        .or(saved.bus_address)
        .unwrap_or_else(|| DEFAULT_BUS_ADDRESS.to_owned());
    let endpoint = match ServiceEndpoint::new(bus_address.trim(), SERVICE_NAME, OBJECT_PATH) {
        Ok(endpoint) => Some(endpoint),
        Err(err) => {
            errors.push(format!("Bus address {bus_address:?}: {err}"));
            None
        }
    };

    let activation_text = args
        .activation_address
        .clone()
        .or(saved.activation_address)
        .unwrap_or_else(|| DEFAULT_ACTIVATION_ADDRESS.to_owned());
    let activation_address = match activation_text.trim().parse::<SocketAddr>() {
        Ok(address) if address.ip().is_loopback() => Some(address),
        Ok(address) => {
            errors.push(format!("Activation address {address} must be a loopback address."));
            None
        }
        Err(err) => {
            errors.push(format!("Activation address {activation_text:?} is invalid: {err}"));
            None
        }
    };

    let program = args
        .service_program
        .clone()
        .or(saved.service_program)
        .unwrap_or_else(default_service_program);
    if program.as_os_str().is_empty() {
        errors.push("Service program must not be empty.".to_owned());
    }
    let spawn_service = !args.no_spawn_service && saved.spawn_service.unwrap_or(true);
    let background = args.background || saved.background.unwrap_or(false);

    match (endpoint, activation_address) {
        (Some(endpoint), Some(activation_address)) if errors.is_empty() => {
            let service = service_launch(&endpoint, program, spawn_service);
            Ok(ClientConfig {
                endpoint,
                service,
                background,
                activation_address,
                dirs,
            })
        }
        _ => Err(ConfigError::Invalid(errors)),
    }
}

/// The service is told to listen where the client will look for it.
fn service_launch(endpoint: &ServiceEndpoint, program: PathBuf, enabled: bool) -> ServiceLaunch {
    let bind_address = bus_socket_address(&endpoint.address);
    let mut args = Vec::new();
    if let Some(bind) = &bind_address {
        args.push("--bind-address".to_owned());
        args.push(bind.clone());
    }

    ServiceLaunch {
        program,
        args,
        probe_address: bind_address.and_then(|bind| bind.parse().ok()),
        enabled,
    }
}

fn bus_socket_address(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

/// `almond-service` installed next to the running executable.
pub fn default_service_program() -> PathBuf {
    let file_name = format!("{SERVICE_PROGRAM_NAME}{}", env::consts::EXE_SUFFIX);
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs() -> AppDirs {
        AppDirs::in_dir(Path::new("/tmp/almond-test"))
    }

    #[test]
    fn defaults_apply_without_flags_or_file() {
        let cfg = resolve_config(&ClientArgs::default(), None, dirs()).expect("defaults valid");
        assert_eq!(cfg.endpoint.address.as_str(), DEFAULT_BUS_ADDRESS);
        assert_eq!(cfg.endpoint.service_name, SERVICE_NAME);
        assert_eq!(cfg.activation_address.to_string(), DEFAULT_ACTIVATION_ADDRESS);
        assert!(cfg.service.enabled);
        assert!(!cfg.background);
        assert_eq!(cfg.service.args, ["--bind-address", "127.0.0.1:3232"]);
        assert_eq!(
            cfg.service.probe_address,
            Some("127.0.0.1:3232".parse().unwrap())
        );
    }

    #[test]
    fn flags_override_saved_config() {
        let saved = SavedClientConfig {
            bus_address: Some("ws://127.0.0.1:4000/bus".to_owned()),
            spawn_service: Some(true),
            background: Some(true),
            activation_address: Some("127.0.0.1:4001".to_owned()),
            ..SavedClientConfig::default()
        };
        let args = ClientArgs {
            bus_address: Some("ws://127.0.0.1:5000/bus".to_owned()),
            no_spawn_service: true,
            ..ClientArgs::default()
        };

        let cfg = resolve_config(&args, Some(&saved), dirs()).expect("valid");
        assert_eq!(cfg.endpoint.address.as_str(), "ws://127.0.0.1:5000/bus");
        assert_eq!(cfg.activation_address.port(), 4001);
        assert!(!cfg.service.enabled);
        assert!(cfg.background);
    }

    #[test]
    fn every_problem_is_reported() {
        let args = ClientArgs {
            bus_address: Some("http://127.0.0.1:3232/bus".to_owned()),
            activation_address: Some("10.1.2.3:3233".to_owned()),
            service_program: Some(PathBuf::new()),
            ..ClientArgs::default()
        };

        match resolve_config(&args, None, dirs()) {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors.len(), 3, "{errors:?}");
                assert!(errors[0].contains("ws://"));
                assert!(errors[1].contains("loopback"));
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn saved_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let dirs = AppDirs::in_dir(dir.path());
        assert_eq!(load_saved_config_from(&dirs.config_file()).unwrap(), None);

        fs::write(
            dirs.config_file(),
            r#"{"bus_address":"ws://127.0.0.1:4000/bus","spawn_service":false}"#,
        )
        .expect("write config");
        let saved = load_saved_config_from(&dirs.config_file())
            .unwrap()
            .expect("config present");
        assert_eq!(saved.bus_address.as_deref(), Some("ws://127.0.0.1:4000/bus"));
        assert_eq!(saved.spawn_service, Some(false));
        assert_eq!(saved.service_program, None);
    }

    #[test]
    fn unreadable_config_files_are_reported() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);

        fs::write(&path, "{not json").expect("write config");
        assert!(matches!(
            load_saved_config_from(&path),
            Err(ConfigError::Parse { .. })
        ));

        fs::write(&path, vec![b' '; MAX_CONFIG_FILE_BYTES as usize + 1]).expect("write config");
        assert!(matches!(
            load_saved_config_from(&path),
            Err(ConfigError::TooLarge { .. })
        ));
    }

    #[test]
    fn override_dir_holds_config_and_cache() {
        let dirs = AppDirs::resolve(Some(Path::new("/srv/almond")));
        assert_eq!(dirs.config_file(), Path::new("/srv/almond/client.json"));
        assert_eq!(dirs.log_dir(), Path::new("/srv/almond/cache/logs"));
    }

    #[test]
    fn service_program_sits_next_to_the_executable() {
        let program = default_service_program();
        let name = program.file_name().and_then(|name| name.to_str()).unwrap();
        assert!(name.starts_with(SERVICE_PROGRAM_NAME));
    }
}
