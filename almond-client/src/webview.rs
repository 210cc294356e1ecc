use std::{fs, io, path::PathBuf};

use tracing::info;

use crate::config::AppDirs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieAcceptPolicy {
    Always,
    Never,
    NoThirdParty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieStorage {
    Text,
    Sqlite,
}

/// Storage layout and cookie policy shared by every web view the shell
/// creates. Set up once at startup, before the first window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebViewProfile {
    pub base_cache_directory: PathBuf,
    pub base_data_directory: PathBuf,
    pub cookie_accept_policy: CookieAcceptPolicy,
    pub cookie_storage: CookieStorage,
    pub cookie_file: PathBuf,
}

impl WebViewProfile {
    pub fn new(dirs: &AppDirs) -> Self {
        let base_data_directory = dirs.config.join("webview");
        Self {
            base_cache_directory: dirs.cache.join("webview"),
            cookie_file: base_data_directory.join("cookies.db"),
            base_data_directory,
            cookie_accept_policy: CookieAcceptPolicy::NoThirdParty,
            cookie_storage: CookieStorage::Sqlite,
        }
    }

    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.base_cache_directory)?;
        fs::create_dir_all(&self.base_data_directory)?;
        info!(
            cache = %self.base_cache_directory.display(),
            data = %self.base_data_directory.display(),
            cookies = %self.cookie_file.display(),
            "web view profile ready"
        );
        Ok(())
    }
}
