use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use almond_core::{
    PREF_ENABLE_VOICE_INPUT, PREF_ENABLE_VOICE_OUTPUT, PREF_STORE_LOG, PrefValue, ValueType,
};
use thiserror::Error;
use tracing::{info, warn};

/// The state file only ever holds a handful of preferences.
pub const MAX_STATE_FILE_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such preference {0:?}")]
    UnknownKey(String),
    #[error("preference {key:?} has type {expected}, got {found}")]
    TypeMismatch {
        key: String,
        expected: ValueType,
        found: ValueType,
    },
    #[error("state file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },
    #[error("state file read failed: {0}")]
    Read(#[source] io::Error),
    #[error("state file parse failed: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("state file serialize failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("state file write failed: {0}")]
    Write(#[source] io::Error),
}

pub fn default_preferences() -> BTreeMap<String, PrefValue> {
    BTreeMap::from([
        (PREF_ENABLE_VOICE_INPUT.to_owned(), PrefValue::Bool(false)),
        (PREF_ENABLE_VOICE_OUTPUT.to_owned(), PrefValue::Bool(true)),
        (PREF_STORE_LOG.to_owned(), PrefValue::String("no".to_owned())),
    ])
}

/// Preference values owned by the service.
///
/// The key set and each key's type are fixed by [`default_preferences`];
/// writes may only change values.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    values: BTreeMap<String, PrefValue>,
    path: Option<PathBuf>,
}

impl PreferenceStore {
    pub fn in_memory() -> Self {
        Self {
            values: default_preferences(),
            path: None,
        }
    }

    /// Opens a store persisted at `path`, starting from defaults when the
    /// file does not exist yet.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut values = default_preferences();
        if path.exists() {
            let stored = load_state_file(&path)?;
            for (key, value) in stored {
                match values.get_mut(&key) {
                    Some(slot) if slot.value_type() == value.value_type() => *slot = value,
                    Some(slot) => warn!(
                        key = %key,
                        expected = %slot.value_type(),
                        found = %value.value_type(),
                        "ignoring stored preference with wrong type"
                    ),
                    None => warn!(key = %key, "ignoring unknown stored preference"),
                }
            }
            info!(path = %path.display(), "loaded preferences");
        }

        Ok(Self {
            values,
            path: Some(path),
        })
    }

    pub fn get(&self, key: &str) -> Result<PrefValue, StoreError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::UnknownKey(key.to_owned()))
    }

    /// Stores `value` under `key` and returns whether the value changed.
    pub fn set(&mut self, key: &str, value: PrefValue) -> Result<bool, StoreError> {
        let current = self
            .values
            .get(key)
            .ok_or_else(|| StoreError::UnknownKey(key.to_owned()))?;
        if current.value_type() != value.value_type() {
            return Err(StoreError::TypeMismatch {
                key: key.to_owned(),
                expected: current.value_type(),
                found: value.value_type(),
            });
        }
        if *current == value {
            return Ok(false);
        }

        let mut next = self.values.clone();
        next.insert(key.to_owned(), value);
        if let Some(path) = &self.path {
            save_state_file(path, &next)?;
        }
        self.values = next;
        Ok(true)
    }

    pub fn snapshot(&self) -> BTreeMap<String, PrefValue> {
        self.values.clone()
    }
}

fn load_state_file(path: &Path) -> Result<BTreeMap<String, PrefValue>, StoreError> {
    let meta = fs::metadata(path).map_err(StoreError::Read)?;
    if meta.len() > MAX_STATE_FILE_BYTES {
        return Err(StoreError::TooLarge {
            size: meta.len(),
            max: MAX_STATE_FILE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(StoreError::Read)?;
    serde_json::from_str(&data).map_err(StoreError::Parse)
}

fn save_state_file(path: &Path, values: &BTreeMap<String, PrefValue>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(StoreError::Write)?;
    }

    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(values).map_err(StoreError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(StoreError::Write)?;

    if path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).map_err(StoreError::Write)?;
    Ok(())
}
