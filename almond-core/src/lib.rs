use std::{collections::BTreeMap, fmt};

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const APPLICATION_ID: &str = "edu.stanford.Almond";
pub const APPLICATION_NAME: &str = "Almond";
pub const SERVICE_NAME: &str = "edu.stanford.Almond.BackgroundService";
pub const OBJECT_PATH: &str = "/edu/stanford/Almond/BackgroundService";
pub const DEFAULT_BUS_ADDRESS: &str = "ws://127.0.0.1:3232/bus";
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3232";

pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_BUS_MESSAGE_BYTES: usize = 64 * 1024;
pub const MAX_SERVICE_NAME_LEN: usize = 255;
pub const MAX_PREFERENCE_KEY_LEN: usize = 128;

pub const PREF_ENABLE_VOICE_INPUT: &str = "enable-voice-input";
pub const PREF_ENABLE_VOICE_OUTPUT: &str = "enable-voice-output";
pub const PREF_STORE_LOG: &str = "sabrina-store-log";

pub type Serial = u64;

/// A preference value as carried on the bus.
///
/// Serialized with the one-letter type signature as the tag, so `true`
/// travels as `{"b":true}` and `"yes"` as `{"s":"yes"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrefValue {
    #[serde(rename = "b")]
    Bool(bool),
    #[serde(rename = "s")]
    String(String),
}

impl PrefValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            PrefValue::Bool(_) => ValueType::Bool,
            PrefValue::String(_) => ValueType::String,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrefValue::Bool(value) => Some(*value),
            PrefValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrefValue::String(value) => Some(value),
            PrefValue::Bool(_) => None,
        }
    }
}

impl fmt::Display for PrefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefValue::Bool(value) => write!(f, "{value}"),
            PrefValue::String(value) => write!(f, "{value:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    String,
}

impl ValueType {
    pub fn signature(self) -> char {
        match self {
            ValueType::Bool => 'b',
            ValueType::String => 's',
        }
    }

    /// Parses user-supplied text into a value of this type.
    pub fn parse(self, text: &str) -> Result<PrefValue, CoreError> {
        match self {
            ValueType::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Ok(PrefValue::Bool(true)),
                "false" | "off" | "0" => Ok(PrefValue::Bool(false)),
                _ => Err(CoreError::InvalidValue {
                    expected: self,
                    text: text.to_owned(),
                }),
            },
            ValueType::String => Ok(PrefValue::String(text.to_owned())),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signature())
    }
}

/// Translation between the wire representation of a preference and the
/// value its local action exposes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PreferenceCodec {
    #[default]
    Identity,
    /// Wire string `"yes"` is `true`, any other string is `false`.
    BoolYesNo,
}

impl PreferenceCodec {
    pub fn wire_type(self, local: ValueType) -> ValueType {
        match self {
            PreferenceCodec::Identity => local,
            PreferenceCodec::BoolYesNo => ValueType::String,
        }
    }

    pub fn decode(self, wire: PrefValue) -> Result<PrefValue, CoreError> {
        match self {
            PreferenceCodec::Identity => Ok(wire),
            PreferenceCodec::BoolYesNo => match wire {
                PrefValue::String(text) => Ok(PrefValue::Bool(text == "yes")),
                other => Err(CoreError::TypeMismatch {
                    expected: ValueType::String,
                    found: other.value_type(),
                }),
            },
        }
    }

    pub fn encode(self, local: PrefValue) -> Result<PrefValue, CoreError> {
        match self {
            PreferenceCodec::Identity => Ok(local),
            PreferenceCodec::BoolYesNo => match local {
                PrefValue::Bool(value) => Ok(PrefValue::String(
                    if value { "yes" } else { "no" }.to_owned(),
                )),
                other => Err(CoreError::TypeMismatch {
                    expected: ValueType::Bool,
                    found: other.value_type(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub service_name: String,
    pub object_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    pub service_name: String,
    pub object_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", content = "args")]
pub enum Method {
    GetPreference { key: String },
    SetPreference { key: String, value: PrefValue },
    ListPreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodCall {
    pub serial: Serial,
    pub method: Method,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallResult {
    Value(PrefValue),
    Values(BTreeMap<String, PrefValue>),
    Done,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodReturn {
    pub reply_serial: Serial,
    pub result: CallResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "signal", content = "args")]
pub enum Signal {
    PreferenceChanged { key: String, value: PrefValue },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum BusMessage {
    Hello(Hello),
    Welcome(Welcome),
    Call(MethodCall),
    Return(MethodReturn),
    Signal(Signal),
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),
    #[error("invalid object path {0:?}")]
    InvalidObjectPath(String),
    #[error("invalid preference key {0:?}")]
    InvalidPreferenceKey(String),
    #[error("expected a value of type {expected}, found {found}")]
    TypeMismatch { expected: ValueType, found: ValueType },
    #[error("{text:?} is not a valid value of type {expected}")]
    InvalidValue { expected: ValueType, text: String },
}

pub fn encode_frame(message: &BusMessage) -> Result<Vec<u8>, CoreError> {
    let payload =
        serde_json::to_vec(message).map_err(|err| CoreError::Serialization(err.to_string()))?;

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    if frame_len + 4 > MAX_BUS_MESSAGE_BYTES {
        return Err(CoreError::FrameTooLarge {
            max: MAX_BUS_MESSAGE_BYTES,
        });
    }
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(PROTOCOL_VERSION);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<BusMessage, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }
    if frame.len() > MAX_BUS_MESSAGE_BYTES {
        return Err(CoreError::FrameTooLarge {
            max: MAX_BUS_MESSAGE_BYTES,
        });
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let version = cursor.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(CoreError::UnsupportedVersion(version));
    }

    serde_json::from_slice(cursor).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Checks a reverse-DNS service name such as `edu.stanford.Almond.BackgroundService`.
pub fn validate_service_name(name: &str) -> Result<(), CoreError> {
    let invalid = || CoreError::InvalidServiceName(name.to_owned());
    if name.is_empty() || name.len() > MAX_SERVICE_NAME_LEN {
        return Err(invalid());
    }

    let elements = name.split('.').collect::<Vec<_>>();
    if elements.len() < 2 {
        return Err(invalid());
    }

    for element in elements {
        let mut chars = element.chars();
        let Some(first) = chars.next() else {
            return Err(invalid());
        };
        if first.is_ascii_digit() {
            return Err(invalid());
        }
        if !element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

pub fn validate_object_path(path: &str) -> Result<(), CoreError> {
    if path == "/" {
        return Ok(());
    }

    let invalid = || CoreError::InvalidObjectPath(path.to_owned());
    let Some(rest) = path.strip_prefix('/') else {
        return Err(invalid());
    };
    if rest.ends_with('/') {
        return Err(invalid());
    }

    for element in rest.split('/') {
        if element.is_empty() || !element.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Preference keys are lowercase words joined by dashes, e.g. `enable-voice-input`.
pub fn validate_preference_key(key: &str) -> Result<(), CoreError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_PREFERENCE_KEY_LEN
        && key.starts_with(|c: char| c.is_ascii_lowercase())
        && !key.ends_with('-')
        && !key.contains("--")
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidPreferenceKey(key.to_owned()))
    }
}
