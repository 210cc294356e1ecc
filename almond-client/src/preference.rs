//! Remote preferences exposed as local, invokable actions.

use std::fmt;

use almond_core::{
    CoreError, PREF_ENABLE_VOICE_INPUT, PREF_ENABLE_VOICE_OUTPUT, PREF_STORE_LOG, PrefValue,
    PreferenceCodec, ValueType,
};
use thiserror::Error;

use crate::bus::{PreferenceChange, ServiceError, ServiceHandle};

/// One configured preference: its key, the type the local action exposes,
/// and how that value maps onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferenceSpec {
    pub key: String,
    pub value_type: ValueType,
    pub codec: PreferenceCodec,
}

impl PreferenceSpec {
    pub fn new(key: impl Into<String>, value_type: ValueType) -> Self {
        Self::with_codec(key, value_type, PreferenceCodec::Identity)
    }

    pub fn with_codec(key: impl Into<String>, value_type: ValueType, codec: PreferenceCodec) -> Self {
        Self {
            key: key.into(),
            value_type,
            codec,
        }
    }

    pub fn wire_type(&self) -> ValueType {
        self.codec.wire_type(self.value_type)
    }
}

/// The preferences the shell binds once the service is reachable.
pub fn default_preferences() -> Vec<PreferenceSpec> {
    vec![
        PreferenceSpec::new(PREF_ENABLE_VOICE_INPUT, ValueType::Bool),
        PreferenceSpec::new(PREF_ENABLE_VOICE_OUTPUT, ValueType::Bool),
        // Stored by the service as the strings "yes"/"no".
        PreferenceSpec::with_codec(PREF_STORE_LOG, ValueType::Bool, PreferenceCodec::BoolYesNo),
    ]
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Value(#[from] CoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("action {0} needs a value")]
    ParameterRequired(String),
    #[error("no action named {0:?}")]
    UnknownAction(String),
}

/// A stateful action bound for life to one service handle and one key.
///
/// Reads always go to the service; nothing is cached locally.
pub struct PreferenceAction {
    spec: PreferenceSpec,
    service: ServiceHandle,
}

impl fmt::Debug for PreferenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreferenceAction")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl PreferenceAction {
    pub fn new(service: ServiceHandle, spec: PreferenceSpec) -> Self {
        Self { spec, service }
    }

    pub fn name(&self) -> &str {
        &self.spec.key
    }

    pub fn spec(&self) -> &PreferenceSpec {
        &self.spec
    }

    pub fn value_type(&self) -> ValueType {
        self.spec.value_type
    }

    /// Fetches the current value from the service and decodes it.
    pub async fn state(&self) -> Result<PrefValue, ActionError> {
        let wire = self.service.get_preference(&self.spec.key).await?;
        self.decode(wire)
    }

    /// Encodes `value` and writes it to the service.
    pub async fn change_state(&self, value: PrefValue) -> Result<(), ActionError> {
        check_type(self.spec.value_type, &value)?;
        let wire = self.spec.codec.encode(value)?;
        self.service.set_preference(&self.spec.key, wire).await?;
        Ok(())
    }

    /// Activates the action. A boolean action without a parameter toggles;
    /// otherwise the parameter is parsed as the action's type and applied.
    pub async fn activate(&self, parameter: Option<&str>) -> Result<PrefValue, ActionError> {
        let next = match (parameter, self.spec.value_type) {
            (Some(text), value_type) => value_type.parse(text)?,
            (None, ValueType::Bool) => {
                let current = self.state().await?;
                PrefValue::Bool(!current.as_bool().unwrap_or(false))
            }
            (None, ValueType::String) => {
                return Err(ActionError::ParameterRequired(self.spec.key.clone()));
            }
        };
        self.change_state(next.clone()).await?;
        Ok(next)
    }

    /// Decodes a change signal if it concerns this action's key.
    pub fn decode_change(&self, change: &PreferenceChange) -> Option<Result<PrefValue, ActionError>> {
        (change.key == self.spec.key).then(|| self.decode(change.value.clone()))
    }

    fn decode(&self, wire: PrefValue) -> Result<PrefValue, ActionError> {
        let value = self.spec.codec.decode(wire)?;
        check_type(self.spec.value_type, &value)?;
        Ok(value)
    }
}

fn check_type(expected: ValueType, value: &PrefValue) -> Result<(), CoreError> {
    let found = value.value_type();
    if found == expected {
        Ok(())
    } else {
        Err(CoreError::TypeMismatch { expected, found })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    use almond_core::PrefValue;
    use futures::{FutureExt, future::BoxFuture};
    use tokio::sync::broadcast;

    use crate::bus::{PreferenceChange, RemoteService, ServiceError};

    /// In-memory stand-in for the service, recording every write.
    pub(crate) struct MemoryService {
        pub(crate) values: Mutex<BTreeMap<String, PrefValue>>,
        pub(crate) writes: Mutex<Vec<(String, PrefValue)>>,
        changes: broadcast::Sender<PreferenceChange>,
    }

    impl MemoryService {
        pub(crate) fn with_defaults() -> Arc<Self> {
            let values = BTreeMap::from([
                ("enable-voice-input".to_owned(), PrefValue::Bool(false)),
                ("enable-voice-output".to_owned(), PrefValue::Bool(true)),
                (
                    "sabrina-store-log".to_owned(),
                    PrefValue::String("no".to_owned()),
                ),
            ]);
            Arc::new(Self {
                values: Mutex::new(values),
                writes: Mutex::new(Vec::new()),
                changes: broadcast::channel(8).0,
            })
        }
    }

    impl RemoteService for MemoryService {
        fn get_preference(&self, key: &str) -> BoxFuture<'_, Result<PrefValue, ServiceError>> {
            let value = self.values.lock().unwrap().get(key).cloned();
            async move { value.ok_or_else(|| ServiceError::Remote("no such preference".to_owned())) }
                .boxed()
        }

        fn set_preference(
            &self,
            key: &str,
            value: PrefValue,
        ) -> BoxFuture<'_, Result<(), ServiceError>> {
            self.writes
                .lock()
                .unwrap()
                .push((key.to_owned(), value.clone()));
            self.values.lock().unwrap().insert(key.to_owned(), value);
            async { Ok(()) }.boxed()
        }

        fn list_preferences(
            &self,
        ) -> BoxFuture<'_, Result<BTreeMap<String, PrefValue>, ServiceError>> {
            let values = self.values.lock().unwrap().clone();
            async move { Ok(values) }.boxed()
        }

        fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
            self.changes.subscribe()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryService;
    use super::*;

    fn action(service: &std::sync::Arc<MemoryService>, key: &str) -> PreferenceAction {
        let spec = default_preferences()
            .into_iter()
            .find(|spec| spec.key == key)
            .expect("configured key");
        PreferenceAction::new(service.clone(), spec)
    }

    #[test]
    fn configured_preferences_cover_every_key_once() {
        let specs = default_preferences();
        let keys: Vec<&str> = specs.iter().map(|spec| spec.key.as_str()).collect();
        assert_eq!(
            keys,
            [PREF_ENABLE_VOICE_INPUT, PREF_ENABLE_VOICE_OUTPUT, PREF_STORE_LOG]
        );
        assert!(specs.iter().all(|spec| spec.value_type == ValueType::Bool));
        assert_eq!(specs[2].wire_type(), ValueType::String);
        assert_eq!(specs[0].wire_type(), ValueType::Bool);
    }

    #[tokio::test]
    async fn store_log_is_decoded_and_encoded_as_yes_no() {
        let service = MemoryService::with_defaults();
        let store_log = action(&service, PREF_STORE_LOG);

        assert_eq!(store_log.state().await.unwrap(), PrefValue::Bool(false));

        store_log.change_state(PrefValue::Bool(true)).await.unwrap();
        assert_eq!(
            service.writes.lock().unwrap().last(),
            Some(&(PREF_STORE_LOG.to_owned(), PrefValue::String("yes".to_owned())))
        );
        assert_eq!(store_log.state().await.unwrap(), PrefValue::Bool(true));
    }

    #[tokio::test]
    async fn identity_keys_pass_values_through() {
        let service = MemoryService::with_defaults();
        let voice_output = action(&service, PREF_ENABLE_VOICE_OUTPUT);

        voice_output.change_state(PrefValue::Bool(false)).await.unwrap();
        assert_eq!(
            service.writes.lock().unwrap().as_slice(),
            [(PREF_ENABLE_VOICE_OUTPUT.to_owned(), PrefValue::Bool(false))]
        );
    }

    #[tokio::test]
    async fn activate_without_parameter_toggles() {
        let service = MemoryService::with_defaults();
        let voice_input = action(&service, PREF_ENABLE_VOICE_INPUT);

        assert_eq!(voice_input.activate(None).await.unwrap(), PrefValue::Bool(true));
        assert_eq!(voice_input.activate(None).await.unwrap(), PrefValue::Bool(false));
        assert_eq!(
            voice_input.activate(Some("on")).await.unwrap(),
            PrefValue::Bool(true)
        );
    }

    #[tokio::test]
    async fn wrong_local_type_is_rejected_before_any_write() {
        let service = MemoryService::with_defaults();
        let store_log = action(&service, PREF_STORE_LOG);

        let err = store_log
            .change_state(PrefValue::String("yes".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Value(CoreError::TypeMismatch { .. })));
        assert!(service.writes.lock().unwrap().is_empty());

        let err = store_log.activate(Some("maybe")).await.unwrap_err();
        assert!(matches!(err, ActionError::Value(CoreError::InvalidValue { .. })));
    }

    #[test]
    fn change_signals_are_decoded_only_for_own_key() {
        let service = MemoryService::with_defaults();
        let store_log = action(&service, PREF_STORE_LOG);

        let own = PreferenceChange {
            key: PREF_STORE_LOG.to_owned(),
            value: PrefValue::String("yes".to_owned()),
        };
        let other = PreferenceChange {
            key: PREF_ENABLE_VOICE_INPUT.to_owned(),
            value: PrefValue::Bool(true),
        };
        assert_eq!(
            store_log.decode_change(&own).map(Result::unwrap),
            Some(PrefValue::Bool(true))
        );
        assert!(store_log.decode_change(&other).is_none());
    }
}
