//! Single-flight application controller.
//!
//! The controller owns at most one service handle and at most one window.
//! Activation either presents the existing window, opens a new one on the
//! existing handle, or starts the one and only connection attempt. Requests
//! arriving while that attempt is in flight are dropped.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use almond_core::PrefValue;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{ConnectFuture, ConnectionError, ServiceConnector, ServiceEndpoint, ServiceHandle},
    preference::{PreferenceAction, PreferenceSpec},
};

pub const QUIT_ACTION: &str = "quit";

/// A presentation surface bound to a connected service.
pub trait Window {
    fn present(&mut self);

    fn close(&mut self) {}

    fn action_finished(&mut self, _name: &str, _outcome: &Result<PrefValue, String>) {}
}

pub trait WindowFactory {
    fn create(&mut self, service: ServiceHandle, actions: &ActionMap) -> Box<dyn Window>;
}

#[derive(Debug, Clone)]
pub enum Action {
    Quit,
    Preference(Arc<PreferenceAction>),
}

#[derive(Debug, Clone, Default)]
pub struct ActionMap {
    actions: BTreeMap<String, Action>,
}

impl ActionMap {
    pub fn insert(&mut self, name: impl Into<String>, action: Action) {
        self.actions.insert(name.into(), action);
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn preferences(&self) -> impl Iterator<Item = &Arc<PreferenceAction>> {
        self.actions.values().filter_map(|action| match action {
            Action::Preference(preference) => Some(preference),
            Action::Quit => None,
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Reference count keeping the process alive while no window is open.
#[derive(Debug, Clone, Default)]
pub struct ProcessLifetime {
    holds: Arc<AtomicUsize>,
}

impl ProcessLifetime {
    pub fn hold(&self) -> LifetimeHold {
        self.holds.fetch_add(1, Ordering::SeqCst);
        LifetimeHold {
            holds: Arc::clone(&self.holds),
        }
    }

    pub fn holds(&self) -> usize {
        self.holds.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.holds() > 0
    }
}

/// Released when dropped.
#[derive(Debug)]
pub struct LifetimeHold {
    holds: Arc<AtomicUsize>,
}

impl Drop for LifetimeHold {
    fn drop(&mut self) {
        self.holds.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    NoWindowNoService,
    Connecting,
    NoWindowHasService,
    WindowShown,
}

pub enum ActivateOutcome {
    /// The open window was presented again.
    Presented,
    /// A connection attempt started; its result must be handed back through
    /// [`AppController::complete_connection`].
    Connecting(ConnectFuture),
    /// An attempt is already in flight and this request was dropped.
    Coalesced,
    /// A new window was opened on the existing service handle.
    WindowOpened,
}

impl fmt::Debug for ActivateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivateOutcome::Presented => f.write_str("Presented"),
            ActivateOutcome::Connecting(_) => f.write_str("Connecting(..)"),
            ActivateOutcome::Coalesced => f.write_str("Coalesced"),
            ActivateOutcome::WindowOpened => f.write_str("WindowOpened"),
        }
    }
}

pub struct AppController {
    connector: Arc<dyn ServiceConnector>,
    endpoint: ServiceEndpoint,
    windows: Box<dyn WindowFactory>,
    preferences: Vec<PreferenceSpec>,
    lifetime: ProcessLifetime,
    actions: ActionMap,
    service: Option<ServiceHandle>,
    activating: bool,
    connect_hold: Option<LifetimeHold>,
    window: Option<Box<dyn Window>>,
}

impl AppController {
    pub fn new(
        connector: Arc<dyn ServiceConnector>,
        endpoint: ServiceEndpoint,
        windows: Box<dyn WindowFactory>,
        preferences: Vec<PreferenceSpec>,
        lifetime: ProcessLifetime,
    ) -> Self {
        Self {
            connector,
            endpoint,
            windows,
            preferences,
            lifetime,
            actions: ActionMap::default(),
            service: None,
            activating: false,
            connect_hold: None,
            window: None,
        }
    }

    /// Registers the application-wide actions.
    pub fn startup(&mut self) {
        self.actions.insert(QUIT_ACTION, Action::Quit);
    }

    pub fn state(&self) -> ActivationState {
        if self.window.is_some() {
            ActivationState::WindowShown
        } else if self.activating {
            ActivationState::Connecting
        } else if self.service.is_some() {
            ActivationState::NoWindowHasService
        } else {
            ActivationState::NoWindowNoService
        }
    }

    pub fn activate(&mut self) -> ActivateOutcome {
        if let Some(window) = self.window.as_mut() {
            window.present();
            return ActivateOutcome::Presented;
        }

        if let Some(service) = self.service.clone() {
            self.open_window(service);
            return ActivateOutcome::WindowOpened;
        }

        if self.activating {
            debug!("activation already in progress, dropping request");
            return ActivateOutcome::Coalesced;
        }

        self.activating = true;
        self.connect_hold = Some(self.lifetime.hold());
        info!(
            service_name = %self.endpoint.service_name,
            address = %self.endpoint.address,
            "connecting to background service"
        );
        ActivateOutcome::Connecting(self.connector.connect(self.endpoint.clone()))
    }

    /// Applies the single result of the connection attempt started by
    /// [`AppController::activate`].
    pub fn complete_connection(
        &mut self,
        result: Result<ServiceHandle, ConnectionError>,
    ) -> Result<(), ConnectionError> {
        if !self.activating {
            warn!("connection result without an attempt in flight, ignoring");
            return Ok(());
        }

        drop(self.connect_hold.take());
        self.activating = false;

        let service = match result {
            Ok(service) => service,
            Err(err) => {
                error!("failed to connect to background service: {}", err);
                return Err(err);
            }
        };

        self.service = Some(Arc::clone(&service));
        for spec in &self.preferences {
            let action = PreferenceAction::new(Arc::clone(&service), spec.clone());
            self.actions
                .insert(spec.key.clone(), Action::Preference(Arc::new(action)));
        }
        info!(actions = self.actions.len(), "background service connected");

        self.open_window(service);
        Ok(())
    }

    /// The user closed the window.
    pub fn window_closed(&mut self) {
        if self.window.take().is_some() {
            debug!("window closed");
        }
    }

    /// Closes the window, if any, ahead of exit.
    pub fn shutdown(&mut self) {
        if let Some(mut window) = self.window.take() {
            window.close();
        }
    }

    pub fn action_finished(&mut self, name: &str, outcome: &Result<PrefValue, String>) {
        if let Some(window) = self.window.as_mut() {
            window.action_finished(name, outcome);
        }
    }

    /// True when nothing keeps the application running: no window, no
    /// attempt in flight and no outstanding lifetime hold.
    pub fn should_exit(&self) -> bool {
        self.window.is_none() && !self.activating && !self.lifetime.is_held()
    }

    pub fn service(&self) -> Option<&ServiceHandle> {
        self.service.as_ref()
    }

    pub fn actions(&self) -> &ActionMap {
        &self.actions
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn is_activating(&self) -> bool {
        self.activating
    }

    pub fn has_window(&self) -> bool {
        self.window.is_some()
    }

    pub fn lifetime(&self) -> &ProcessLifetime {
        &self.lifetime
    }

    fn open_window(&mut self, service: ServiceHandle) {
        let mut window = self.windows.create(service, &self.actions);
        window.present();
        self.window = Some(window);
    }
}
