use almond_core::PrefValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    bus::{ConnectionError, ServiceHandle},
    controller::{Action, ActivateOutcome, AppController},
};

pub enum AppEvent {
    Activate,
    ServiceConnected(Result<ServiceHandle, ConnectionError>),
    WindowClosed,
    InvokeAction {
        name: String,
        parameter: Option<String>,
    },
    ActionFinished {
        name: String,
        outcome: Result<PrefValue, String>,
    },
    Quit,
}

impl std::fmt::Debug for AppEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppEvent::Activate => f.write_str("Activate"),
            AppEvent::ServiceConnected(Ok(_)) => f.write_str("ServiceConnected(Ok(..))"),
            AppEvent::ServiceConnected(Err(err)) => write!(f, "ServiceConnected(Err({err:?}))"),
            AppEvent::WindowClosed => f.write_str("WindowClosed"),
            AppEvent::InvokeAction { name, parameter } => f
                .debug_struct("InvokeAction")
                .field("name", name)
                .field("parameter", parameter)
                .finish(),
            AppEvent::ActionFinished { name, outcome } => f
                .debug_struct("ActionFinished")
                .field("name", name)
                .field("outcome", outcome)
                .finish(),
            AppEvent::Quit => f.write_str("Quit"),
        }
    }
}

/// Drives `controller` until the application quits, nothing keeps it alive,
/// or the connection attempt fails.
pub async fn run(
    controller: &mut AppController,
    events_tx: &mpsc::UnboundedSender<AppEvent>,
    events_rx: &mut mpsc::UnboundedReceiver<AppEvent>,
) -> Result<(), ConnectionError> {
    while let Some(event) = events_rx.recv().await {
        debug!(?event, "app event");
        match event {
            AppEvent::Activate => {
                if let ActivateOutcome::Connecting(attempt) = controller.activate() {
                    let tx = events_tx.clone();
                    tokio::spawn(async move {
                        let result = attempt.await;
                        let _ = tx.send(AppEvent::ServiceConnected(result));
                    });
                }
            }
            AppEvent::ServiceConnected(result) => {
                if let Err(err) = controller.complete_connection(result) {
                    controller.shutdown();
                    return Err(err);
                }
            }
            AppEvent::WindowClosed => controller.window_closed(),
            AppEvent::InvokeAction { name, parameter } => match controller.action(&name).cloned() {
                Some(Action::Quit) => {
                    info!("quit requested");
                    break;
                }
                Some(Action::Preference(action)) => {
                    let tx = events_tx.clone();
                    tokio::spawn(async move {
                        let outcome = action
                            .activate(parameter.as_deref())
                            .await
                            .map_err(|err| err.to_string());
                        let _ = tx.send(AppEvent::ActionFinished { name, outcome });
                    });
                }
                None => warn!(action = %name, "no such action"),
            },
            AppEvent::ActionFinished { name, outcome } => {
                match &outcome {
                    Ok(value) => info!(action = %name, value = %value, "action applied"),
                    Err(err) => warn!(action = %name, "action failed: {}", err),
                }
                controller.action_finished(&name, &outcome);
            }
            AppEvent::Quit => {
                info!("quit requested");
                break;
            }
        }

        if controller.should_exit() {
            info!("no window and nothing holding the application, exiting");
            break;
        }
    }

    controller.shutdown();
    Ok(())
}
