//! Text console presentation surface.
//!
//! Stands in for the main window: presenting prints the current preference
//! values, change signals are echoed while the window is open, and stdin
//! lines are turned into application events.

use std::{io::BufRead, sync::Arc, thread};

use almond_core::{APPLICATION_NAME, PrefValue};
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    bus::{PreferenceChange, ServiceHandle},
    controller::{ActionMap, QUIT_ACTION, Window, WindowFactory},
    event_loop::AppEvent,
    preference::PreferenceAction,
    webview::WebViewProfile,
};

const HELP: &str = "commands: activate | close | quit | toggle <action> | set <action> <value> | help";

pub struct ConsoleWindowFactory {
    profile: WebViewProfile,
}

impl ConsoleWindowFactory {
    pub fn new(profile: WebViewProfile) -> Self {
        Self { profile }
    }
}

impl WindowFactory for ConsoleWindowFactory {
    fn create(&mut self, service: ServiceHandle, actions: &ActionMap) -> Box<dyn Window> {
        Box::new(ConsoleWindow {
            service,
            preferences: actions.preferences().cloned().collect(),
            data_directory: self.profile.base_data_directory.display().to_string(),
            watcher: None,
        })
    }
}

pub struct ConsoleWindow {
    service: ServiceHandle,
    preferences: Vec<Arc<PreferenceAction>>,
    data_directory: String,
    watcher: Option<JoinHandle<()>>,
}

impl Window for ConsoleWindow {
    fn present(&mut self) {
        println!("== {APPLICATION_NAME} ==  (profile: {})", self.data_directory);
        println!("{HELP}");

        let Ok(runtime) = Handle::try_current() else {
            debug!("no runtime, skipping preference refresh");
            return;
        };

        let preferences = self.preferences.clone();
        runtime.spawn(async move {
            for action in preferences {
                match action.state().await {
                    Ok(value) => println!("  {} = {}", action.name(), value),
                    Err(err) => println!("  {} unavailable: {}", action.name(), err),
                }
            }
        });

        if self.watcher.is_none() {
            let changes = self.service.subscribe();
            let preferences = self.preferences.clone();
            self.watcher = Some(runtime.spawn(echo_changes(changes, preferences)));
        }
    }

    fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        println!("{APPLICATION_NAME} closed");
    }

    fn action_finished(&mut self, name: &str, outcome: &Result<PrefValue, String>) {
        match outcome {
            Ok(value) => println!("  {name} = {value}"),
            Err(err) => println!("  {name} failed: {err}"),
        }
    }
}

impl Drop for ConsoleWindow {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

async fn echo_changes(
    mut changes: broadcast::Receiver<PreferenceChange>,
    preferences: Vec<Arc<PreferenceAction>>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed preference changes");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        for action in &preferences {
            match action.decode_change(&change) {
                Some(Ok(value)) => println!("  {} changed to {}", action.name(), value),
                Some(Err(err)) => warn!(key = %change.key, "undecodable change: {}", err),
                None => {}
            }
        }
    }
}

#[derive(Debug)]
pub enum ConsoleCommand {
    Event(AppEvent),
    Help,
    Nothing,
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(ConsoleCommand::Nothing);
    };

    let event = match command {
        "activate" | "show" => AppEvent::Activate,
        "close" => AppEvent::WindowClosed,
        "quit" => AppEvent::InvokeAction {
            name: QUIT_ACTION.to_owned(),
            parameter: None,
        },
        "toggle" => {
            let name = words.next().ok_or("usage: toggle <action>")?;
            AppEvent::InvokeAction {
                name: name.to_owned(),
                parameter: None,
            }
        }
        "set" => {
            let name = words.next().ok_or("usage: set <action> <value>")?;
            let value = words.collect::<Vec<_>>().join(" ");
            if value.is_empty() {
                return Err("usage: set <action> <value>".to_owned());
            }
            AppEvent::InvokeAction {
                name: name.to_owned(),
                parameter: Some(value),
            }
        }
        "help" | "?" => return Ok(ConsoleCommand::Help),
        other => return Err(format!("unknown command {other:?}; {HELP}")),
    };
    Ok(ConsoleCommand::Event(event))
}

/// Reads commands from stdin on a dedicated thread until EOF or until the
/// event loop goes away.
pub fn spawn_stdin_reader(events: mpsc::UnboundedSender<AppEvent>) {
    let spawned = thread::Builder::new()
        .name("almond-stdin".to_owned())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                match parse_command(&line) {
                    Ok(ConsoleCommand::Event(event)) => {
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(ConsoleCommand::Help) => println!("{HELP}"),
                    Ok(ConsoleCommand::Nothing) => {}
                    Err(message) => println!("{message}"),
                }
            }
            debug!("stdin closed");
        });
    if let Err(err) = spawned {
        warn!("failed to start console reader: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> AppEvent {
        match parse_command(line) {
            Ok(ConsoleCommand::Event(event)) => event,
            other => panic!("expected an event for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn window_commands() {
        assert!(matches!(event("activate"), AppEvent::Activate));
        assert!(matches!(event("  show "), AppEvent::Activate));
        assert!(matches!(event("close"), AppEvent::WindowClosed));
        assert!(matches!(
            event("quit"),
            AppEvent::InvokeAction { name, parameter: None } if name == QUIT_ACTION
        ));
    }

    #[test]
    fn action_commands() {
        assert!(matches!(
            event("toggle enable-voice-input"),
            AppEvent::InvokeAction { name, parameter: None } if name == "enable-voice-input"
        ));
        assert!(matches!(
            event("set sabrina-store-log on"),
            AppEvent::InvokeAction { name, parameter: Some(value) }
                if name == "sabrina-store-log" && value == "on"
        ));
    }

    #[test]
    fn malformed_commands_are_errors() {
        assert!(parse_command("toggle").is_err());
        assert!(parse_command("set enable-voice-input").is_err());
        assert!(parse_command("dance").unwrap_err().contains("dance"));
        assert!(matches!(parse_command("   "), Ok(ConsoleCommand::Nothing)));
        assert!(matches!(parse_command("help"), Ok(ConsoleCommand::Help)));
    }
}
