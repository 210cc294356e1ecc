pub mod app;
pub mod bus;
pub mod config;
pub mod console;
pub mod controller;
pub mod event_loop;
pub mod instance;
pub mod logging;
pub mod preference;
pub mod supervisor;
pub mod webview;
