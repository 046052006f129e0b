pub mod adb;
pub mod api;
pub mod automation;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod models;
pub mod package;
pub mod scheduler;
pub mod state;
pub mod steps;
pub mod store;
pub mod ui_capture;

#[cfg(test)]
pub(crate) mod testing;
