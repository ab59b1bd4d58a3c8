//! IPC module for controlling the assistant and observing its state

pub mod protocol;
mod server;

pub use server::Server;
