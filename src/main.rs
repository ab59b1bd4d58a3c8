//! yohi-daemon: Background daemon for the Yo-Hi hands-free voice assistant
//!
//! The daemon listens continuously for the wake word ("yo"), captures one
//! spoken question, asks a remote language model for an answer, speaks it
//! and goes back to listening. It provides:
//! - An explicit state machine owning capture, speech and turn-taking
//! - Console-backed speech capture and program-backed speech output
//! - An OpenAI-compatible answer client (OpenRouter by default)
//! - IPC server for status queries, start/stop and state notifications

mod answer;
mod capture;
mod config;
mod events;
mod ipc;
mod lifecycle;
mod permission;
mod speech;
mod state;
mod wake;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::answer::OpenRouterClient;
use crate::capture::ConsoleCapture;
use crate::config::Config;
use crate::events::StateEvent;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::permission::PermissionGate;
use crate::speech::{CommandSink, ConsoleSink, SpeechCoordinator, SpeechSink};
use crate::state::{Input, Machine, Runtime};
use crate::wake::WakeMatcher;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "yohi-daemon starting");

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, ?config.answer, "configuration loaded");

    if config.answer.api_key.is_none() {
        warn!("OPENROUTER_API_KEY is not set, every question will get the fallback reply");
    }

    // Create shutdown signal handler
    let mut shutdown = ShutdownSignal::new()?;

    // Create channels for inter-component communication
    // Collaborators and IPC -> interaction loop (the single input queue)
    let (input_tx, input_rx) = mpsc::channel::<Input>(64);
    // Interaction loop -> IPC server and subscribers
    let (event_tx, _event_rx) = broadcast::channel::<StateEvent>(64);

    let capture = ConsoleCapture::new(input_tx.clone(), config.no_speech_timeout);
    let permission = Arc::new(PermissionGate::new(Arc::new(capture.access())));

    let sink: Arc<dyn SpeechSink> = match CommandSink::resolve(config.speech_command.as_deref()) {
        Some(sink) => Arc::new(sink),
        None => {
            info!("no usable speech command, printing replies");
            Arc::new(ConsoleSink::default())
        }
    };
    let speech = SpeechCoordinator::new(sink);

    let answers = Arc::new(OpenRouterClient::new(config.answer.clone())?);

    let wake = WakeMatcher::new(config.wake.clone());
    info!(wake_word = wake.wake_word(), "wake word configured");
    let machine = Machine::new(config.machine.clone(), wake);
    let mut runtime = Runtime::new(
        machine,
        Box::new(capture),
        speech,
        answers,
        permission,
        input_tx.clone(),
        event_tx.clone(),
    );

    // Create IPC server
    let server = Server::new(&config.socket_path, input_tx.clone(), event_tx.clone())?;

    // Subscribe to state events for the IPC status snapshot
    let mut status_rx = event_tx.subscribe();
    let server_for_events = &server;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run the interaction loop (processes every input in order)
        _ = runtime.run(input_rx) => {
            info!("interaction loop exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Keep the IPC status snapshot current
        _ = async {
            loop {
                match status_rx.recv().await {
                    Ok(event) => server_for_events.apply_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "status receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("status tracker exited");
        }

        // Wait for shutdown signal
        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    runtime.shutdown();
    server.shutdown().await;

    info!("yohi-daemon stopped");

    Ok(())
}
