//! Unix domain socket server for IPC
//!
//! Provides request-response communication, start/stop control of the
//! interaction loop and push notifications of state events to subscribed
//! clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::StateEvent;
use crate::state::Input;

use super::protocol::{AssistantStatus, Request, Response};

/// Largest accepted request body
const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Queue of the interaction loop, for start/stop requests
    inputs: mpsc::Sender<Input>,
    /// Source of state events for subscribed clients
    events: broadcast::Sender<StateEvent>,
}

/// Shared server state
struct ServerState {
    status: AssistantStatus,
    start_time: std::time::Instant,
}

/// Everything a client handler needs
#[derive(Clone)]
struct ClientContext {
    state: Arc<RwLock<ServerState>>,
    inputs: mpsc::Sender<Input>,
    events: broadcast::Sender<StateEvent>,
}

/// Aborts the event forwarder when the client goes away
struct ForwarderGuard(Option<JoinHandle<()>>);

impl Drop for ForwarderGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        inputs: mpsc::Sender<Input>,
        events: broadcast::Sender<StateEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: AssistantStatus::default(),
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            inputs,
            events,
        })
    }

    /// Fold a state event into the status snapshot
    pub async fn apply_event(&self, event: &StateEvent) {
        let mut state = self.state.write().await;
        let old_mode = state.status.mode;
        state.status.apply(event);

        if old_mode != state.status.mode {
            debug!(from = %old_mode, to = %state.status.mode, "IPC server: mode updated");
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        let context = ClientContext {
            state: Arc::clone(&self.state),
            inputs: self.inputs.clone(),
            events: self.events.clone(),
        };

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let context = context.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, context) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(stream: UnixStream, context: ClientContext) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));
        let mut forwarder = ForwarderGuard(None);

        loop {
            let request = match read_message(&mut reader).await? {
                Some(bytes) => bytes,
                None => {
                    debug!("client disconnected");
                    return Ok(());
                }
            };

            // Receiver is taken before the ack so no event falls in between,
            // but nothing is forwarded until the ack is on the wire
            let mut subscription = None;

            let response = match serde_json::from_slice::<Request>(&request) {
                Ok(request) => {
                    debug!(?request, "received request");

                    if matches!(request, Request::Subscribe) && forwarder.0.is_none() {
                        subscription = Some(context.events.subscribe());
                    }

                    Self::process_request(request, &context).await
                }
                Err(e) => Response::Error {
                    code: "bad_request".to_string(),
                    message: e.to_string(),
                },
            };

            send_message(&mut *writer.lock().await, &response).await?;

            if let Some(events) = subscription {
                forwarder.0 = Some(tokio::spawn(forward_events(events, Arc::clone(&writer))));
                debug!("client subscribed to notifications");
            }
        }
    }

    /// Process a request and return a response
    async fn process_request(request: Request, context: &ClientContext) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::GetStatus => {
                let mut state = context.state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                Response::Status(state.status.clone())
            }

            Request::Start | Request::Stop => {
                let input = if matches!(request, Request::Start) {
                    Input::Start
                } else {
                    Input::Stop
                };
                info!(?request, "user request via IPC");

                match context.inputs.send(input).await {
                    Ok(()) => Response::Ack,
                    Err(_) => Response::Error {
                        code: "unavailable".to_string(),
                        message: "interaction loop is not running".to_string(),
                    },
                }
            }

            Request::Subscribe => Response::Subscribed,
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Push state events to a subscribed client until it goes away
async fn forward_events(
    mut events: broadcast::Receiver<StateEvent>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let mut writer = writer.lock().await;
                if let Err(e) = send_message(&mut *writer, &Response::Event { event }).await {
                    debug!(?e, "subscriber gone");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagged behind state events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read one length-prefixed message; `None` on clean disconnect
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];

    // Read message length (4-byte little-endian)
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        anyhow::bail!("message too large: {len} bytes");
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await?;
    Ok(Some(msg_buf))
}

/// Send a length-prefixed JSON message
async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}
