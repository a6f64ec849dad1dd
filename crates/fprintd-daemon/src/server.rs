//! The control-socket server.
//!
//! One Unix listener; per connection, a reader task dispatching framed
//! requests and a writer task draining replies and pushed signals.
//! Connection lifetime doubles as client liveness: when a connection
//! closes, its caller id vanishes from every device.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bytes::Bytes;
use fprintd_core::proto::framing::FrameCodec;
use fprintd_core::proto::{ClientMessage, Event, Reply, Request, ServerMessage};
use fprintd_core::{Error, WireError};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::claims::{Caller, CallerId};
use crate::device::EventSink;
use crate::manager::Manager;

/// Routes pushed signals to connected clients; the server's [`EventSink`].
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<CallerId, mpsc::UnboundedSender<ServerMessage>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, caller: CallerId, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.connections
            .lock()
            .expect("connections poisoned")
            .insert(caller, tx);
    }

    fn unregister(&self, caller: CallerId) {
        self.connections
            .lock()
            .expect("connections poisoned")
            .remove(&caller);
    }

    fn send(&self, caller: CallerId, message: ServerMessage) {
        let tx = self
            .connections
            .lock()
            .expect("connections poisoned")
            .get(&caller)
            .cloned();
        if let Some(tx) = tx {
            let _ = tx.send(message);
        }
    }
}

impl EventSink for ConnectionRegistry {
    fn emit(&self, targets: &[CallerId], event: Event) {
        for caller in targets {
            self.send(*caller, ServerMessage::Event { event: event.clone() });
        }
    }
}

/// The control-socket server.
pub struct Server {
    manager: Arc<Manager>,
    registry: Arc<ConnectionRegistry>,
    socket_path: PathBuf,
    next_caller: AtomicU64,
}

impl Server {
    #[must_use]
    pub fn new(manager: Arc<Manager>, registry: Arc<ConnectionRegistry>, socket_path: PathBuf) -> Self {
        Self {
            manager,
            registry,
            socket_path,
            next_caller: AtomicU64::new(1),
        }
    }

    /// Binds the socket and serves until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Bind/listen failures; per-connection errors are logged, not fatal.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("failed to remove stale socket")?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind control socket")?;
        // Authorization is the policy gate's job, not the socket mode's.
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(0o666),
        );
        info!(path = %self.socket_path.display(), "control socket listening");

        let mut shutdown = self.manager.shutdown_watch();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = server.handle_connection(stream).await {
                                debug!("connection handler error: {err}");
                            }
                        });
                    }
                    Err(err) => warn!("failed to accept connection: {err}"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("control socket shutting down");
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> anyhow::Result<()> {
        let cred = stream.peer_cred().context("failed to read peer credentials")?;
        let caller = Caller::new(
            self.next_caller.fetch_add(1, Ordering::SeqCst),
            cred.uid(),
            cred.pid(),
        );
        debug!(caller = caller.id, uid = caller.uid, "client connected");

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ServerMessage>();
        self.registry.register(caller.id, outgoing_tx);

        let framed = Framed::new(stream, FrameCodec::new());
        let (mut sink, mut source) = framed.split();

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                let bytes = match serde_json::to_vec(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("failed to encode server message: {err}");
                        continue;
                    }
                };
                if sink.send(Bytes::from(bytes)).await.is_err() {
                    return;
                }
            }
        });

        while let Some(frame) = source.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(caller = caller.id, "failed to read frame: {err}");
                    break;
                }
            };
            let message: ClientMessage = match serde_json::from_slice(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(caller = caller.id, "failed to parse request: {err}");
                    break;
                }
            };

            debug!(caller = caller.id, method = message.request.method_name(), "dispatching");
            let result = self.dispatch(&caller, message.request).await;
            self.registry.send(
                caller.id,
                ServerMessage::reply(message.id, result.map_err(WireError::from)),
            );
        }

        // The connection is gone: tear down liveness-bound state.
        debug!(caller = caller.id, "client disconnected");
        self.registry.unregister(caller.id);
        for device in self.manager.devices() {
            device.client_vanished(caller.id).await;
        }
        writer.abort();
        Ok(())
    }

    async fn dispatch(&self, caller: &Caller, request: Request) -> Result<Reply, Error> {
        if self.manager.is_shutting_down() {
            return Err(Error::Internal("Service is shutting down".into()));
        }

        match &request {
            Request::GetDevices => {
                return Ok(Reply::Devices {
                    paths: self.manager.get_devices(),
                });
            }
            Request::GetDefaultDevice => {
                return self
                    .manager
                    .get_default_device()
                    .map(|path| Reply::Device { path });
            }
            _ => {}
        }

        let path = request.device().expect("device-scoped request");
        let device = self
            .manager
            .find_device(path)
            .ok_or(Error::NoSuchDevice)?;

        // The authorization hook: claim pre-check, acting-user resolution,
        // permission check.
        let resolved_user = match device.authorize(caller, &request).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(
                    caller = caller.id,
                    method = request.method_name(),
                    device = device.path(),
                    "Authorization denied: {err}"
                );
                return Err(err);
            }
        };

        match request {
            Request::Claim { .. } => {
                let username = resolved_user.ok_or_else(|| {
                    Error::Internal("acting user missing after authorization".into())
                })?;
                device.claim(caller, username).await.map(|()| Reply::Ok)
            }
            Request::Release { .. } => device.release(caller).await.map(|()| Reply::Ok),
            Request::VerifyStart { finger, .. } => device
                .verify_start(caller, &finger)
                .await
                .map(|()| Reply::Ok),
            Request::VerifyStop { .. } => device.verify_stop(caller).await.map(|()| Reply::Ok),
            Request::EnrollStart { finger, .. } => device
                .enroll_start(caller, &finger)
                .await
                .map(|()| Reply::Ok),
            Request::EnrollStop { .. } => device.enroll_stop(caller).await.map(|()| Reply::Ok),
            Request::ListEnrolledFingers { .. } => {
                let username = resolved_user.ok_or_else(|| {
                    Error::Internal("acting user missing after authorization".into())
                })?;
                device
                    .list_enrolled_fingers(caller, &username)
                    .map(|fingers| Reply::Fingers { fingers })
            }
            Request::DeleteEnrolledFingers { .. } => {
                let username = resolved_user.ok_or_else(|| {
                    Error::Internal("acting user missing after authorization".into())
                })?;
                device
                    .delete_enrolled_fingers_legacy(caller, &username)
                    .await
                    .map(|()| Reply::Ok)
            }
            Request::DeleteEnrolledFingers2 { .. } => device
                .delete_enrolled_fingers2(caller)
                .await
                .map(|()| Reply::Ok),
            Request::DeleteEnrolledFinger { finger, .. } => device
                .delete_enrolled_finger(caller, &finger)
                .await
                .map(|()| Reply::Ok),
            Request::GetProperties { .. } => Ok(Reply::Properties {
                properties: device.snapshot(),
            }),
            Request::GetDevices | Request::GetDefaultDevice => unreachable!("handled above"),
        }
    }
}
