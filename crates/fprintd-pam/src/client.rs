//! Control-socket client used by the helper.

use std::path::Path;

use bytes::Bytes;
use fprintd_core::proto::framing::FrameCodec;
use fprintd_core::proto::{ClientMessage, Event, Reply, Request, ServerMessage};
use fprintd_core::WireError;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The service returned an error reply.
    #[error("{0}")]
    Call(WireError),
    /// The connection dropped or the peer spoke garbage.
    #[error("connection to fprintd lost: {0}")]
    Transport(String),
}

impl ClientError {
    /// The wire error-kind token, when this is a service error.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Call(wire) => Some(&wire.name),
            Self::Transport(_) => None,
        }
    }
}

/// A connected control-socket client.
///
/// Events that arrive while a call is pending are buffered and handed out
/// by [`DaemonClient::next_event`] in arrival order.
pub struct DaemonClient {
    framed: Framed<UnixStream, FrameCodec>,
    pending_events: VecDeque<Event>,
    next_id: u64,
}

impl DaemonClient {
    /// Connects to the daemon's control socket.
    ///
    /// # Errors
    ///
    /// I/O errors from the connect.
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new()),
            pending_events: VecDeque::new(),
            next_id: 0,
        })
    }

    async fn read_message(&mut self) -> Result<ServerMessage, ClientError> {
        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| ClientError::Transport("connection closed".into()))?
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        serde_json::from_slice(&frame).map_err(|err| ClientError::Transport(err.to_string()))
    }

    /// Issues one method call and waits for its reply.
    ///
    /// # Errors
    ///
    /// [`ClientError::Call`] for service errors, [`ClientError::Transport`]
    /// for connection failures.
    pub async fn call(&mut self, request: Request) -> Result<Reply, ClientError> {
        self.next_id += 1;
        let id = self.next_id;
        let bytes = serde_json::to_vec(&ClientMessage { id, request })
            .map_err(|err| ClientError::Transport(err.to_string()))?;
        self.framed
            .send(Bytes::from(bytes))
            .await
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        loop {
            match self.read_message().await? {
                ServerMessage::Event { event } => self.pending_events.push_back(event),
                ServerMessage::Reply {
                    id: reply_id,
                    reply,
                    error,
                } => {
                    if reply_id != id {
                        // Stale reply from an abandoned call; skip it.
                        continue;
                    }
                    if let Some(error) = error {
                        return Err(ClientError::Call(error));
                    }
                    return reply
                        .ok_or_else(|| ClientError::Transport("reply carried no body".into()));
                }
            }
        }
    }

    /// The next pushed event, in arrival order.
    ///
    /// # Errors
    ///
    /// [`ClientError::Transport`] when the connection drops.
    pub async fn next_event(&mut self) -> Result<Event, ClientError> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            match self.read_message().await? {
                ServerMessage::Event { event } => return Ok(event),
                ServerMessage::Reply { .. } => {
                    // A reply nobody is waiting on (e.g. a fire-and-forget
                    // stop); drop it.
                }
            }
        }
    }
}
