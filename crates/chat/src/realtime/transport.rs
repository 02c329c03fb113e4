//! Duplex transports for realtime channels
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. The
//! WebSocket connector authenticates through the `token` query parameter;
//! [`MemoryConnector`] scripts connection outcomes for driver tests.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use futures::channel::mpsc as fmpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use helpmate_shared::SyncError;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use url::Url;

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection lost: {0}")]
    Io(String),

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    /// Returns true if this error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connect(_) => true,
            TransportError::Io(_) => true,

            TransportError::Rejected(_) => false,
            TransportError::InvalidEndpoint(_) => false,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected(reason) => SyncError::AuthenticationRejected(reason),
            other => SyncError::Transport(other.to_string()),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                TransportError::Rejected(format!("handshake returned {}", response.status()))
            }
            tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
            tungstenite::Error::Io(e) => TransportError::Connect(e.to_string()),
            other => TransportError::Io(other.to_string()),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open duplex connection carrying JSON text frames
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports for a named channel
pub trait Connector: Send + Sync {
    fn open(&self, channel: &str, credential: &str)
        -> BoxFuture<'static, Result<Transport, TransportError>>;
}

// =============================================================================
// WebSocket
// =============================================================================

/// Connects to `{base_url}/{channel}?token=<credential>`
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: Url,
}

impl WsConnector {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    pub fn endpoint(&self, channel: &str, credential: &str) -> Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(channel)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", credential);
        Ok(url)
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        channel: &str,
        credential: &str,
    ) -> BoxFuture<'static, Result<Transport, TransportError>> {
        let endpoint = self.endpoint(channel, credential);
        let channel = channel.to_string();

        async move {
            let url = endpoint?;
            let (socket, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
            tracing::debug!(
                channel = %channel,
                status = %response.status(),
                "WebSocket handshake complete"
            );

            let (write, read) = socket.split();
            let sink = write
                .sink_map_err(TransportError::from)
                .with(|frame: String| {
                    futures::future::ready(Ok::<_, TransportError>(Message::Text(frame)))
                });
            let stream = read.filter_map(|message| {
                futures::future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    // Close frames end the stream on their own; ping/pong is
                    // answered by tungstenite
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });

            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Server side of an in-memory transport
pub struct MemoryPeer {
    to_client: fmpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: fmpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Deliver a raw frame to the client
    pub fn send_frame(&self, frame: &str) -> bool {
        self.to_client.unbounded_send(Ok(frame.to_string())).is_ok()
    }

    /// Deliver a JSON value as a frame
    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_frame(&value.to_string())
    }

    /// Fail the connection with a transport error
    pub fn fail(&self, reason: &str) -> bool {
        self.to_client
            .unbounded_send(Err(TransportError::Io(reason.to_string())))
            .is_ok()
    }

    /// Next frame written by the client, or None once it hung up
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Drop the connection from the server side
    pub fn close(self) {}
}

enum Scripted {
    Accept(Transport),
    Refuse(TransportError),
}

/// Connector whose connection outcomes are queued in advance
///
/// Opens beyond the queued script fail with a transient connect error.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    opened: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful open and return its server side
    pub fn accept(&self) -> MemoryPeer {
        let (to_client, client_rx) = fmpsc::unbounded();
        let (client_tx, from_client) = fmpsc::unbounded::<String>();

        let sink = client_tx.sink_map_err(|e| TransportError::Io(e.to_string()));
        let transport = Transport {
            sink: Box::pin(sink),
            stream: Box::pin(client_rx),
        };
        self.push(Scripted::Accept(transport));

        MemoryPeer {
            to_client,
            from_client,
        }
    }

    /// Queue a failed open
    pub fn refuse(&self, err: TransportError) {
        self.push(Scripted::Refuse(err));
    }

    /// `(channel, credential)` of every open attempt so far
    pub fn attempts(&self) -> Vec<(String, String)> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, outcome: Scripted) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }
}

impl Connector for MemoryConnector {
    fn open(
        &self,
        channel: &str,
        credential: &str,
    ) -> BoxFuture<'static, Result<Transport, TransportError>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((channel.to_string(), credential.to_string()));

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let result = match next {
            Some(Scripted::Accept(transport)) => Ok(transport),
            Some(Scripted::Refuse(err)) => Err(err),
            None => Err(TransportError::Connect("connection refused".to_string())),
        };
        futures::future::ready(result).boxed()
    }
}
