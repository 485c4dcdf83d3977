//! Transport seam for the persistent connection.
//!
//! The connection manager talks to the network through the [`Transport`]
//! trait so its state machine can be exercised against an in-memory
//! implementation. Production uses [`WsTransport`] over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use wl_core::error::{WlError, WlResult};

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Full endpoint URL (`wss://host/ws`).
    pub url: String,
    /// Extra handshake headers.
    pub headers: Vec<(String, String)>,
}

/// An inbound transport event as seen by the reader path.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A binary frame.
    Binary(Vec<u8>),
    /// A text frame; the protocol is binary, so these are unexpected.
    Text(String),
    /// A transport-level pong.
    Pong,
    /// The peer closed the connection or the stream ended.
    Closed,
    /// A transport-level error; the connection is unusable.
    Error(String),
}

/// Write half of an open connection. Only the writer loop holds this.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> WlResult<()>;
    async fn close(&mut self) -> WlResult<()>;
}

/// Read half of an open connection. Only the reader task holds this.
#[async_trait]
pub trait TransportStream: Send {
    async fn next_event(&mut self) -> TransportEvent;
}

/// Factory for connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        request: &OpenRequest,
    ) -> WlResult<(Box<dyn TransportSink>, Box<dyn TransportStream>)>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport over `tokio-tungstenite`.
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        request: &OpenRequest,
    ) -> WlResult<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let mut handshake = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| WlError::Connection(format!("invalid endpoint url: {e}")))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| WlError::BadParam(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| WlError::BadParam(format!("invalid header value: {e}")))?;
            handshake.headers_mut().insert(name, value);
        }

        debug!("opening websocket to {}", request.url);
        let (ws, response) = tokio_tungstenite::connect_async(handshake)
            .await
            .map_err(|e| WlError::Connection(format!("websocket handshake failed: {e}")))?;
        debug!("websocket open, server responded {}", response.status());

        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsReadStream { stream })))
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&mut self, bytes: Vec<u8>) -> WlResult<()> {
        self.sink
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| WlError::Connection(format!("websocket write failed: {e}")))
    }

    async fn close(&mut self) -> WlResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| WlError::Connection(format!("websocket close failed: {e}")))
    }
}

struct WsReadStream {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl TransportStream for WsReadStream {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return TransportEvent::Binary(bytes),
                Some(Ok(Message::Text(text))) => return TransportEvent::Text(text),
                Some(Ok(Message::Pong(_))) => return TransportEvent::Pong,
                // Protocol-level pings are answered by tungstenite itself.
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return TransportEvent::Closed,
                Some(Err(e)) => return TransportEvent::Error(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory transport for connection manager tests.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// Scriptable in-memory transport.
    ///
    /// Records every opened connection and written frame; tests inject
    /// inbound events into the most recent connection.
    pub struct MemoryTransport {
        pub opens: AtomicU32,
        /// Number of upcoming `open` calls that should fail.
        pub fail_opens: AtomicU32,
        /// When set, writes fail until cleared.
        pub fail_writes: Arc<AtomicBool>,
        /// Artificial latency applied to each `open` call.
        pub open_delay: Mutex<Option<std::time::Duration>>,
        /// Every frame written on any connection, in order.
        pub written: Arc<Mutex<Vec<Vec<u8>>>>,
        events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl MemoryTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicU32::new(0),
                fail_opens: AtomicU32::new(0),
                fail_writes: Arc::new(AtomicBool::new(false)),
                open_delay: Mutex::new(None),
                written: Arc::new(Mutex::new(Vec::new())),
                events: Mutex::new(None),
            })
        }

        /// Inject an inbound event into the current connection.
        pub fn inject(&self, event: TransportEvent) {
            let guard = self.events.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(event);
            }
        }

        pub fn open_count(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }

        pub fn written_frames(&self) -> Vec<Vec<u8>> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn open(
            &self,
            _request: &OpenRequest,
        ) -> WlResult<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let delay = *self.open_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(WlError::Connection("simulated open failure".into()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.events.lock().unwrap() = Some(tx);

            Ok((
                Box::new(MemorySink {
                    written: self.written.clone(),
                    fail_writes: self.fail_writes.clone(),
                }),
                Box::new(MemoryStream { rx }),
            ))
        }
    }

    struct MemorySink {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_writes: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TransportSink for MemorySink {
        async fn send(&mut self, bytes: Vec<u8>) -> WlResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(WlError::Connection("simulated write failure".into()));
            }
            self.written.lock().unwrap().push(bytes);
            Ok(())
        }

        async fn close(&mut self) -> WlResult<()> {
            Ok(())
        }
    }

    struct MemoryStream {
        rx: mpsc::UnboundedReceiver<TransportEvent>,
    }

    #[async_trait]
    impl TransportStream for MemoryStream {
        async fn next_event(&mut self) -> TransportEvent {
            self.rx.recv().await.unwrap_or(TransportEvent::Closed)
        }
    }
}
