use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listeners::{ListenerRegistry, Subscription};
use super::{Handler, Identity, Transport, TransportError};
use crate::protocol::Frame;

/// Maximum queued outbound frames before emits start being dropped.
pub const MAX_OUTBOUND_QUEUE: usize = 1024;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live connection for one identity.
struct Connection {
    identity: Identity,
    outbound: mpsc::Sender<String>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    fn is_live(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// WebSocket transport. One connection per identity; inbound frames are
/// dispatched to listeners by a single reader task in arrival order.
pub struct SocketTransport {
    url: String,
    registry: Arc<ListenerRegistry>,
    connection: Mutex<Option<Connection>>,
}

impl SocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            registry: Arc::new(ListenerRegistry::new()),
            connection: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the connection for `identity`.
    ///
    /// A no-op when a live connection for the same identity exists. A different
    /// identity (or a dead connection) is torn down first; listeners survive.
    /// Errors leave the transport disconnected and may be retried.
    pub async fn connect(&self, identity: Identity) -> Result<(), TransportError> {
        {
            let mut current = self.lock_connection();
            match current.as_ref() {
                Some(conn) if conn.identity == identity && conn.is_live() => return Ok(()),
                Some(conn) => {
                    info!(email = %conn.identity.email, "closing previous connection");
                    conn.shutdown();
                    *current = None;
                }
                None => {}
            }
        }

        let request = build_request(&self.url, &identity)?;
        let (socket, _response) = connect_async(request).await?;

        let (outbound, outbound_rx) = mpsc::channel(MAX_OUTBOUND_QUEUE);
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_connection(
            socket,
            outbound_rx,
            self.registry.clone(),
            connected.clone(),
            cancel.clone(),
        ));

        info!(url = %self.url, email = %identity.email, "socket connected");

        let mut current = self.lock_connection();
        // A concurrent connect may have won the race; keep only the newest.
        if let Some(previous) = current.take() {
            previous.shutdown();
        }
        *current = Some(Connection {
            identity,
            outbound,
            connected,
            cancel,
            task,
        });
        Ok(())
    }

    /// Close the connection and release every listener. Safe when not connected.
    pub fn disconnect(&self) {
        if let Some(conn) = self.lock_connection().take() {
            conn.shutdown();
            info!(email = %conn.identity.email, "socket disconnected");
        }
        self.registry.clear();
    }

    /// Like [`SocketTransport::disconnect`], but waits until queued frames are
    /// flushed and the close frame is sent.
    pub async fn close(&self) {
        let connection = self.lock_connection().take();
        self.registry.clear();
        let Some(conn) = connection else {
            return;
        };
        conn.shutdown();
        if let Err(e) = conn.task.await {
            warn!(error = %e, "socket task ended abnormally");
        }
        info!(email = %conn.identity.email, "socket closed");
    }

    pub fn identity(&self) -> Option<Identity> {
        self.lock_connection().as_ref().map(|c| c.identity.clone())
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SocketTransport {
    fn emit(&self, frame: Frame) -> bool {
        let current = self.lock_connection();
        let Some(conn) = current.as_ref().filter(|c| c.is_live()) else {
            warn!(event = %frame.event, "socket not connected, dropping outbound frame");
            return false;
        };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "failed to encode outbound frame");
                return false;
            }
        };
        if conn.outbound.try_send(text).is_err() {
            warn!(event = %frame.event, "outbound queue full or closed, frame dropped");
            return false;
        }
        true
    }

    fn on(&self, event: &str, handler: Handler) -> Subscription {
        self.registry.add(event, handler, false)
    }

    fn once(&self, event: &str, handler: Handler) -> Subscription {
        self.registry.add(event, handler, true)
    }

    fn off(&self, subscription: &Subscription) {
        self.registry.remove(subscription);
    }

    fn is_connected(&self) -> bool {
        self.lock_connection()
            .as_ref()
            .is_some_and(Connection::is_live)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Some(conn) = self.lock_connection().take() {
            conn.shutdown();
        }
    }
}

fn build_request(url: &str, identity: &Identity) -> Result<Request, TransportError> {
    let mut request = url.into_client_request()?;
    if let Some(token) = &identity.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Owns the socket until it closes or the connection is cancelled.
async fn run_connection(
    socket: Socket,
    mut outbound: mpsc::Receiver<String>,
    registry: Arc<ListenerRegistry>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(text) = outbound.try_recv() {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "socket write failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => deliver(&registry, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => deliver(&registry, &text),
                    Err(_) => warn!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("socket closed by server");
                    break;
                }
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                Some(Err(e)) => {
                    warn!(error = %e, "socket read failed");
                    break;
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!("socket task finished");
}

fn deliver(registry: &ListenerRegistry, text: &str) {
    match Frame::decode(text) {
        Ok(frame) => {
            registry.dispatch(&frame.event, &frame.data);
        }
        Err(e) => warn!(error = %e, "dropping malformed frame"),
    }
}
