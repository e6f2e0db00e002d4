//! Server-side endpoint callbacks.
//!
//! The transport owns each connection and hands the registered [`Endpoint`]
//! a borrowed [`Session`] for the duration of a callback. The endpoint never
//! touches the socket directly: outbound messages are queued on the session
//! and drained by the connection task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use crate::observation::ObservationBuffer;
use crate::signal::CloseSignal;

/// Event recorded when a connection closes
pub const CLOSE_MARKER: &str = "Closing connection";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One active WebSocket connection as seen by an endpoint
#[derive(Debug)]
pub struct Session {
    id: u64,
    peer: SocketAddr,
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Session {
    /// Create a session whose outbound messages are delivered to `outbound`
    pub fn new(peer: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            open: AtomicBool::new(true),
            outbound,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a text frame for the peer
    pub fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::SessionClosed);
        }
        self.outbound
            .send(Message::text(text.to_owned()))
            .map_err(|_| TransportError::SessionClosed)
    }

    /// Start a server-initiated close. Later sends fail.
    pub fn close(&self) -> Result<(), TransportError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(session = self.id, "Server closing session");
        self.outbound
            .send(Message::Close(None))
            .map_err(|_| TransportError::SessionClosed)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Callbacks invoked by the transport for each connection
pub trait Endpoint: Send + Sync + 'static {
    /// A text frame arrived on `session`
    fn on_message(&self, session: &Session, text: &str) -> Result<(), TransportError>;

    /// `session` has ended, by either side or abruptly
    fn on_close(&self, session: &Session);
}

/// Echoes text and records connection closure.
#[derive(Debug, Clone)]
pub struct OnCloseEndpoint {
    buffer: Arc<ObservationBuffer>,
    signal: Arc<CloseSignal>,
}

impl OnCloseEndpoint {
    pub fn new(buffer: Arc<ObservationBuffer>, signal: Arc<CloseSignal>) -> Self {
        Self { buffer, signal }
    }

    pub fn buffer(&self) -> &Arc<ObservationBuffer> {
        &self.buffer
    }

    pub fn signal(&self) -> &Arc<CloseSignal> {
        &self.signal
    }
}

impl Endpoint for OnCloseEndpoint {
    fn on_message(&self, session: &Session, text: &str) -> Result<(), TransportError> {
        debug!(session = session.id(), len = text.len(), "Echoing message");
        session.send_text(text)
    }

    fn on_close(&self, session: &Session) {
        self.buffer.append(CLOSE_MARKER);
        let first = self.signal.release();
        info!(session = session.id(), peer = %session.peer(), first, "Connection closed");
    }
}

/// Transport-level failure on a session
#[derive(Debug)]
pub enum TransportError {
    /// The session no longer accepts outbound messages
    SessionClosed,
    WebSocket(tungstenite::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::SessionClosed => write!(f, "session is closed"),
            TransportError::WebSocket(e) => write!(f, "websocket error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::SessionClosed => None,
            TransportError::WebSocket(e) => Some(e),
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::WebSocket(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn session() -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new("127.0.0.1:9".parse().unwrap(), tx), rx)
    }

    fn endpoint() -> OnCloseEndpoint {
        OnCloseEndpoint::new(
            Arc::new(ObservationBuffer::new()),
            Arc::new(CloseSignal::new()),
        )
    }

    #[test]
    fn test_echo_verbatim() {
        let (session, mut rx) = session();
        let endpoint = endpoint();

        for text in ["hello", "", "ünïcödé ✓", "line\r\nbreak"] {
            assert_ok!(endpoint.on_message(&session, text));
            assert_eq!(rx.try_recv().unwrap(), Message::text(text.to_owned()));
        }
    }

    #[test]
    fn test_echo_on_closed_session_fails() {
        let (session, _rx) = session();
        session.mark_closed();

        let err = assert_err!(endpoint().on_message(&session, "hello"));
        assert!(matches!(err, TransportError::SessionClosed));
    }

    #[test]
    fn test_echo_after_receiver_dropped_fails() {
        let (session, rx) = session();
        drop(rx);
        assert_err!(endpoint().on_message(&session, "hello"));
    }

    #[test]
    fn test_close_records_marker_and_releases() {
        let (session, _rx) = session();
        let endpoint = endpoint();

        endpoint.on_close(&session);

        assert_eq!(endpoint.buffer().snapshot(), CLOSE_MARKER);
        assert!(endpoint.signal().is_released());
    }

    #[test]
    fn test_repeated_close_is_harmless() {
        let (session, _rx) = session();
        let endpoint = endpoint();

        endpoint.on_close(&session);
        endpoint.on_close(&session);
        endpoint.on_close(&session);

        assert!(endpoint.buffer().contains(CLOSE_MARKER));
        assert_eq!(endpoint.buffer().snapshot(), CLOSE_MARKER.repeat(3));
        assert!(endpoint.signal().is_released());
    }

    #[test]
    fn test_server_close_queues_close_frame_once() {
        let (session, mut rx) = session();

        assert_ok!(session.close());
        assert_ok!(session.close());

        assert!(!session.is_open());
        assert_eq!(rx.try_recv().unwrap(), Message::Close(None));
        assert!(rx.try_recv().is_err());
        assert_err!(session.send_text("late"));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let (a, _ra) = session();
        let (b, _rb) = session();
        assert_ne!(a.id(), b.id());
    }
}
