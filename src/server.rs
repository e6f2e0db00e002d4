//! WebSocket transport for the endpoint.
//!
//! Accepts TCP connections, performs the WebSocket upgrade on the echo path
//! and dispatches frames to the registered [`Endpoint`]. Each connection gets
//! a [`Session`] whose outbound queue is drained into the socket, and
//! `on_close` runs exactly once when the connection ends.

use crate::config::Config;
use crate::endpoint::{Endpoint, Session, TransportError};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Time open sessions get to finish closing on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Request path for an endpoint deployed under `context_path`
pub fn echo_path(context_path: &str) -> String {
    let context = context_path.trim_matches('/');
    if context.is_empty() {
        "/echo".to_string()
    } else {
        format!("/{context}/echo")
    }
}

/// Server instance
pub struct Server<E: Endpoint> {
    listener: TcpListener,
    endpoint: Arc<E>,
    path: Arc<str>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl<E: Endpoint> Server<E> {
    /// Bind the listener and register `endpoint`
    pub async fn bind(config: &Config, endpoint: Arc<E>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let path: Arc<str> = echo_path(&config.context_path).into();
        info!(address = %listener.local_addr()?, path = %path, "Endpoint listening");

        Ok(Server {
            listener,
            endpoint,
            path,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then close every open
    /// session and wait for them to finish
    pub async fn run_until<F>(
        self,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()>,
    {
        let (closing_tx, closing_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => permit?,
                _ = &mut shutdown => break,
            };

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = &mut shutdown => break,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let endpoint = Arc::clone(&self.endpoint);
                    let path = Arc::clone(&self.path);
                    let closing = closing_rx.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, addr, endpoint, path, closing).await
                        {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Shutting down, closing open sessions");
        let _ = closing_tx.send(true);

        // Every slot free means every session has run on_close
        let slots = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        let drained =
            tokio::time::timeout(SHUTDOWN_GRACE, self.connection_limit.acquire_many(slots)).await;
        if drained.is_err() {
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Sessions still open after shutdown");
        }
        Ok(())
    }

    /// Run the accept loop as a background task
    pub fn spawn(self) -> std::io::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let stop = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = self.run_until(stop).await {
                error!(error = %e, "Server stopped");
            }
        });
        Ok(ServerHandle {
            addr,
            shutdown: Some(shutdown_tx),
            task,
        })
    }
}

/// Background server; the accept loop stops when the handle is dropped
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close open sessions and wait for the server task to finish
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            debug!(error = %e, "Server task ended abnormally");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Handle a single client connection
async fn handle_connection<E: Endpoint>(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<E>,
    path: Arc<str>,
    mut closing: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == &*path {
            Ok(response)
        } else {
            warn!(peer = %peer, path = request.uri().path(), "Rejecting upgrade");
            let mut rejection = ErrorResponse::new(Some("no endpoint at this path".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    // No session exists until the upgrade succeeds
    let ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let (mut sink, mut incoming) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = Session::new(peer, outbound_tx);
    info!(session = session.id(), peer = %peer, "Session opened");

    let result = loop {
        tokio::select! {
            frame = incoming.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = endpoint.on_message(&session, text.as_str()) {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(session = session.id(), len = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    // The reply is flushed by the next read, which then ends the stream
                    trace!(session = session.id(), ?frame, "Close frame received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
            Ok(()) = closing.changed(), if session.is_open() => {
                if let Err(e) = session.close() {
                    break Err(e);
                }
            }
            Some(message) = outbound_rx.recv() => {
                if let Err(e) = sink.send(message).await {
                    break Err(e.into());
                }
            }
        }
    };

    session.mark_closed();
    endpoint.on_close(&session);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::OnCloseEndpoint;
    use crate::observation::ObservationBuffer;
    use crate::signal::CloseSignal;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        }
    }

    #[test]
    fn test_echo_path() {
        assert_eq!(echo_path("/app/"), "/app/echo");
        assert_eq!(echo_path("/app"), "/app/echo");
        assert_eq!(echo_path("app/"), "/app/echo");
        assert_eq!(echo_path("/"), "/echo");
        assert_eq!(echo_path(""), "/echo");
        assert_eq!(echo_path("/a/b/"), "/a/b/echo");
    }

    #[tokio::test]
    async fn test_rejects_unknown_path() {
        let endpoint = Arc::new(OnCloseEndpoint::new(
            Arc::new(ObservationBuffer::new()),
            Arc::new(CloseSignal::new()),
        ));
        let server = Server::bind(&test_config(), Arc::clone(&endpoint))
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let url = format!("ws://{}/elsewhere", server.local_addr());
        assert!(tokio_tungstenite::connect_async(url).await.is_err());

        // A rejected upgrade never becomes a session
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!endpoint.signal().is_released());
        assert_eq!(endpoint.buffer().snapshot(), "");
    }

    #[tokio::test]
    async fn test_server_initiated_close_fires_on_close() {
        struct CloseOnMessage(OnCloseEndpoint);

        impl Endpoint for CloseOnMessage {
            fn on_message(&self, session: &Session, text: &str) -> Result<(), TransportError> {
                session.send_text(text)?;
                session.close()
            }

            fn on_close(&self, session: &Session) {
                self.0.on_close(session)
            }
        }

        let inner = OnCloseEndpoint::new(
            Arc::new(ObservationBuffer::new()),
            Arc::new(CloseSignal::new()),
        );
        let endpoint = Arc::new(CloseOnMessage(inner.clone()));
        let server = Server::bind(&test_config(), endpoint)
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let url = format!("ws://{}/app/echo", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(Message::text("bye")).await.unwrap();

        assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("bye"));
        assert!(ws.next().await.unwrap().unwrap().is_close());
        // Flushes our close reply
        while let Some(Ok(_)) = ws.next().await {}

        let signal = Arc::clone(inner.signal());
        let released = tokio::task::spawn_blocking(move || {
            signal.wait_timeout(Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(released);
        assert!(inner.buffer().contains(crate::endpoint::CLOSE_MARKER));
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_fires_on_close() {
        let endpoint = Arc::new(OnCloseEndpoint::new(
            Arc::new(ObservationBuffer::new()),
            Arc::new(CloseSignal::new()),
        ));
        let server = Server::bind(&test_config(), Arc::clone(&endpoint))
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let url = format!("ws://{}/app/echo", server.local_addr());
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        drop(ws);

        let signal = Arc::clone(endpoint.signal());
        let released = tokio::task::spawn_blocking(move || {
            signal.wait_timeout(Duration::from_secs(5))
        })
        .await
        .unwrap();
        assert!(released);
        assert_eq!(endpoint.buffer().snapshot(), crate::endpoint::CLOSE_MARKER);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_sessions() {
        let endpoint = Arc::new(OnCloseEndpoint::new(
            Arc::new(ObservationBuffer::new()),
            Arc::new(CloseSignal::new()),
        ));
        let server = Server::bind(&test_config(), Arc::clone(&endpoint))
            .await
            .unwrap()
            .spawn()
            .unwrap();

        let url = format!("ws://{}/app/echo", server.local_addr());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(Message::text("hi")).await.unwrap();
        assert_eq!(ws.next().await.unwrap().unwrap(), Message::text("hi"));

        let client = async move {
            let mut saw_close = false;
            while let Some(Ok(frame)) = ws.next().await {
                saw_close |= frame.is_close();
            }
            saw_close
        };
        let (saw_close, ()) = tokio::join!(client, server.shutdown());

        assert!(saw_close);
        assert!(endpoint.signal().is_released());
        assert_eq!(endpoint.buffer().snapshot(), crate::endpoint::CLOSE_MARKER);
    }
}
