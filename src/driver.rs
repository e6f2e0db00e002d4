//! Client driver for the close-lifecycle check.
//!
//! Opens a connection to the endpoint, optionally exchanges a probe message,
//! closes, then waits on the close signal and asserts that the observation
//! buffer holds the close marker. A wait that times out is not reported on
//! its own; it falls through to the assertion, which fails on an empty
//! buffer.

use crate::endpoint::CLOSE_MARKER;
use crate::observation::ObservationBuffer;
use crate::server::echo_path;
use crate::signal::CloseSignal;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default wait for the close callback
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);

/// Build the endpoint URL from deployment coordinates
pub fn ws_url(host: &str, port: u16, context_path: &str) -> String {
    let path = echo_path(context_path);
    if host.contains(':') && !host.starts_with('[') {
        format!("ws://[{host}]:{port}{path}")
    } else {
        format!("ws://{host}:{port}{path}")
    }
}

/// Progress of a single driver run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Connecting,
    Connected,
    AwaitingClose,
    ClosedObserved,
    TimedOut,
    Asserted,
}

/// Outcome of a passing run
#[derive(Debug, Clone)]
pub struct Report {
    pub url: String,
    /// Reply to the probe, if one was sent
    pub echoed: Option<String>,
    /// Whether the close signal fired before the timeout
    pub signalled: bool,
    pub observed: String,
    pub elapsed: Duration,
}

pub struct Driver {
    url: String,
    timeout: Duration,
    probe: Option<String>,
    buffer: Arc<ObservationBuffer>,
    signal: Arc<CloseSignal>,
    state: DriverState,
}

impl Driver {
    pub fn new(url: String, buffer: Arc<ObservationBuffer>, signal: Arc<CloseSignal>) -> Self {
        Self {
            url,
            timeout: DEFAULT_TIMEOUT,
            probe: None,
            buffer,
            signal,
            state: DriverState::Init,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_probe(mut self, probe: Option<String>) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, next: DriverState) {
        trace!(from = ?self.state, to = ?next, "Driver state");
        self.state = next;
    }

    /// Drive one connection through the endpoint and check the result
    pub async fn run(&mut self) -> Result<Report, HarnessError> {
        let started = Instant::now();
        self.transition(DriverState::Init);
        self.signal.reset();
        self.buffer.clear();

        self.transition(DriverState::Connecting);
        info!(url = %self.url, "Connecting");
        let connecting =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(self.url.as_str()));
        let (mut ws, _) = match connecting.await {
            Ok(connected) => connected.map_err(|e| HarnessError::Setup(Box::new(e)))?,
            Err(_) => {
                return Err(HarnessError::Setup(
                    format!("no handshake from {} within {:?}", self.url, self.timeout).into(),
                ))
            }
        };
        self.transition(DriverState::Connected);

        let echoed = match self.probe.as_deref() {
            Some(probe) => Some(self.exchange(&mut ws, probe).await?),
            None => None,
        };

        let closing = tokio::time::timeout(self.timeout, async {
            ws.close(None).await.map_err(HarnessError::Transport)?;
            // Read until the server's close reply ends the stream
            while let Some(frame) = ws.next().await {
                if let Err(e) = frame {
                    debug!(error = %e, "Connection ended during close");
                    break;
                }
            }
            Ok::<(), HarnessError>(())
        });
        match closing.await {
            Ok(closed) => closed?,
            Err(_) => warn!(
                timeout_secs = self.timeout.as_secs_f64(),
                "Close handshake not completed in time"
            ),
        }

        self.transition(DriverState::AwaitingClose);
        debug!(released = self.signal.is_released(), "Awaiting close signal");
        let signal = Arc::clone(&self.signal);
        let timeout = self.timeout;
        let signalled = run_blocking(move || signal.wait_timeout(timeout)).await?;

        if signalled {
            self.transition(DriverState::ClosedObserved);
        } else {
            warn!(timeout_secs = timeout.as_secs_f64(), "Close signal not released in time");
            self.transition(DriverState::TimedOut);
        }

        if !self.buffer.contains(CLOSE_MARKER) {
            return Err(HarnessError::Assertion {
                observed: self.buffer.snapshot(),
                timed_out: !signalled,
            });
        }
        let observed = self.buffer.snapshot();
        debug!(observed = %observed, "Observation buffer");
        self.transition(DriverState::Asserted);

        Ok(Report {
            url: self.url.clone(),
            echoed,
            signalled,
            observed,
            elapsed: started.elapsed(),
        })
    }

    /// Send `probe` and wait for the same text to come back
    async fn exchange(&self, ws: &mut ClientStream, probe: &str) -> Result<String, HarnessError> {
        ws.send(Message::text(probe.to_owned()))
            .await
            .map_err(HarnessError::Transport)?;

        let reply = tokio::time::timeout(self.timeout, async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(HarnessError::Transport(tungstenite::Error::ConnectionClosed))
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(HarnessError::Transport(e)),
                }
            }
        })
        .await
        .map_err(|_| HarnessError::NoReply(self.timeout))??;

        if reply != probe {
            return Err(HarnessError::EchoMismatch {
                expected: probe.to_owned(),
                actual: reply,
            });
        }
        debug!(len = reply.len(), "Probe echoed");
        Ok(reply)
    }
}

/// Run a blocking call on the blocking pool; a panic there is a harness fault
async fn run_blocking<T, F>(f: F) -> Result<T, HarnessError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HarnessError::Setup(Box::new(e)))
}

/// Reasons a run does not pass
#[derive(Debug)]
pub enum HarnessError {
    /// The endpoint could not be deployed or reached, or the harness itself failed
    Setup(Box<dyn std::error::Error + Send + Sync>),
    Transport(tungstenite::Error),
    EchoMismatch { expected: String, actual: String },
    NoReply(Duration),
    /// The observation buffer lacks the close marker
    Assertion { observed: String, timed_out: bool },
}

impl HarnessError {
    /// Test failure, as opposed to a setup or transport fault
    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            HarnessError::Assertion { .. } | HarnessError::EchoMismatch { .. }
        )
    }
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Setup(e) => write!(f, "setup failed: {}", e),
            HarnessError::Transport(e) => write!(f, "transport error: {}", e),
            HarnessError::EchoMismatch { expected, actual } => {
                write!(f, "echo mismatch: sent {:?}, received {:?}", expected, actual)
            }
            HarnessError::NoReply(timeout) => {
                write!(f, "no reply to probe within {:?}", timeout)
            }
            HarnessError::Assertion { observed, timed_out } => write!(
                f,
                "expected {:?} in observation buffer, found {:?}{}",
                CLOSE_MARKER,
                observed,
                if *timed_out { " (close signal timed out)" } else { "" }
            ),
        }
    }
}

impl std::error::Error for HarnessError {}
