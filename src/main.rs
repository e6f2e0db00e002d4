//! onclose-harness: WebSocket close-lifecycle verification
//!
//! Deploys an echo endpoint that records when its connections close, then
//! drives a client through it:
//! - Connect to `ws://<host>:<port><context>echo`
//! - Optionally exchange one text message
//! - Close and wait for the endpoint's close callback
//! - Assert the recorded events contain "Closing connection"
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod driver;
mod endpoint;
mod observation;
mod server;
mod signal;

use config::{Config, Mode};
use driver::{Driver, HarnessError, Report};
use endpoint::OnCloseEndpoint;
use observation::ObservationBuffer;
use server::Server;
use signal::CloseSignal;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        context_path = %config.context_path,
        mode = ?config.mode,
        timeout_secs = config.timeout.as_secs(),
        probe = ?config.probe,
        "Starting onclose-harness"
    );

    match config.mode {
        Mode::Serve => serve(config).await,
        Mode::Verify => match verify(&config).await {
            Ok(report) => {
                info!(
                    url = %report.url,
                    echoed = ?report.echoed,
                    signalled = report.signalled,
                    observed = %report.observed,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Close observed"
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(e) if e.is_assertion() => {
                error!(error = %e, "Verification failed");
                Ok(ExitCode::from(1))
            }
            Err(e) => {
                error!(error = %e, "Verification could not run");
                Ok(ExitCode::from(2))
            }
        },
    }
}

/// Run the endpoint until interrupted
async fn serve(config: Config) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let endpoint = Arc::new(OnCloseEndpoint::new(
        Arc::new(ObservationBuffer::new()),
        Arc::new(CloseSignal::new()),
    ));
    let server = Server::bind(&config, endpoint).await?;

    let interrupted = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
    };
    server
        .run_until(interrupted)
        .await
        .map_err(|e| e as Box<dyn std::error::Error>)?;
    Ok(ExitCode::SUCCESS)
}

/// Deploy the endpoint in-process and drive one connection through it
async fn verify(config: &Config) -> Result<Report, HarnessError> {
    let endpoint = Arc::new(OnCloseEndpoint::new(
        Arc::new(ObservationBuffer::new()),
        Arc::new(CloseSignal::new()),
    ));
    let buffer = Arc::clone(endpoint.buffer());
    let signal = Arc::clone(endpoint.signal());

    let server = Server::bind(config, endpoint)
        .await
        .and_then(Server::spawn)
        .map_err(|e| HarnessError::Setup(Box::new(e)))?;

    let url = driver::ws_url(
        &config.connect_host(),
        server.local_addr().port(),
        &config.context_path,
    );
    let mut driver = Driver::new(url, buffer, signal)
        .with_timeout(config.timeout)
        .with_probe(config.probe.clone());

    let report = driver.run().await;
    server.shutdown().await;
    report
}
