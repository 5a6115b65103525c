use crate::{
    annotate::Annotator,
    command::CommandDetector,
    config::{Config, DetectionConfig, DetectorKind},
    detector::{Detector, PassthroughDetector},
    error::{ExchangeError, ServerError},
    pool::DetectionPool,
};
use frame_codec::{FrameCodec, DEFAULT_MAX_PAYLOAD_SIZE};
use std::{
    future::Future,
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime,
    signal,
    sync::broadcast,
    task::JoinSet,
    time::timeout,
};
use tracing::instrument;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerPortalConfig {
    pub max_payload_size: u64,
    pub exchange_timeout: Duration,
    pub shutdown_grace: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for ServerPortalConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            exchange_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            workers: 1,
            queue_capacity: 8,
        }
    }
}

impl From<&Config> for ServerPortalConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_payload_size: config.protocol.max_payload_size,
            exchange_timeout: Duration::from_millis(config.exchange.timeout_ms),
            shutdown_grace: Duration::from_millis(config.exchange.shutdown_grace_ms),
            workers: config.detection.workers,
            queue_capacity: config.detection.queue_capacity,
        }
    }
}

/// Listening side of the protocol: one request frame in, one annotated image
/// frame out, per connection.
pub struct ServerPortal {
    listener: TcpListener,
    pool: DetectionPool,
    codec: FrameCodec,
    exchange_timeout: Duration,
    shutdown_grace: Duration,
}

impl ServerPortal {
    pub async fn bind(
        addr: &str,
        detector: impl Detector,
        config: &ServerPortalConfig,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: addr.to_string(),
                source,
            })?;

        let pool = DetectionPool::new(detector, config.workers, config.queue_capacity);

        Ok(Self {
            listener,
            pool,
            codec: FrameCodec::new(config.max_payload_size),
            exchange_timeout: config.exchange_timeout,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until a shutdown message arrives (or every sender
    /// is dropped), then waits up to the grace period for in-flight exchanges
    /// before aborting them.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), ServerError> {
        let Self {
            listener,
            pool,
            codec,
            exchange_timeout,
            shutdown_grace,
        } = self;

        tracing::info!("Detection server listening on {}", listener.local_addr()?);

        let mut exchanges = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Accepted connection from {}", peer);
                        exchanges.spawn(serve_connection(
                            stream,
                            peer,
                            pool.clone(),
                            codec,
                            exchange_timeout,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = exchanges.join_next(), if !exchanges.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        let in_flight = exchanges.len();
        if in_flight > 0 {
            tracing::info!("Waiting for {} in-flight exchanges", in_flight);
            let drain = async { while exchanges.join_next().await.is_some() {} };
            if timeout(shutdown_grace, drain).await.is_err() {
                tracing::warn!(
                    "Aborting {} exchanges still running after {:?}",
                    exchanges.len(),
                    shutdown_grace
                );
                exchanges.shutdown().await;
            }
        }

        tracing::info!("Detection server stopped");
        Ok(())
    }
}

#[instrument(skip(stream, pool, codec, exchange_timeout))]
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: DetectionPool,
    codec: FrameCodec,
    exchange_timeout: Duration,
) {
    let started = Instant::now();
    let result = timeout(exchange_timeout, exchange(&mut stream, &pool, codec))
        .await
        .unwrap_or(Err(ExchangeError::Timeout(exchange_timeout)));

    match result {
        Ok(()) => tracing::info!(
            "Exchange completed in {} ms",
            started.elapsed().as_millis()
        ),
        Err(e) => tracing::warn!("Closing connection: {}", e),
    }
}

async fn exchange(
    stream: &mut TcpStream,
    pool: &DetectionPool,
    codec: FrameCodec,
) -> Result<(), ExchangeError> {
    let image = codec.decode(stream).await?;
    tracing::debug!("Received {} byte image", image.len());

    let annotated = pool.detect(image).await?;

    codec.write_frame(stream, &annotated).await?;
    tracing::debug!("Sent {} byte annotated image", annotated.len());

    Ok(())
}

pub fn build_detector(config: &DetectionConfig) -> Result<Box<dyn Detector>, ServerError> {
    match config.kind {
        DetectorKind::Passthrough => Ok(Box::new(PassthroughDetector)),
        DetectorKind::Command => {
            let command = config.command.as_ref().ok_or_else(|| {
                ServerError::DetectorSetup("missing detection.command section".to_string())
            })?;
            let annotator = Annotator::from_config(&config.annotation)
                .map_err(|e| ServerError::DetectorSetup(format!("Failed to load labels: {}", e)))?;
            let detector = CommandDetector::new(command, annotator).map_err(|e| {
                ServerError::DetectorSetup(format!("Failed to prepare work dir: {}", e))
            })?;
            Ok(Box::new(detector))
        }
    }
}

pub async fn start_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let detector = build_detector(&config.detection)?;
    let addr = config.server.get_address();
    let portal = ServerPortal::bind(&addr, detector, &ServerPortalConfig::from(&config)).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server_handle = tokio::spawn(portal.run(shutdown_rx));

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

/// Runs the server on a dedicated runtime until a shutdown signal arrives.
pub fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown_grace = Duration::from_millis(config.exchange.shutdown_grace_ms);
    block_on_server(start_server(config), shutdown_grace)?
}

/// Detections still running on the blocking pool once `server` resolves are
/// given `shutdown_grace` and then left behind; their cancel flags are set as
/// the runtime drops the workers waiting on them.
pub(crate) fn block_on_server<F: Future>(
    server: F,
    shutdown_grace: Duration,
) -> io::Result<F::Output> {
    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;
    let output = runtime.block_on(server);
    runtime.shutdown_timeout(shutdown_grace);
    Ok(output)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
