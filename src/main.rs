//! streamwire - echo peer
//!
//! Accepts TCP connections and runs one streaming session per connection.
//! Every request is answered with status 200 and its content streams echoed
//! back in order.

use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamwire_core::{
    Config, ContentStream, ReceiveRequest, RequestHandler, SessionConfig, StreamingResponse,
    StreamingSession, Transport,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Answers each request with its own content streams.
struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, request: ReceiveRequest) -> BoxFuture<'static, StreamingResponse> {
        async move {
            tracing::debug!(
                verb = %request.verb,
                path = %request.path,
                streams = request.streams.len(),
                "echoing request"
            );
            let mut response = StreamingResponse::ok();
            for stream in request.streams {
                let body = stream.read_to_end().await;
                let content_type = stream
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                response = response.with_stream(ContentStream::from_bytes(content_type, body));
            }
            response
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if STREAMWIRE_CONFIG is set, then env overrides)
    let config_path = std::env::var("STREAMWIRE_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting streamwire echo peer");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    tracing::info!(
        "  Request timeout: {}s",
        config.session.request_timeout_secs
    );

    let listener = TcpListener::bind(config.network.bind_addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let active = Arc::new(AtomicUsize::new(0));

    // Spawn shutdown signal handler
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping...");
            let _ = shutdown_tx.send(());
        });
    }

    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((tcp_stream, addr)) => {
                        if active.load(Ordering::Relaxed) >= config.network.max_connections {
                            tracing::warn!("Connection limit reached, rejecting {}", addr);
                            continue;
                        }
                        active.fetch_add(1, Ordering::Relaxed);

                        let active = active.clone();
                        let session_config = config.session.clone();
                        let conn_shutdown = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_connection(tcp_stream, addr, session_config, conn_shutdown).await
                            {
                                tracing::debug!("Connection {} error: {}", addr, e);
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                            tracing::info!("Client disconnected: {}", addr);
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Server shutting down");
                break;
            }
        }
    }

    // Give open sessions a bounded window to flush and close.
    let drain = async {
        while active.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(config.session.shutdown_timeout(), drain)
        .await
        .is_err()
    {
        tracing::warn!(
            "{} connection(s) still open at shutdown",
            active.load(Ordering::Relaxed)
        );
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn serve_connection(
    tcp_stream: TcpStream,
    addr: SocketAddr,
    config: SessionConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> streamwire_core::Result<()> {
    tracing::info!("Client connected: {}", addr);

    let session = StreamingSession::new(config);
    session.subscribe(EchoHandler);
    let mut disconnected = session.subscribe_disconnected();
    session.connect(Transport::tcp(tcp_stream)).await?;

    tokio::select! {
        event = disconnected.recv() => {
            if let Ok(event) = event {
                tracing::debug!("[{}] session ended: {}", addr, event.reason);
            }
        }
        _ = shutdown.recv() => {
            session.close().await;
        }
    }
    Ok(())
}
