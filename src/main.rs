use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use allot::tenant::TenantManager;
use allot::{observability, tls, wire};

/// Runtime configuration, all read from `ALLOT_*` environment variables.
struct Config {
    bind: String,
    port: String,
    data_dir: String,
    password: String,
    max_connections: usize,
    compact_threshold: u64,
    metrics_port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: env_or("ALLOT_BIND", "0.0.0.0"),
            port: env_or("ALLOT_PORT", "5454"),
            data_dir: env_or("ALLOT_DATA_DIR", "./data"),
            password: env_or("ALLOT_PASSWORD", "allot"),
            max_connections: env_parsed("ALLOT_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: env_parsed("ALLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: env_parsed("ALLOT_METRICS_PORT"),
            tls_cert: std::env::var("ALLOT_TLS_CERT").ok(),
            tls_key: std::env::var("ALLOT_TLS_KEY").ok(),
        }
    }
}

/// Resolves on ctrl-c, and on SIGTERM where that exists.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn spawn_connection(
    socket: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    permit: tokio::sync::OwnedSemaphorePermit,
    tenants: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) {
    info!("connection from {peer}");
    metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
    tokio::spawn(async move {
        let _permit = permit; // released when the connection closes
        if let Err(e) = wire::process_connection(socket, tenants, password, tls).await {
            error!("connection error from {peer}: {e}");
        }
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
    });
}

/// Give in-flight connections a grace period to finish after the accept
/// loop has stopped.
async fn drain_connections(permits: &Semaphore, max_connections: usize) {
    info!("draining connections...");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while permits.available_permits() < max_connections {
        if tokio::time::Instant::now() >= deadline {
            let open = max_connections - permits.available_permits();
            warn!("drain timeout, {open} connections still open");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("all connections drained");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cfg = Config::from_env();
    observability::init(cfg.metrics_port);

    let tls_acceptor = tls::load_tls_acceptor(cfg.tls_cert.as_deref(), cfg.tls_key.as_deref())?;
    std::fs::create_dir_all(&cfg.data_dir)?;

    let tenants = Arc::new(TenantManager::new(
        PathBuf::from(&cfg.data_dir),
        cfg.compact_threshold,
    ));
    let permits = Arc::new(Semaphore::new(cfg.max_connections));

    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("allot listening on {addr}");
    info!("  data_dir: {}", cfg.data_dir);
    info!("  max_connections: {}", cfg.max_connections);
    info!(
        "  tls: {}",
        if tls_acceptor.is_some() { "enabled" } else { "disabled" }
    );
    match cfg.metrics_port {
        Some(p) => info!("  metrics: http://0.0.0.0:{p}/metrics"),
        None => info!("  metrics: disabled"),
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
        };

        let Ok(permit) = permits.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };
        spawn_connection(
            socket,
            peer,
            permit,
            tenants.clone(),
            cfg.password.clone(),
            tls_acceptor.clone(),
        );
    }

    drain_connections(&permits, cfg.max_connections).await;
    info!("allot stopped");
    Ok(())
}
