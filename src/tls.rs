use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::StreamExt;
use rustls_acme::{caches::DirCache, AcmeConfig};
use tracing::{info, warn};

use crate::config::Config;

/// Deadline for in-flight requests to finish once a shutdown signal is
/// received, per spec.md §4.7/§5.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid listen address {addr}: {source}")]
    Addr {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Starts serving `app`. When `config.is_tls_configured()` the listener is
/// wrapped in an ACME-issued TLS acceptor (certificates cached under
/// `config.tls_certs_dir`, refreshed automatically); otherwise it serves
/// plain HTTP, matching the original deployment's behavior for
/// development/staging setups with no `TLSCertsDir` set.
pub async fn serve(config: Arc<Config>, app: Router) -> Result<(), TlsError> {
    let addr: SocketAddr = parse_addr(&config.server_addr)?;

    if config.is_tls_configured() {
        serve_tls(config, addr, app).await
    } else {
        warn!("TLSCertsDir not set, serving plain HTTP");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_with_deadline())
            .await?;
        Ok(())
    }
}

async fn serve_tls(config: Arc<Config>, addr: SocketAddr, app: Router) -> Result<(), TlsError> {
    let domains = config.host_names();
    info!(?domains, cache_dir = %config.tls_certs_dir, "starting ACME-backed TLS listener");

    let cache_dir = PathBuf::from(&config.tls_certs_dir);
    let mut acme_state = AcmeConfig::new(domains)
        .cache(DirCache::new(cache_dir))
        .directory_lets_encrypt(true)
        .state();

    let acceptor = acme_state.axum_acceptor(acme_state.default_rustls_config());

    tokio::spawn(async move {
        loop {
            match acme_state.next().await {
                Some(Ok(ok)) => info!(?ok, "acme event"),
                Some(Err(err)) => warn!(%err, "acme error"),
                None => break,
            }
        }
    });

    let handle = axum_server::Handle::new();
    tokio::spawn(shutdown_handle(handle.clone()));

    axum_server::bind(addr)
        .acceptor(acceptor)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

/// Waits for SIGINT/SIGTERM, then tells `axum_server` to stop accepting new
/// connections and give in-flight ones the spec-mandated 30s to finish.
async fn shutdown_handle(handle: axum_server::Handle) {
    crate::cli::shutdown_signal().await;
    info!(deadline_secs = SHUTDOWN_DEADLINE.as_secs(), "graceful shutdown started");
    handle.graceful_shutdown(Some(SHUTDOWN_DEADLINE));
}

/// Resolves once a shutdown signal arrives, then arms a watchdog that force-
/// exits the process if in-flight requests haven't drained within the
/// spec-mandated 30s deadline (`axum::serve`'s own graceful shutdown has no
/// built-in deadline, unlike `axum_server::Handle`).
async fn shutdown_with_deadline() {
    crate::cli::shutdown_signal().await;
    info!(deadline_secs = SHUTDOWN_DEADLINE.as_secs(), "graceful shutdown started");
    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        warn!("graceful shutdown deadline exceeded, forcing exit");
        std::process::exit(1);
    });
}

fn parse_addr(server_addr: &str) -> Result<SocketAddr, TlsError> {
    let candidate = if server_addr.starts_with(':') {
        format!("0.0.0.0{server_addr}")
    } else {
        server_addr.to_string()
    };
    candidate
        .parse()
        .map_err(|source| TlsError::Addr {
            addr: server_addr.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_port_shorthand() {
        let addr = parse_addr(":4430").unwrap();
        assert_eq!(addr.port(), 4430);
    }

    #[test]
    fn parses_explicit_host() {
        let addr = parse_addr("127.0.0.1:4430").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:4430");
    }
}
