use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Extension, Router};
use clap::{Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::CacheEngine;
use crate::config::Config;
use crate::metadata::MetadataStore;
use crate::origin::OriginClient;
use crate::security::SecurityLayer;
use crate::sig_middleware::SigLayer;
use crate::signer::Signer;
use crate::{handlers, tls};

#[derive(Parser)]
#[command(name = "s3tlsproxy", about = "A caching TLS reverse proxy in front of S3 buckets")]
pub struct Cli {
    #[arg(long, short = 'c', default_value = "./config.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// URL-signing utilities for the maintenance endpoints.
    Urls {
        #[command(subcommand)]
        command: UrlsCommand,
    },
}

#[derive(Subcommand)]
pub enum UrlsCommand {
    /// Produce a signed URL for `/__s3p/purge` or `/__s3p/shrink`.
    Sign {
        #[arg(long)]
        url: String,

        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long, default_value = "1h")]
        duration: String,

        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config).await?;

    match cli.command {
        Some(Command::Urls { command }) => run_urls_command(config, command),
        None => run_server(config).await,
    }
}

fn run_urls_command(config: Config, command: UrlsCommand) -> anyhow::Result<()> {
    match command {
        UrlsCommand::Sign {
            url,
            method,
            duration,
            exclude,
        } => {
            let ttl: Duration = humantime::parse_duration(&duration)?;
            let signer = Signer::new(config.secret_key.clone());
            let exclude_refs: Vec<&str> = exclude.iter().map(|s| s.as_str()).collect();
            let signed = signer.sign_url(&url, &method, ttl, &exclude_refs)?;
            println!("{signed}");
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let metadata = Arc::new(MetadataStore::open(std::path::Path::new(&config.db_filename)).await?);
    let origin = Arc::new(OriginClient::new()?);
    let cache = Arc::new(CacheEngine::new(config.clone(), metadata, origin));
    let signer = Arc::new(Signer::new(config.secret_key.clone()));

    let maintenance = Router::new()
        .route("/__s3p/purge", get(handlers::purge))
        .route("/__s3p/shrink", get(handlers::shrink))
        .route_layer(SigLayer::new(signer, config.strict_signatures));

    let app = Router::new()
        .merge(maintenance)
        .fallback(handlers::serve_cache)
        .layer(Extension(cache))
        .layer(Extension(config.clone()))
        .layer(SecurityLayer::new(config.clone()))
        .layer(TraceLayer::new_for_http());

    info!(addr = %config.server_addr, "starting s3tlsproxy");
    tls::serve(config, app).await?;
    Ok(())
}

/// Waits for SIGINT/SIGTERM (ctrl-c / a process manager's stop signal),
/// then returns so the caller can drive a bounded graceful shutdown.
/// SIGHUP is logged but not yet acted on: the original deployment reserved
/// it for config reload without ever implementing that path either.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(unix)]
    let hangup = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        loop {
            hup.recv().await;
            warn!("received SIGHUP; config reload is not implemented, ignoring");
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
        _ = hangup => {}
    }
}
