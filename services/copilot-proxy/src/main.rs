//! Copilot API proxy
//!
//! Single-binary service that:
//! 1. Obtains a GitHub token (environment, token file, or device authorization)
//! 2. Trades it for a short-lived Copilot token and keeps that token fresh
//! 3. Listens for OpenAI-style requests
//! 4. Proxies them to the Copilot API with the current token injected,
//!    streaming responses back as they arrive

mod config;
mod error;
mod forward;
mod metrics;
mod relay;
mod server;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::Secret;
use copilot_auth::{CredentialFile, DeviceFlow, TokenExchanger};
use copilot_token::TokenManager;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::forward::Forwarder;
use crate::server::{AppState, ServerStats, build_router};

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reverse proxy for the GitHub Copilot chat API
#[derive(Parser, Debug)]
#[command(name = "copilot-api-proxy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (default: $CONFIG_PATH, then ./copilot-api-proxy.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Authorize with GitHub, save the token and print a Copilot token
    Auth,
    /// Run the proxy server (default)
    Server,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to load configuration".to_string(),
    })?;

    match cli.command.unwrap_or(Command::Server) {
        Command::Auth => run_auth(config).await,
        Command::Server => run_server(config).await,
    }
}

/// `auth` command: device flow, persist, one exchange, print the token.
async fn run_auth(config: Config) -> Result<()> {
    let client = reqwest::Client::new();
    let credential = device_login(&client).await?;

    let file = config
        .credential_file()
        .context("no location for the GitHub token; set auth.token_file")?;
    file.save(&credential)
        .await
        .with_context(|| format!("failed to save GitHub token to {}", file.path().display()))?;

    let exchanger = TokenExchanger::with_url(client, &config.auth.exchange_url);
    let response = exchanger
        .exchange(credential.expose())
        .await
        .context("failed to exchange GitHub token for a Copilot token")?;

    println!("{}", response.token);
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    info!("starting copilot-api-proxy");
    let prometheus_handle = metrics::install_recorder();

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        timeout_secs = config.proxy.timeout_secs,
        "configuration loaded"
    );

    let client = reqwest::Client::new();
    let file = config.credential_file();

    let credential = match resolve_credential(config.github_token.clone(), file.as_ref()).await? {
        Some(credential) => credential,
        None => {
            info!("no GitHub token found, starting device authorization");
            let credential = device_login(&client).await?;
            match &file {
                Some(file) => file.save(&credential).await.with_context(|| {
                    format!("failed to save GitHub token to {}", file.path().display())
                })?,
                None => warn!("no token file location, GitHub token will not be persisted"),
            }
            credential
        }
    };

    let exchanger = TokenExchanger::with_url(client.clone(), &config.auth.exchange_url);
    let tokens = Arc::new(
        TokenManager::start(credential, Arc::new(exchanger))
            .await
            .context("initial Copilot token exchange failed")?,
    );

    let forwarder = Forwarder::new(
        client,
        &config.proxy.upstream_url,
        tokens.clone(),
        Duration::from_secs(config.proxy.timeout_secs),
    )?;

    let app = build_router(AppState {
        forwarder: Arc::new(forwarder),
        stats: ServerStats::new(),
        prometheus: prometheus_handle,
        max_body_bytes: config.proxy.max_body_bytes,
    });

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    tokens.close().await;
    info!("shutdown complete");
    Ok(())
}

/// GitHub token from the environment, else from the token file.
async fn resolve_credential(
    from_env: Option<Secret<String>>,
    file: Option<&CredentialFile>,
) -> Result<Option<Secret<String>>> {
    if let Some(credential) = from_env {
        info!("using GitHub token from GITHUB_TOKEN");
        return Ok(Some(credential));
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let stored = file
        .load()
        .await
        .with_context(|| format!("failed to read GitHub token from {}", file.path().display()))?;
    if stored.is_some() {
        info!(path = %file.path().display(), "using stored GitHub token");
    }
    Ok(stored)
}

/// Interactive device authorization. Ctrl+C or SIGTERM abandons the wait.
async fn device_login(client: &reqwest::Client) -> Result<Secret<String>> {
    let flow = DeviceFlow::new(client.clone());
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = async {
        let session = flow
            .request_code(&cancel)
            .await
            .context("failed to start GitHub device authorization")?;
        println!(
            "Please enter the code {} in {}",
            session.user_code, session.verification_uri
        );
        flow.poll_for_token(&session, &cancel)
            .await
            .context("GitHub device authorization did not complete")
    }
    .await;

    watcher.abort();
    result
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
