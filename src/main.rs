//! dummybridge login helper
//!
//! Serves the pages and rendezvous endpoints that let a human hand
//! credentials to the dummy test bridge, and can drive a login attempt
//! against the in-process broker for manual testing.

use anyhow::{Context, Result};
use clap::Parser;
use dummybridge_auth::{
    BrokerConfig, FlowKind, LoginAttempt, LoginStep, LoginStore, RendezvousBroker, SessionFactory,
};
use dummybridge_core::fields::{PASSWORD_FIELD, USERNAME_FIELD};
use dummybridge_core::{Config, LoginFields};
use dummybridge_server::{create_router, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Client identity used for logins started from the command line
const LOCAL_CLIENT: &str = "local";

/// dummybridge login helper - credential rendezvous for the test bridge
#[derive(Parser, Debug)]
#[command(name = "loginhelper")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Server port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Externally reachable base URL (default: http(s)://localhost:<port>)
    #[arg(long)]
    public_url: Option<String>,

    /// Seconds a wait blocks before timing out
    #[arg(long, default_value = "30")]
    wait_timeout: u64,

    /// Outstanding waits allowed per client
    #[arg(long, default_value = "5")]
    max_in_flight: usize,

    /// Portals to generate after a login completes
    #[arg(long, default_value = "0")]
    portals: usize,

    /// Members per generated portal
    #[arg(long, default_value = "2")]
    portal_members: usize,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Persist logins to this JSON file instead of keeping them in memory
    #[arg(long, conflicts_with = "persist")]
    store: Option<PathBuf>,

    /// Persist logins in the default location (~/.config/dummybridge/logins.json)
    #[arg(long)]
    persist: bool,

    /// Start a login attempt with this flow (password, cookies, localstorage, displayandwait)
    #[arg(long)]
    login: Option<FlowKind>,

    /// Username for the password, cookies and localstorage flows
    #[arg(long)]
    username: Option<String>,

    /// Password for the password, cookies and localstorage flows
    #[arg(long, default_value = "")]
    password: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let http_log = if args.verbose { "tower_http=debug" } else { "tower_http=warn" };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(log_level.into())
                .add_directive(http_log.parse()?),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("dummybridge login helper v{}", env!("CARGO_PKG_VERSION"));

    let use_tls = args.cert.is_some();
    let public_url = args.public_url.clone().unwrap_or_else(|| {
        let protocol = if use_tls { "https" } else { "http" };
        format!("{}://localhost:{}", protocol, args.port)
    });

    let config = Config::new()
        .with_bind(args.bind.clone())
        .with_port(args.port)
        .with_public_url(public_url)
        .with_wait_timeout(Duration::from_secs(args.wait_timeout))
        .with_max_in_flight(args.max_in_flight)
        .with_portals(args.portals, args.portal_members);

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .map_err(|e| dummybridge_core::Error::config(format!("Invalid listen address: {}", e)))?;

    let store = Arc::new(match (&args.store, args.persist) {
        (Some(path), _) => LoginStore::with_path(path.clone())
            .await
            .context("Failed to open login store")?,
        (None, true) => LoginStore::new()
            .await
            .context("Failed to open login store")?,
        (None, false) => LoginStore::in_memory(),
    });

    let broker = Arc::new(RendezvousBroker::new(BrokerConfig::from(&config)));
    info!(
        "Waits time out after {:?}, {} in flight per client",
        config.wait_timeout, config.max_in_flight
    );
    info!("Submit page: {}", config.page_url("daw_submit.html"));

    let login_handle = args.login.map(|flow| {
        let broker = broker.clone();
        let store = store.clone();
        let config = config.clone();
        let fields = direct_fields(&args);
        tokio::spawn(async move {
            if let Err(e) = run_login(broker, store, config, flow, fields).await {
                warn!("Login failed: {:#}", e);
            }
        })
    });

    let state = Arc::new(AppState::new(config, broker));
    let router = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    // Run server with graceful shutdown
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| dummybridge_core::Error::Tls(e.to_string()))?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        info!("Listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router)
            .await?;
    } else {
        let shutdown = async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        };

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
    }

    if let Some(handle) = login_handle {
        handle.abort();
    }

    info!("Goodbye!");
    Ok(())
}

/// Fields for the flows that take credentials directly
fn direct_fields(args: &Args) -> Option<LoginFields> {
    let username = args.username.clone()?;
    Some(LoginFields::from([
        (USERNAME_FIELD.to_string(), username),
        (PASSWORD_FIELD.to_string(), args.password.clone()),
    ]))
}

/// Drive one login attempt to completion against the local broker
async fn run_login<F: SessionFactory>(
    broker: Arc<RendezvousBroker>,
    factory: Arc<F>,
    config: Config,
    flow: FlowKind,
    fields: Option<LoginFields>,
) -> Result<()> {
    let mut attempt = LoginAttempt::new(broker, factory, config, LOCAL_CLIENT);

    let step = match attempt.start(flow)? {
        LoginStep::DisplayAndWait {
            code, instructions, ..
        } => {
            info!("Pairing code: {}", code);
            info!("{}", instructions);
            loop {
                match attempt.wait().await {
                    Ok(step) => break step,
                    Err(e) if e.is_retryable() => {
                        info!("No submission for {} yet ({}), still waiting", code, e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        LoginStep::Cookies { url, .. } => {
            info!("Values would be extracted from {}", url);
            let fields = fields
                .with_context(|| format!("--username is required for the {} flow", flow))?;
            attempt.submit_cookies(fields).await?
        }
        LoginStep::UserInput { .. } => {
            let fields = fields
                .with_context(|| format!("--username is required for the {} flow", flow))?;
            attempt.submit_user_input(fields).await?
        }
        step @ LoginStep::Complete { .. } => step,
    };

    if let LoginStep::Complete { login, .. } = &step {
        info!("Logged in as {} ({})", login.id, login.remote_name);
    }

    if let Some(automation) = attempt.take_automation() {
        let outcome = automation.await.context("Post-login automation panicked")?;
        info!("Post-login automation finished: {:?}", outcome);
    }
    Ok(())
}
