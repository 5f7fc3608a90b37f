//! Keyless signing server - main entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keyless_config::Config;
use keyless_server::acme::{account, order};
use keyless_server::{
    api, dns, keys, replica, tls, ApiCertCell, CertResolver, ChallengeBroker, ChallengeKind,
    KeyStore, RenewalScheduler, Signer, ZoneAuthority,
};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Keyless TLS signing server with built-in authoritative DNS and ACME renewal
#[derive(Parser, Debug)]
#[command(name = "keyless-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "KEYLESS_CONFIG",
        default_value = "keyless.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the server (default)
    Run,
    /// Register the ACME account, create missing keys and obtain the
    /// wildcard certificate
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;

    match cli.command {
        Some(Commands::Init) => init(Arc::new(config)).await,
        Some(Commands::Run) | None => run(Arc::new(config)).await,
    }
}

// ============================================================================
// Run
// ============================================================================

async fn run(config: Arc<Config>) -> Result<()> {
    // Leaves first: keys, then stored ACME state, then listeners.
    let keys = Arc::new(
        KeyStore::load(&config.master_key, config.legacy_keys.as_deref())
            .context("failed to load signing keys; please run: keyless-server init")?,
    );

    account::check(&config.letsencrypt)
        .context("letsencrypt account is not usable; please run: keyless-server init")?;
    verify_signing_bundle(&config, &keys)
        .context("signing certificate is not usable; please run: keyless-server init")?;

    let broker = ChallengeBroker::new();

    let api_key = Signer::from_file(&config.api.key)
        .context("api key is not usable; please run: keyless-server init")?;
    let initial_bundle = match tls::load_certified_key(&config.api.certificate, &config.api.key) {
        Ok(certified) => Some(Arc::new(certified)),
        // First boot: the key exists but the certificate does not yet. The
        // resolver serves a self-signed stand-in until renewal writes one.
        Err(_) if !config.api.certificate.exists() => None,
        Err(e) => return Err(e).context("failed to load api certificate"),
    };
    let cell = ApiCertCell::new(initial_bundle);

    let resolver = Arc::new(CertResolver::new(
        cell.clone(),
        broker.clone(),
        api_key.to_pkcs8_der()?,
    ));
    let tls_config = Arc::new(
        tls::build_server_config(resolver, config.api.client_ca.as_deref())
            .context("failed to build TLS configuration")?,
    );

    let authority = Arc::new(
        ZoneAuthority::new(
            &config.zone(),
            &config.nameserver_host(),
            config.cname.as_deref(),
            broker.clone(),
            config.replica.clone(),
        )
        .context("invalid zone configuration")?,
    );

    let state = api::ApiState {
        keys,
        broker: broker.clone(),
        certificate_path: config.certificate.clone(),
    };
    let app = api::router(state, &config.api_path_prefix());

    // Socket activation hands us up to three listeners: HTTPS, DNS, replica.
    // Without an activator, HTTPS and DNS bind loopback defaults and the
    // replica loop stays off.
    let mut fds = listenfd::ListenFd::from_env();
    let https_listener = match fds.take_tcp_listener(0).context("activation fd 0")? {
        Some(listener) => listener,
        None => std::net::TcpListener::bind("localhost:8080")
            .context("failed to bind https listener")?,
    };
    https_listener.set_nonblocking(true)?;
    let dns_socket = match fds.take_udp_socket(1).context("activation fd 1")? {
        Some(socket) => {
            socket.set_nonblocking(true)?;
            UdpSocket::from_std(socket)?
        }
        None => UdpSocket::bind("localhost:5353")
            .await
            .context("failed to bind dns socket")?,
    };
    let replica_socket = match fds.take_udp_socket(2).context("activation fd 2")? {
        Some(socket) => {
            socket.set_nonblocking(true)?;
            Some(UdpSocket::from_std(socket)?)
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(api::serve(
        https_listener,
        tls_config,
        app,
        shutdown_rx.clone(),
    ));
    tasks.spawn(dns::serve(dns_socket, authority, shutdown_rx.clone()));
    if let Some(socket) = replica_socket {
        tasks.spawn(replica::serve(socket, broker.clone(), shutdown_rx.clone()));
    }
    tasks.spawn(RenewalScheduler::new(config.clone(), broker, cell).run(shutdown_rx));

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);
    info!(zone = %config.zone(), "keyless server ready");

    wait_for_signal().await?;
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);

    // Drain gracefully, unbounded; a second signal terminates immediately.
    tokio::select! {
        _ = async { while tasks.join_next().await.is_some() {} } => {}
        _ = wait_for_signal() => bail!("received second signal, terminating"),
    }

    Ok(())
}

/// The wildcard chain must parse and its leaf must be backed by a loaded key.
fn verify_signing_bundle(config: &Config, keys: &KeyStore) -> Result<()> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let file = std::fs::File::open(&config.certificate)
        .with_context(|| format!("failed to open {}", config.certificate.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let leaf = rustls_pemfile::certs(&mut reader)
        .next()
        .context("certificate file holds no certificates")?
        .context("certificate file is not valid PEM")?;

    let (_, parsed) =
        X509Certificate::from_der(leaf.as_ref()).ok().context("failed to parse leaf certificate")?;
    let fingerprint = keys::spki_fingerprint(parsed.public_key().raw);
    if !keys.contains(&fingerprint) {
        bail!("certificate public key matches no loaded signing key");
    }
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
    Ok(())
}

// ============================================================================
// Init
// ============================================================================

/// Non-interactive setup: account, keys, then the wildcard certificate via
/// DNS-01 with the zone engine answering validation queries.
async fn init(config: Arc<Config>) -> Result<()> {
    let account = account::load_or_bootstrap(&config.letsencrypt)
        .await
        .context("failed to set up the ACME account")?;

    let master = keys::create_key_if_missing("master", &config.master_key)?;
    keys::create_key_if_missing("api", &config.api.key)?;

    let broker = ChallengeBroker::new();
    let authority = Arc::new(
        ZoneAuthority::new(
            &config.zone(),
            &config.nameserver_host(),
            config.cname.as_deref(),
            broker.clone(),
            config.replica.clone(),
        )
        .context("invalid zone configuration")?,
    );

    let socket = match UdpSocket::bind((config.nameserver_host(), 53)).await {
        Ok(socket) => socket,
        Err(first) => UdpSocket::bind("0.0.0.0:53")
            .await
            .map_err(|_| first)
            .context("failed to bind udp 53 for domain validation")?,
    };
    info!(
        zone = %config.zone(),
        nameserver = %config.nameserver_host(),
        "dns server listening for domain validation; NS records for the zone \
         must point at this host and UDP 53 must be reachable"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dns_task = tokio::spawn(dns::serve(socket, authority, shutdown_rx));

    let hostname = format!("*.{}", config.zone());
    info!(hostname, "obtaining the signing certificate");
    let chain = order::obtain(
        &account,
        &broker,
        &master,
        &hostname,
        &[ChallengeKind::Dns01],
    )
    .await
    .context("failed to obtain the signing certificate")?;
    order::write_chain(&config.certificate, &chain)?;

    let _ = shutdown_tx.send(true);
    let _ = dns_task.await;

    info!(path = %config.certificate.display(), "setup complete");
    Ok(())
}
