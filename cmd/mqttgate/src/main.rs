//! mqttgate - MQTT admission and authorization gate.
//!
//! Terminates TLS (client certificates checked against CRLs), authenticates
//! CONNECT and enforces per-role topic ACLs before traffic reaches the
//! in-process routing fabric.
//!
//! CRLs are re-read every `--crl-refresh` seconds. On SIGHUP both the CRLs
//! and the policy file are reloaded; a failed reload keeps the previous data.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mqttgate::{AuthMode, Gate, GateConfig, StaticDirectory, TlsSettings};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod policy;

use policy::Policy;

/// MQTT admission and authorization gate.
#[derive(Parser)]
#[command(name = "mqttgate")]
#[command(about = "MQTT gate with TLS revocation checks and topic ACLs")]
#[command(version)]
struct Cli {
    /// Listen address
    #[arg(short = 'l', long, default_value = "0.0.0.0:8883")]
    listen: String,

    /// Server certificate chain (PEM)
    #[arg(long)]
    cert: PathBuf,

    /// Server private key (PEM)
    #[arg(long)]
    key: PathBuf,

    /// CA certificates trusted for client certificates (PEM)
    #[arg(long)]
    client_ca: PathBuf,

    /// CRL file or directory of CRLs (PEM or DER)
    #[arg(long)]
    crl: PathBuf,

    /// Users and roles (YAML)
    #[arg(short = 'p', long)]
    policy: PathBuf,

    /// Seconds between CRL refreshes (0 disables)
    #[arg(long, default_value_t = 300)]
    crl_refresh: u64,

    /// How sessions are authenticated
    #[arg(long, value_enum, default_value_t = AuthArg::Password)]
    auth: AuthArg,

    /// Admit clients that present no certificate
    #[arg(long)]
    optional_client_cert: bool,

    /// Seconds allowed for the TLS handshake and for CONNECT
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Verbose output
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthArg {
    /// CONNECT username/password
    Password,
    /// Client certificate common name
    Certificate,
}

impl From<AuthArg> for AuthMode {
    fn from(arg: AuthArg) -> Self {
        match arg {
            AuthArg::Password => AuthMode::Password,
            AuthArg::Certificate => AuthMode::Certificate,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let policy = Policy::load(&cli.policy)?;
    let directory = Arc::new(policy.directory());

    let tls = TlsSettings::from_pem_files(&cli.cert, &cli.key, &cli.client_ca)
        .context("failed to load TLS material")?
        .require_client_cert(!cli.optional_client_cert);
    let timeout = Duration::from_secs(cli.timeout);
    let config = GateConfig::new(cli.listen.as_str())
        .auth_mode(cli.auth.into())
        .connect_timeout(timeout)
        .handshake_timeout(timeout);

    let gate = Gate::builder(config)
        .tls(tls)
        .crl_source(&cli.crl)
        .directory_arc(directory.clone())
        .roles(policy.roles)
        .build()
        .context("invalid gate configuration")?;
    let gate = Arc::new(gate);

    if cli.crl_refresh > 0 {
        spawn_crl_refresh(Arc::clone(&gate), Duration::from_secs(cli.crl_refresh));
    }

    #[cfg(unix)]
    spawn_hangup_reload(Arc::clone(&gate), directory, cli.policy.clone())?;

    info!("Starting mqttgate on {}", cli.listen);
    tokio::select! {
        result = gate.serve() => result.context("gate stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

fn spawn_crl_refresh(gate: Arc<Gate>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = gate.reload_revocations() {
                warn!("CRL refresh failed, keeping previous snapshot: {}", e);
            }
        }
    });
}

#[cfg(unix)]
fn spawn_hangup_reload(
    gate: Arc<Gate>,
    directory: Arc<StaticDirectory>,
    policy_path: PathBuf,
) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading");
            reload(&gate, &directory, &policy_path);
        }
    });
    Ok(())
}

/// Reload CRLs and the policy. Each part keeps its previous data on error.
fn reload(gate: &Gate, directory: &StaticDirectory, policy_path: &Path) {
    if let Err(e) = gate.reload_revocations() {
        warn!("CRL reload failed: {}", e);
    }

    let policy = match Policy::load(policy_path) {
        Ok(policy) => policy,
        Err(e) => {
            warn!("Policy reload failed: {:#}", e);
            return;
        }
    };
    match gate.reload_acl(&policy.roles) {
        Ok(generation) => {
            directory.replace(policy.directory());
            info!(
                "Policy reloaded: {} user(s), {} role(s), generation {}",
                policy.users.len(),
                policy.roles.len(),
                generation
            );
        }
        Err(e) => warn!("ACL reload failed, keeping previous policy: {}", e),
    }
}
