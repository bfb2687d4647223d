use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use execution_authority_backend::{BackendClient, BreakerConfig};
use execution_authority_core::signing::MIN_PRODUCTION_SECRET_BYTES;
use execution_authority_core::SigningKey;
use tracing_subscriber::EnvFilter;

mod authority;
mod correlation;
mod http;

use authority::ExecutionAuthority;
use http::{app, ServiceState};

const DEV_FALLBACK_SECRET: &str = "execution-authority-dev-secret-do-not-deploy";

#[derive(Debug, Clone, Parser)]
#[command(name = "execution-authority-service")]
#[command(about = "HTTP service that mints, signs and validates execution authority")]
struct Args {
    #[arg(long, env = "EXECUTION_AUTHORITY_DB", default_value = "./execution_authority.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "EXECUTION_AUTHORITY_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "EXECUTION_AUTHORITY_SECRET", hide_env_values = true)]
    signing_secret: Option<String>,
    #[arg(long, env = "EXECUTION_AUTHORITY_PRODUCTION_MODE", default_value_t = false)]
    production: bool,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "VECTOR_BACKEND_URL", default_value = "http://127.0.0.1:6333")]
    vector_backend_url: String,
    #[arg(long, default_value_t = 2000)]
    vector_timeout_ms: u64,
    #[arg(long, default_value_t = 5)]
    breaker_failure_threshold: u32,
    #[arg(long, default_value_t = 30_000)]
    breaker_cooldown_ms: u64,
    #[arg(long, default_value = "info")]
    log: String,
}

/// Resolves the signing key. Production refuses weak or missing secrets.
fn resolve_signing_key(args: &Args) -> Result<SigningKey> {
    let secret = args.signing_secret.as_deref().map(str::trim).filter(|secret| !secret.is_empty());
    match secret {
        Some(secret) => {
            let key = SigningKey::new(secret.as_bytes().to_vec());
            if !key.is_production_strength() {
                if args.production {
                    bail!(
                        "signing secret must be at least {MIN_PRODUCTION_SECRET_BYTES} bytes \
                         in production mode"
                    );
                }
                tracing::warn!(
                    secret_len = key.len(),
                    "signing secret is shorter than the production minimum"
                );
            }
            Ok(key)
        }
        None if args.production => {
            bail!("EXECUTION_AUTHORITY_SECRET is required in production mode")
        }
        None => {
            tracing::warn!("no signing secret configured; using the development fallback secret");
            Ok(SigningKey::new(DEV_FALLBACK_SECRET.as_bytes().to_vec()))
        }
    }
}

/// Migrates the ledger and checks that its protective constraints exist.
fn prepare_authority(args: &Args) -> Result<ExecutionAuthority> {
    let authority = ExecutionAuthority::new(args.db.clone(), resolve_signing_key(args)?);
    authority.migrate()?;

    let constraints = authority.verify_constraints()?;
    if !constraints.is_complete() {
        let missing = constraints.missing().join(", ");
        if args.production {
            bail!("ledger constraints missing: {missing}");
        }
        tracing::warn!(
            missing = %missing,
            "ledger constraints missing; idempotency is not enforced"
        );
    }
    Ok(authority)
}

fn build_state(args: &Args) -> Result<ServiceState> {
    let authority = prepare_authority(args)?;
    let backend = BackendClient::http(
        args.vector_backend_url.clone(),
        Duration::from_millis(args.vector_timeout_ms),
        BreakerConfig {
            failure_threshold: args.breaker_failure_threshold.max(1),
            cooldown: Duration::from_millis(args.breaker_cooldown_ms),
        },
    );
    Ok(ServiceState::new(
        authority,
        Arc::new(backend),
        Duration::from_millis(args.operation_timeout_ms),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&args.log)).init();

    let state = build_state(&args)?;
    tracing::info!(
        bind = %args.bind,
        db = %args.db.display(),
        production = args.production,
        vector_backend = %args.vector_backend_url,
        "execution authority starting"
    );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}
