//! Authn Token Issuer
//!
//! Command line front end for issuing, verifying, refreshing and revoking
//! session and identity tokens against a persistent refresh token store.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use authn_issuer::clock::{Clock, SystemClock};
use authn_issuer::config::{IssuerConfig, IssuerConfigJson};
use authn_issuer::refresh::{
    spawn_cleanup_task, sweep_once, RedbRefreshTokenStore, RefreshTokenId, RefreshTokenStore,
};
use authn_issuer::tokens::{IdentityPublicKey, IdentityVerifier};
use authn_issuer::transport::{error_response, issue_response, refresh_response};
use authn_issuer::{Account, AccountId, TokenIssuer};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "authn-issuer")]
#[command(about = "Session and identity token issuer")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "AUTHN_CONFIG")]
    config: Option<PathBuf>,

    /// Public URL of this service
    #[arg(long, env = "AUTHN_URL")]
    authn_url: Option<String>,

    /// Audience of identity tokens (defaults to the service URL)
    #[arg(long, env = "AUTHN_IDENTITY_AUDIENCE")]
    identity_audience: Option<String>,

    /// Session signing secret (base64 or raw, at least 32 bytes)
    #[arg(long, env = "AUTHN_SESSION_SIGNING_KEY", hide_env_values = true)]
    session_signing_key: Option<String>,

    /// Identity signing key file (RSA private key, PEM)
    #[arg(long, env = "AUTHN_IDENTITY_SIGNING_KEY")]
    identity_signing_key: Option<PathBuf>,

    /// Identity public key file (RSA public key, PEM)
    #[arg(long, env = "AUTHN_IDENTITY_PUBLIC_KEY")]
    identity_public_key: Option<PathBuf>,

    /// Session TTL in seconds
    #[arg(long, env = "AUTHN_SESSION_TTL")]
    session_ttl: Option<u64>,

    /// Identity token TTL in seconds
    #[arg(long, env = "AUTHN_IDENTITY_TTL")]
    identity_ttl: Option<u64>,

    /// Session cookie name
    #[arg(long, env = "AUTHN_COOKIE_NAME")]
    cookie_name: Option<String>,

    /// Path the service is mounted at
    #[arg(long, env = "AUTHN_MOUNTED_PATH")]
    mounted_path: Option<String>,

    /// Mark the session cookie Secure
    #[arg(long, env = "AUTHN_FORCE_SSL")]
    force_ssl: Option<bool>,

    /// Refresh token database file
    #[arg(long, env = "AUTHN_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Seconds between expired-record sweeps
    #[arg(long, env = "AUTHN_CLEANUP_INTERVAL")]
    cleanup_interval: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, env = "AUTHN_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Issue a session and identity token for an authenticated account
    Issue {
        account_id: AccountId,
        #[arg(long, default_value = "")]
        username: String,
    },
    /// Verify a session token and print its account id
    Verify { session_token: String },
    /// Mint a fresh identity token from a session token
    Refresh { session_token: String },
    /// Revoke the session behind a session token
    Logout { session_token: String },
    /// Revoke a refresh record by id
    Revoke { refresh_id: String },
    /// Revoke every session of an account
    RevokeAccount { account_id: AccountId },
    /// Print the identity public key
    PublicKey,
    /// Verify an identity token offline, as a relying party would
    VerifyIdentity {
        identity_token: String,
        /// Public key file (defaults to the configured identity public key)
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
    /// Purge expired refresh records
    Sweep {
        /// Run a single pass instead of the periodic task
        #[arg(long)]
        once: bool,
    },
}

/// Build configuration: defaults, then the JSON file, then flags.
fn build_config(args: &Args) -> Result<IssuerConfig> {
    let mut config = IssuerConfig::default();

    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let overlay: IssuerConfigJson = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        overlay.apply_to(&mut config);
    }

    if let Some(url) = &args.authn_url {
        config.authn_url = url.clone();
    }
    if let Some(aud) = &args.identity_audience {
        config.identity_audience = Some(aud.clone());
    }
    if let Some(key) = &args.session_signing_key {
        config.session_signing_key = Some(key.clone());
    }
    if let Some(path) = &args.identity_signing_key {
        config.identity_signing_key_path = Some(path.clone());
        config.identity_signing_key_inline = None;
    }
    if let Some(path) = &args.identity_public_key {
        config.identity_public_key_path = Some(path.clone());
        config.identity_public_key_inline = None;
    }
    if let Some(ttl) = args.session_ttl {
        config.session_ttl_secs = ttl;
    }
    if let Some(ttl) = args.identity_ttl {
        config.identity_ttl_secs = ttl;
    }
    if let Some(name) = &args.cookie_name {
        config.session_cookie_name = name.clone();
    }
    if let Some(path) = &args.mounted_path {
        config.mounted_path = path.clone();
    }
    if let Some(force_ssl) = args.force_ssl {
        config.force_ssl = force_ssl;
    }
    if let Some(path) = &args.store_path {
        config.store_path = path.clone();
    }
    if let Some(secs) = args.cleanup_interval {
        config.cleanup_interval_secs = secs;
    }

    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    Ok(config)
}

fn configured_public_key(config: &IssuerConfig) -> Result<IdentityPublicKey> {
    match (&config.identity_public_key_inline, &config.identity_public_key_path) {
        (Some(pem), _) => IdentityPublicKey::from_pem(pem),
        (None, Some(path)) => IdentityPublicKey::load(path),
        (None, None) => Err(anyhow!("Identity public key must be configured")),
    }
}

fn open_store(config: &IssuerConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn RefreshTokenStore>> {
    let store = RedbRefreshTokenStore::open(
        config.store_path.clone(),
        config.session_ttl_secs,
        clock,
    )?;
    Ok(Arc::new(store))
}

fn open_issuer(config: &IssuerConfig, clock: Arc<dyn Clock>) -> Result<TokenIssuer> {
    let store = open_store(config, clock.clone())?;
    TokenIssuer::from_config(config, store, clock)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = build_config(&args)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!(
        authn_url = %config.authn_url,
        identity_audience = %config.identity_audience(),
        session_ttl_secs = config.session_ttl_secs,
        identity_ttl_secs = config.identity_ttl_secs,
        "Configuration loaded"
    );

    match args.command {
        Command::Issue {
            account_id,
            username,
        } => {
            let issuer = open_issuer(&config, clock)?;
            let account = Account::new(account_id, username);
            match issuer.issue_all(&account) {
                Ok(tokens) => print_json(&issue_response(&config, &tokens)?)?,
                Err(e) => {
                    print_json(&error_response())?;
                    return Err(e.into());
                }
            }
        }
        Command::Verify { session_token } => {
            let issuer = open_issuer(&config, clock)?;
            let account_id = issuer.verify_session(&session_token)?;
            print_json(&serde_json::json!({ "account_id": account_id }))?;
        }
        Command::Refresh { session_token } => {
            let issuer = open_issuer(&config, clock)?;
            let identity = issuer.refresh_identity(&session_token)?;
            print_json(&refresh_response(&config, &identity.token)?)?;
        }
        Command::Logout { session_token } => {
            let issuer = open_issuer(&config, clock)?;
            let revoked = issuer.logout(&session_token)?;
            print_json(&serde_json::json!({ "revoked": revoked }))?;
        }
        Command::Revoke { refresh_id } => {
            let id = RefreshTokenId::from_hex(&refresh_id)
                .ok_or_else(|| anyhow!("Invalid refresh id: {:?}", refresh_id))?;
            let store = open_store(&config, clock)?;
            let revoked = store.revoke(&id)?;
            print_json(&serde_json::json!({ "revoked": revoked }))?;
        }
        Command::RevokeAccount { account_id } => {
            let issuer = open_issuer(&config, clock)?;
            let revoked = issuer.revoke_account(account_id)?;
            print_json(&serde_json::json!({ "revoked": revoked }))?;
        }
        Command::PublicKey => {
            let issuer = open_issuer(&config, clock)?;
            print!("{}", issuer.identity_public_key().pem());
        }
        Command::VerifyIdentity {
            identity_token,
            public_key,
        } => {
            // Relying-party check; needs neither the store nor the signing key.
            let public_key = match public_key {
                Some(path) => IdentityPublicKey::load(&path)?,
                None => configured_public_key(&config)?,
            };
            let verifier = IdentityVerifier::new(
                public_key,
                clock,
                config.authn_url.clone(),
                config.identity_audience(),
            );
            let claims = verifier.verify(&identity_token)?;
            print_json(&claims)?;
        }
        Command::Sweep { once: true } => {
            let store = open_store(&config, clock)?;
            let evicted = sweep_once(store.as_ref());
            print_json(&serde_json::json!({ "evicted": evicted }))?;
        }
        Command::Sweep { once: false } => {
            let store = open_store(&config, clock)?;
            info!(
                interval_secs = config.cleanup_interval_secs,
                "Starting refresh token cleanup task"
            );
            let handle = spawn_cleanup_task(store, config.cleanup_interval_secs);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            handle.abort();
            info!("Cleanup task stopped");
        }
    }

    Ok(())
}
