use std::time::Duration;

use anyhow::{bail, Context, Result};
use secrecy::SecretString;

/// Which `BillingStore` implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local store. State is lost on restart; for local runs only.
    Memory,
}

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub webhook_secret: SecretString,
    pub webhook_tolerance: Duration,
    pub webhook_max_retries: i32,
    pub webhook_lease: Duration,
    pub store_timeout: Duration,
    /// `None` disables the background renewal / reprocessing sweep.
    pub sweep_interval: Option<Duration>,
    pub tier_catalog_path: Option<String>,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let store_backend = match lookup("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{other}'"),
        };

        let database_url = lookup("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            bail!("Required environment variable 'DATABASE_URL' is not set");
        }

        let webhook_secret = lookup("BILLING_WEBHOOK_SECRET").with_context(|| {
            "Required environment variable 'BILLING_WEBHOOK_SECRET' is not set"
        })?;

        let sweep_secs: u64 = parse_or(&lookup, "SWEEP_INTERVAL_SECS", 300)?;

        Ok(Config {
            store_backend,
            database_url,
            webhook_secret: SecretString::new(webhook_secret),
            webhook_tolerance: Duration::from_secs(parse_or(&lookup, "WEBHOOK_TOLERANCE_SECS", 300)?),
            webhook_max_retries: parse_or(&lookup, "WEBHOOK_MAX_RETRIES", 5)?,
            webhook_lease: Duration::from_secs(parse_or(&lookup, "WEBHOOK_LEASE_SECS", 60)?),
            store_timeout: Duration::from_millis(parse_or(&lookup, "STORE_TIMEOUT_MS", 2000)?),
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            tier_catalog_path: lookup("TIER_CATALOG_PATH"),
            port: parse_or(&lookup, "PORT", 8080)?,
            rust_log: lookup("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// In-memory configuration for router and service tests.
    #[cfg(test)]
    pub fn for_tests(webhook_secret: &str) -> Self {
        Self::from_lookup(|key| match key {
            "STORE_BACKEND" => Some("memory".to_string()),
            "BILLING_WEBHOOK_SECRET" => Some(webhook_secret.to_string()),
            "SWEEP_INTERVAL_SECS" => Some("0".to_string()),
            _ => None,
        })
        .expect("test config is valid")
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        None => Ok(default),
    }
}
