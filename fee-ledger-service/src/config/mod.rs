//! Configuration module for fee-ledger-service.

use crate::services::BalancePolicy;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct FeeLedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreBackend,
    pub notification: NotificationConfig,
    pub balance: BalancePolicy,
}

/// Where the ledger lives.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Postgres(DatabaseConfig),
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    /// Base URL of the notification service. Notices are only logged when unset.
    pub url: Option<String>,
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl FeeLedgerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let store = match env::var("LEDGER_STORE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres(DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed_or("DATABASE_MIN_CONNECTIONS", 2),
            }),
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "LEDGER_STORE must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let defaults = BalancePolicy::default();

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "fee-ledger-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            store,
            notification: NotificationConfig {
                url: env::var("NOTIFICATION_SERVICE_URL")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
            balance: BalancePolicy {
                grace_period_days: parsed_or("OVERDUE_GRACE_DAYS", defaults.grace_period_days),
                exam_card_threshold_pct: parsed_or(
                    "EXAM_CARD_THRESHOLD_PCT",
                    defaults.exam_card_threshold_pct,
                ),
            },
        })
    }
}
