//! Configuration module for tuition-invoicing.

use crate::services::CommitMode;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct InvoicingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub commit: CommitConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CommitConfig {
    /// Mode used when a save request does not ask for one.
    pub default_mode: CommitMode,
}

impl InvoicingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let default_mode = match env::var("COMMIT_MODE") {
            Ok(raw) => CommitMode::from_string(&raw).ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "COMMIT_MODE must be 'best_effort' or 'atomic', got '{}'",
                    raw
                ))
            })?,
            Err(_) => CommitMode::default(),
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "tuition-invoicing".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            commit: CommitConfig { default_mode },
        })
    }
}
