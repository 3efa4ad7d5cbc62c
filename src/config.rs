//! Configuration management for the escrow relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub ledger: LedgerConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_confirmations")]
    pub required_confirmations: u64,
    /// Platform fee in basis points of the deposit (100 = 1%)
    #[serde(default = "default_fee_bps")]
    pub fee_basis_points: u32,
    #[serde(default = "default_complete_retention")]
    pub complete_retention_secs: u64,
    #[serde(default = "default_failed_retention")]
    pub failed_retention_secs: u64,
    #[serde(default = "default_forward_stale")]
    pub forward_stale_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

#[derive(Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Expected chain id; signing is refused if the node reports another one
    pub chain_id: Option<u64>,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            required_confirmations: default_confirmations(),
            fee_basis_points: default_fee_bps(),
            complete_retention_secs: default_complete_retention(),
            failed_retention_secs: default_failed_retention(),
            forward_stale_after_secs: default_forward_stale(),
        }
    }
}

impl ApiConfig {
    /// Admin token, treating an empty value (e.g. an unset `${VAR}`) as absent
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_token", &self.admin_token().map(|_| "[REDACTED]"))
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_confirmations() -> u64 {
    3
}

fn default_fee_bps() -> u32 {
    100
}

fn default_complete_retention() -> u64 {
    60
}

fn default_failed_retention() -> u64 {
    300
}

fn default_forward_stale() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    30
}

fn default_private_key_env() -> String {
    "ADMIN_PRIVATE_KEY".to_string()
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("ESCROW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        // Unset ${VAR} placeholders leave empty strings behind
        settings.chain.rpc_urls.retain(|url| !url.trim().is_empty());

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("No RPC URLs configured");
        }

        if self.relayer.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than zero");
        }

        if self.relayer.fee_basis_points > 10_000 {
            anyhow::bail!(
                "fee_basis_points must be at most 10000, got {}",
                self.relayer.fee_basis_points
            );
        }

        if self.api.admin_token().is_none() {
            tracing::warn!("No admin token configured - admin endpoints will deny all requests");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [relayer]
        poll_interval_secs = 15
        required_confirmations = 6

        [ledger]
        path = "data/transactions.json"

        [api]
        host = "0.0.0.0"
        port = 10000
        admin_token = "${ESCROW_TEST_ADMIN_TOKEN_UNSET}"

        [metrics]
        enabled = false
        port = 9090

        [chain]
        chain_id = 11155111
        rpc_urls = ["https://rpc.sepolia.example", "${ESCROW_TEST_RPC_UNSET}"]
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("ESCROW_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${ESCROW_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_and_empty_placeholders() {
        let settings = Settings::from_toml(SAMPLE).unwrap();

        assert_eq!(settings.relayer.poll_interval_secs, 15);
        assert_eq!(settings.relayer.required_confirmations, 6);
        assert_eq!(settings.relayer.fee_basis_points, 100);
        assert_eq!(settings.relayer.complete_retention_secs, 60);
        assert_eq!(settings.relayer.failed_retention_secs, 300);
        assert_eq!(settings.chain.rpc_urls.len(), 1);
        assert_eq!(settings.wallet.private_key_env, "ADMIN_PRIVATE_KEY");
        assert!(settings.api.admin_token().is_none());
    }

    #[test]
    fn test_rejects_fee_above_100_percent() {
        let raw = SAMPLE.replace(
            "required_confirmations = 6",
            "required_confirmations = 6\nfee_basis_points = 10001",
        );
        assert!(Settings::from_toml(&raw).is_err());
    }

    #[test]
    fn test_debug_redacts_admin_token() {
        let api = ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            admin_token: Some("super-secret".to_string()),
            cors_origins: vec![],
        };
        let rendered = format!("{:?}", api);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("REDACTED"));
    }
}
