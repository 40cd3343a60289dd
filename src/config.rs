//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding and database pool settings
//! - Ledger RPC and social API endpoints
//! - Verification limits, payout retry policy and sweep intervals
//! - Weekly prize pool parameters
//!
//! Secrets never live in the file; they come from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::TokenAmount;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub social: SocialConfig,
    pub verification: VerificationConfig,
    pub payout: PayoutConfig,
    pub sweeps: SweepConfig,
    pub prizes: PrizeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database pool configuration (URL comes from DATABASE_URL)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub pool_max_size: usize,
    pub query_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            pool_max_size: 20,
            query_timeout_secs: 30,
        }
    }
}

/// On-chain ledger RPC (balance reads and transfer sends)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub call_timeout_secs: u64,
    /// Token used for platform-funded prize payouts
    pub prize_mint: String,
}

impl LedgerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialConfig {
    pub api_url: String,
    pub call_timeout_secs: u64,
}

impl SocialConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Upper bound for any single eligibility or proof lookup
    pub external_timeout_secs: u64,
    /// A `pending` execution older than this may be resumed by a new verify call
    pub pending_resume_after_secs: u64,
    pub rate_limit_per_minute: u32,
    pub min_reputation: i64,
}

impl VerificationConfig {
    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    pub max_retries: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// How long a transfer may stay in flight before reconciliation
    pub in_flight_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub holding_interval_secs: u64,
    pub retry_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub reservation_grace_secs: u64,
    pub prize_interval_secs: u64,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrizeConfig {
    /// Fee paid per campaign launch, in reward tokens
    pub creation_fee: TokenAmount,
    /// Share of creation fees paid back as weekly prizes
    pub rewards_percent: u32,
    /// Prize share per rank in basis points; its length is the winner count
    pub rank_shares_bps: Vec<u32>,
    pub points_per_paid_action: i64,
}

impl Config {
    /// Load from REWARDS_CONFIG, ./config.toml or the embedded defaults
    pub fn load() -> Result<Self> {
        let path = std::env::var("REWARDS_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let mut config = Self::load_from(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    /// Environment variables take precedence over the file
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("REWARDS_HOST") {
            self.server.host = host;
        }
        if let Some(port) = std::env::var("REWARDS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.server.port = port;
        }
        if let Ok(url) = std::env::var("LEDGER_RPC_URL") {
            self.ledger.rpc_url = url;
        }
        if let Ok(url) = std::env::var("SOCIAL_API_URL") {
            self.social.api_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let total: u32 = self.prizes.rank_shares_bps.iter().sum();
        if total > 10_000 {
            anyhow::bail!("prizes.rank_shares_bps sums to {} (> 10000)", total);
        }
        if self.prizes.rewards_percent > 100 {
            anyhow::bail!("prizes.rewards_percent must be <= 100");
        }
        if self.payout.max_retries == 0 {
            anyhow::bail!("payout.max_retries must be at least 1");
        }
        Ok(())
    }

    /// Token required on admin endpoints (unset disables them)
    pub fn admin_token() -> Option<String> {
        std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty())
    }

    /// Secret used to sign website visit receipts
    pub fn receipt_secret() -> Option<String> {
        std::env::var("RECEIPT_SECRET").ok().filter(|t| !t.is_empty())
    }

    pub fn social_api_token() -> Option<String> {
        std::env::var("SOCIAL_API_TOKEN").ok().filter(|t| !t.is_empty())
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded default config is checked by tests; the fallback only
        // guards against a broken edit of config.toml.
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|_| Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig::default(),
            ledger: LedgerConfig {
                rpc_url: "http://127.0.0.1:8899".to_string(),
                call_timeout_secs: 20,
                prize_mint: WRAPPED_SOL_MINT.to_string(),
            },
            social: SocialConfig {
                api_url: "https://api.twitter.com/2".to_string(),
                call_timeout_secs: 10,
            },
            verification: VerificationConfig {
                external_timeout_secs: 15,
                pending_resume_after_secs: 120,
                rate_limit_per_minute: 10,
                min_reputation: 50,
            },
            payout: PayoutConfig {
                max_retries: 5,
                backoff_base_secs: 15,
                backoff_max_secs: 1800,
                in_flight_grace_secs: 300,
            },
            sweeps: SweepConfig {
                holding_interval_secs: 600,
                retry_interval_secs: 60,
                cleanup_interval_secs: 900,
                reservation_grace_secs: 3600,
                prize_interval_secs: 3600,
                batch_size: 100,
            },
            prizes: PrizeConfig {
                creation_fee: TokenAmount::from_tokens(10_000),
                rewards_percent: 40,
                rank_shares_bps: vec![5000, 3000, 2000],
                points_per_paid_action: 10,
            },
        })
    }
}
