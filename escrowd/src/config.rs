//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use escrow_domain::{LedgerAddress, UserId};
use escrow_exec::ConfirmationPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Ledger gateway configuration
    pub gateway: GatewayConfig,

    /// Confirmation and reconciliation timings
    pub ledger: LedgerConfig,

    /// Static user → ledger address table for the identity resolver
    pub identity_bindings: Vec<(UserId, LedgerAddress)>,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Ledger gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the REST gateway
    pub url: String,
    /// API key
    pub api_key: String,
    /// API secret used for request signing
    pub api_secret: String,
}

/// Confirmation and reconciliation timings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Primary receipt wait
    pub confirm_timeout: Duration,
    /// Confirmations required
    pub confirmations: u32,
    /// Fallback poll attempts after the primary wait
    pub poll_attempts: u32,
    /// Delay between fallback polls
    pub poll_delay: Duration,
    /// Age after which an in-flight marker is reconciled
    pub reconcile_grace: Duration,
    /// Period of the background stale-marker sweep
    pub reconcile_interval: Duration,
    /// Re-poll attempts the reconciler makes per transaction
    pub reconcile_poll_attempts: u32,
}

impl LedgerConfig {
    /// Policy used by the orchestrator for fresh submissions
    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            timeout: self.confirm_timeout,
            confirmations: self.confirmations,
            poll_attempts: self.poll_attempts,
            poll_delay: self.poll_delay,
        }
    }

    /// Policy used by the reconciler to re-poll a recorded transaction
    pub fn reconcile_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy::poll_only(self.confirmations, self.reconcile_poll_attempts, self.poll_delay)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> DaemonResult<()> {
        if self.confirmations == 0 {
            return Err(DaemonError::Config("ESCROW_CONFIRMATIONS must be at least 1".to_string()));
        }
        if self.reconcile_interval.is_zero() {
            return Err(DaemonError::Config(
                "ESCROW_RECONCILE_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(60),
            confirmations: 1,
            poll_attempts: 10,
            poll_delay: Duration::from_millis(3000),
            reconcile_grace: Duration::from_secs(120),
            reconcile_interval: Duration::from_secs(60),
            reconcile_poll_attempts: 5,
        }
    }
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses the stub ledger)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let api = Self::load_api_config()?;
        let gateway = Self::load_gateway_config(environment)?;
        let ledger = Self::load_ledger_config()?;
        let identity_bindings = match env::var("ESCROW_IDENTITY_BINDINGS") {
            Ok(raw) => Self::parse_identity_bindings(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            api,
            gateway,
            ledger,
            identity_bindings,
            environment,
        })
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            gateway: GatewayConfig {
                url: "http://127.0.0.1:8545".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
            },
            ledger: LedgerConfig {
                confirm_timeout: Duration::from_millis(50),
                confirmations: 1,
                poll_attempts: 3,
                poll_delay: Duration::from_millis(10),
                reconcile_grace: Duration::from_secs(5),
                reconcile_interval: Duration::from_millis(100),
                reconcile_poll_attempts: 2,
            },
            identity_bindings: Vec::new(),
            environment: Environment::Test,
        }
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("ESCROW_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid ESCROW_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("ESCROW_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = Self::load_parsed_env("ESCROW_API_PORT", 8080u16)?;

        Ok(ApiConfig { host, port })
    }

    fn load_gateway_config(environment: Environment) -> DaemonResult<GatewayConfig> {
        let url = env::var("ESCROW_GATEWAY_URL").unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
        let api_key = env::var("ESCROW_GATEWAY_API_KEY").unwrap_or_default();
        let api_secret = env::var("ESCROW_GATEWAY_API_SECRET").unwrap_or_default();

        if environment == Environment::Production && (api_key.is_empty() || api_secret.is_empty()) {
            return Err(DaemonError::Config(
                "ESCROW_GATEWAY_API_KEY and ESCROW_GATEWAY_API_SECRET are required in production"
                    .to_string(),
            ));
        }

        Ok(GatewayConfig {
            url,
            api_key,
            api_secret,
        })
    }

    fn load_ledger_config() -> DaemonResult<LedgerConfig> {
        let defaults = LedgerConfig::default();

        let ledger = LedgerConfig {
            confirm_timeout: Duration::from_secs(Self::load_parsed_env(
                "ESCROW_CONFIRM_TIMEOUT_SECS",
                defaults.confirm_timeout.as_secs(),
            )?),
            confirmations: Self::load_parsed_env("ESCROW_CONFIRMATIONS", defaults.confirmations)?,
            poll_attempts: Self::load_parsed_env("ESCROW_POLL_ATTEMPTS", defaults.poll_attempts)?,
            poll_delay: Duration::from_millis(Self::load_parsed_env(
                "ESCROW_POLL_DELAY_MS",
                defaults.poll_delay.as_millis() as u64,
            )?),
            reconcile_grace: Duration::from_secs(Self::load_parsed_env(
                "ESCROW_RECONCILE_GRACE_SECS",
                defaults.reconcile_grace.as_secs(),
            )?),
            reconcile_interval: Duration::from_secs(Self::load_parsed_env(
                "ESCROW_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )?),
            reconcile_poll_attempts: Self::load_parsed_env(
                "ESCROW_RECONCILE_POLL_ATTEMPTS",
                defaults.reconcile_poll_attempts,
            )?,
        };

        ledger.validate()?;
        Ok(ledger)
    }

    /// Parse `user=address` pairs separated by commas.
    fn parse_identity_bindings(raw: &str) -> DaemonResult<Vec<(UserId, LedgerAddress)>> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (user, address) = entry.split_once('=').ok_or_else(|| {
                    DaemonError::Config(format!("Invalid ESCROW_IDENTITY_BINDINGS entry: {}", entry))
                })?;
                let user = UserId::parse_str(user.trim())
                    .map_err(|e| DaemonError::Config(format!("Invalid user id {}: {}", user, e)))?;
                let address = LedgerAddress::new(address.trim())?;
                Ok((user, address))
            })
            .collect()
    }

    fn load_parsed_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
        match env::var(key) {
            Ok(val) => val
                .trim()
                .parse::<T>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            gateway: GatewayConfig {
                url: "http://127.0.0.1:8545".to_string(),
                api_key: String::new(),
                api_secret: String::new(),
            },
            ledger: LedgerConfig::default(),
            identity_bindings: Vec::new(),
            environment: Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
