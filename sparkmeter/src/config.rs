//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The configuration file path defaults to `config.yaml` but can
//! be specified via `-f` flag or the `SPARKMETER_CONFIG` environment
//! variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources
//! override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `SPARKMETER_`
//!    override YAML values
//!
//! For nested config values, use double underscores in environment
//! variables. For example, `SPARKMETER_BILLING__USD_TO_SPARKS=2000` sets the
//! `billing.usd_to_sparks` field.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! SPARKMETER_PORT=8080
//!
//! # Telemetry source credentials
//! SPARKMETER_TELEMETRY_SOURCE__PUBLIC_KEY=pk-lf-...
//! SPARKMETER_TELEMETRY_SOURCE__SECRET_KEY=sk-lf-...
//!
//! # Stripe credentials
//! SPARKMETER_PAYMENT__STRIPE__SECRET_KEY=sk_live_...
//! SPARKMETER_PAYMENT__STRIPE__WEBHOOK_SECRET=whsec_...
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SPARKMETER_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Telemetry source (trace API) connection settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_source: Option<TelemetrySourceConfig>,
    /// Billing-unit conversion and sync settings
    pub billing: BillingConfig,
    /// Payment provider configuration (Stripe or dummy)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentConfig>,
    /// Run correlator tunables (TTL sweep)
    pub correlator: CorrelatorConfig,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
}

/// Telemetry source (Langfuse-style trace API) settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySourceConfig {
    /// Base URL of the trace API
    pub url: Url,
    /// Public key for basic auth
    pub public_key: String,
    /// Secret key for basic auth
    pub secret_key: String,
    /// Per-request timeout
    #[serde(default = "TelemetrySourceConfig::default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Trace listing page size
    #[serde(default = "TelemetrySourceConfig::default_page_size")]
    pub page_size: u32,
}

impl TelemetrySourceConfig {
    fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_page_size() -> u32 {
        100
    }
}

/// Billing-unit conversion and sync settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BillingConfig {
    /// Sparks per US dollar of attributed cost
    pub usd_to_sparks: u64,
    /// Customer to attribute traces that carry no customer metadata
    pub default_customer_id: String,
    /// Provider-side meter name usage is reported against
    pub meter: String,
    /// Interval for the scheduled background sync. Absent = manual sync only.
    #[serde(default, with = "humantime_serde")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_interval: Option<Duration>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            usd_to_sparks: 1000,
            default_customer_id: "unattributed".to_string(),
            meter: "ai_sparks".to_string(),
            sync_interval: None,
        }
    }
}

/// Run correlator tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelatorConfig {
    /// Entries older than this are considered orphaned and evicted
    #[serde(with = "humantime_serde")]
    pub max_run_age: Duration,
    /// How often the eviction sweep runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_run_age: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Payment provider configuration.
///
/// Supports different payment providers via an enum. Credentials should be
/// set via environment variables for security.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentConfig {
    /// Stripe billing
    /// Set credentials via:
    /// - `SPARKMETER_PAYMENT__STRIPE__SECRET_KEY` - Stripe secret API key
    /// - `SPARKMETER_PAYMENT__STRIPE__WEBHOOK_SECRET` - Webhook signing secret
    Stripe(StripeConfig),
    /// In-memory dummy provider for development and testing
    Dummy(DummyConfig),
}

/// Stripe billing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StripeConfig {
    /// Stripe API key (secret key starting with sk_)
    pub secret_key: String,
    /// Stripe webhook signing secret (starts with whsec_)
    pub webhook_secret: String,
    /// API origin, overridable for testing against a mock server
    #[serde(default = "StripeConfig::default_api_base")]
    pub api_base: String,
}

impl StripeConfig {
    fn default_api_base() -> String {
        "https://api.stripe.com".to_string()
    }
}

/// Dummy provider configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DummyConfig {
    /// Customers whose ledger submissions are rejected (failure simulation)
    pub fail_customers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
            telemetry_source: None,
            billing: BillingConfig::default(),
            payment: None,
            correlator: CorrelatorConfig::default(),
            enable_metrics: true,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("SPARKMETER_").split("__"))
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let Some(source) = &self.telemetry_source else {
            return Err(Error::Internal {
                operation: "Config validation: telemetry_source is not configured. \
                 Set telemetry_source.url and credentials in the config file or via \
                 SPARKMETER_TELEMETRY_SOURCE__* environment variables."
                    .to_string(),
            });
        };
        if source.public_key.is_empty() || source.secret_key.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: telemetry_source credentials are empty. \
                 Set telemetry_source.public_key and telemetry_source.secret_key."
                    .to_string(),
            });
        }
        if source.page_size == 0 {
            return Err(Error::Internal {
                operation: "Config validation: telemetry_source.page_size cannot be 0.".to_string(),
            });
        }

        if self.payment.is_none() {
            return Err(Error::Internal {
                operation: "Config validation: no payment provider configured. \
                 Configure payment.stripe or payment.dummy."
                    .to_string(),
            });
        }

        if self.billing.usd_to_sparks == 0 {
            return Err(Error::Internal {
                operation: "Config validation: billing.usd_to_sparks must be positive.".to_string(),
            });
        }
        if self.billing.meter.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: billing.meter cannot be empty.".to_string(),
            });
        }

        if self.correlator.max_run_age.is_zero() || self.correlator.sweep_interval.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: correlator.max_run_age and correlator.sweep_interval \
                 must be positive durations."
                    .to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args() -> Args {
        Args {
            config: "test.yaml".to_string(),
            validate: false,
        }
    }

    const VALID_YAML: &str = r#"
telemetry_source:
  url: https://cloud.langfuse.com
  public_key: pk-lf-test
  secret_key: sk-lf-test
payment:
  dummy: {}
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", VALID_YAML)?;

            let config = Config::load(&args())?;

            assert_eq!(config.port, 3002);
            assert_eq!(config.billing.usd_to_sparks, 1000);
            assert_eq!(config.billing.meter, "ai_sparks");
            assert_eq!(config.billing.sync_interval, None);
            let source = config.telemetry_source.unwrap();
            assert_eq!(source.page_size, 100);
            assert_eq!(source.request_timeout, Duration::from_secs(30));
            assert_eq!(config.correlator.max_run_age, Duration::from_secs(3600));
            Ok(())
        });
    }

    #[test]
    fn env_overrides_nested_values() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", VALID_YAML)?;
            jail.set_env("SPARKMETER_PORT", "8080");
            jail.set_env("SPARKMETER_BILLING__USD_TO_SPARKS", "2000");

            let config = Config::load(&args())?;

            assert_eq!(config.port, 8080);
            assert_eq!(config.billing.usd_to_sparks, 2000);
            Ok(())
        });
    }

    #[test]
    fn humantime_durations_parse() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
telemetry_source:
  url: https://cloud.langfuse.com
  public_key: pk
  secret_key: sk
  request_timeout: 10s
payment:
  dummy: {}
billing:
  sync_interval: 15m
correlator:
  max_run_age: 2h
  sweep_interval: 1m
"#,
            )?;

            let config = Config::load(&args())?;

            assert_eq!(config.billing.sync_interval, Some(Duration::from_secs(900)));
            assert_eq!(config.correlator.max_run_age, Duration::from_secs(7200));
            assert_eq!(
                config.telemetry_source.unwrap().request_timeout,
                Duration::from_secs(10)
            );
            Ok(())
        });
    }

    #[test]
    fn missing_telemetry_source_fails_validation() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "payment:\n  dummy: {}\n")?;

            assert!(Config::load(&args()).is_err());
            Ok(())
        });
    }

    #[test]
    fn missing_payment_provider_fails_validation() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
telemetry_source:
  url: https://cloud.langfuse.com
  public_key: pk
  secret_key: sk
"#,
            )?;

            assert!(Config::load(&args()).is_err());
            Ok(())
        });
    }

    #[test]
    fn stripe_config_parses_with_default_api_base() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
telemetry_source:
  url: https://cloud.langfuse.com
  public_key: pk
  secret_key: sk
payment:
  stripe:
    secret_key: sk_test_123
    webhook_secret: whsec_123
"#,
            )?;

            let config = Config::load(&args())?;
            match config.payment {
                Some(PaymentConfig::Stripe(stripe)) => {
                    assert_eq!(stripe.secret_key, "sk_test_123");
                    assert_eq!(stripe.api_base, "https://api.stripe.com");
                }
                other => panic!("expected stripe payment config, got {other:?}"),
            }
            Ok(())
        });
    }
}
