//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `HOOKLINE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`, optional)
//! 2. **Environment variables** - Variables prefixed with `HOOKLINE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `HOOKLINE_WEBHOOKS__MAX_CONCURRENT_SENDS=50` sets `webhooks.max_concurrent_sends`.
//!
//! ## Example
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 3100
//! enable_metrics: true
//! webhooks:
//!   tick_interval: 1s
//!   default_timeout_ms: 5000
//!   default_retry_policy:
//!     max_retries: 3
//!     initial_delay_ms: 1000
//!     backoff_multiplier: 2.0
//!   circuit_breaker:
//!     failure_threshold: 10
//!     failure_rate_threshold: 0.9
//!   delivery_log:
//!     max_entries_per_endpoint: 100
//!     max_age: 7d
//!   plans:
//!     default_plan: free
//!     premium: 100
//! ```

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::db::models::endpoints::RetryPolicy;
use crate::db::models::plans::Plan;
use crate::errors::Error;
use crate::webhooks::validation;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "HOOKLINE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have sensible defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export traces over OTLP (configured through the standard `OTEL_*` environment variables)
    pub enable_otel_export: bool,
    /// Webhook delivery engine configuration
    pub webhooks: WebhookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3100,
            enable_metrics: false,
            enable_otel_export: false,
            webhooks: WebhookConfig::default(),
        }
    }
}

/// Webhook delivery engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// How often the delivery worker wakes to send due attempts (default: 1s)
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Per-call timeout for endpoints that don't set one (default: 5000)
    pub default_timeout_ms: u64,
    /// Timeout for synchronous test deliveries (default: 10000)
    pub test_timeout_ms: u64,
    /// Retry policy for endpoints that don't set one
    pub default_retry_policy: RetryPolicy,
    /// Maximum concurrent outbound HTTP requests (default: 20)
    pub max_concurrent_sends: usize,
    /// Capacity of the queue producers enqueue into. When full, new attempts are dropped
    /// (default: 10000)
    pub queue_capacity: usize,
    /// Internal channel buffer capacity between the worker and its senders (default: 200)
    pub channel_capacity: usize,
    /// Accept plain `http://` endpoint URLs (default: true)
    pub allow_http: bool,
    /// Secret the built-in test receiver verifies signatures with. The receiver route is only
    /// mounted when this is set.
    pub test_receiver_secret: Option<String>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub delivery_log: DeliveryLogConfig,
    pub plans: PlansConfig,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            default_timeout_ms: 5000,
            test_timeout_ms: 10_000,
            default_retry_policy: RetryPolicy::default(),
            max_concurrent_sends: 20,
            queue_capacity: 10_000,
            channel_capacity: 200,
            allow_http: true,
            test_receiver_secret: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            delivery_log: DeliveryLogConfig::default(),
            plans: PlansConfig::default(),
        }
    }
}

/// Thresholds for deactivating failing endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Minimum lifetime deliveries before the breaker may trip (default: 10)
    pub failure_threshold: u64,
    /// Failure ratio at or above which the endpoint is deactivated (default: 0.9)
    pub failure_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            failure_rate_threshold: 0.9,
        }
    }
}

/// Retention of per-endpoint delivery history.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryLogConfig {
    /// Entries kept per endpoint, oldest dropped first (default: 100)
    pub max_entries_per_endpoint: usize,
    /// Entries older than this are removed by maintenance (default: 7d)
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// How often maintenance runs (default: 1h)
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for DeliveryLogConfig {
    fn default() -> Self {
        Self {
            max_entries_per_endpoint: 100,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            prune_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Active endpoint quotas per plan.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlansConfig {
    /// Plan assumed for owners billing has no record of (default: free)
    pub default_plan: Plan,
    pub free: usize,
    pub basic: usize,
    pub premium: usize,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            default_plan: Plan::Free,
            free: 1,
            basic: 5,
            premium: 50,
        }
    }
}

impl PlansConfig {
    pub fn limit_for(&self, plan: Plan) -> usize {
        match plan {
            Plan::Free => self.free,
            Plan::Basic => self.basic,
            Plan::Premium => self.premium,
        }
    }
}

impl Config {
    /// Build the figment for the given args (file, then environment).
    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("HOOKLINE_").split("__"))
    }

    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), Error> {
        let webhooks = &self.webhooks;

        for (name, value) in [
            ("tick_interval", webhooks.tick_interval),
            ("delivery_log.prune_interval", webhooks.delivery_log.prune_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Internal {
                    operation: format!("Config validation: webhooks.{name} must be greater than zero"),
                });
            }
        }

        for (name, value) in [
            ("max_concurrent_sends", webhooks.max_concurrent_sends),
            ("queue_capacity", webhooks.queue_capacity),
            ("channel_capacity", webhooks.channel_capacity),
            ("delivery_log.max_entries_per_endpoint", webhooks.delivery_log.max_entries_per_endpoint),
        ] {
            if value == 0 {
                return Err(Error::Internal {
                    operation: format!("Config validation: webhooks.{name} must be at least 1"),
                });
            }
        }

        let breaker = &webhooks.circuit_breaker;
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: webhooks.circuit_breaker.failure_rate_threshold ({}) must be in (0, 1]",
                    breaker.failure_rate_threshold
                ),
            });
        }

        validation::validate_timeout(webhooks.default_timeout_ms).map_err(|e| Error::Internal {
            operation: format!("Config validation: webhooks.default_timeout_ms: {}", e.user_message()),
        })?;
        validation::validate_timeout(webhooks.test_timeout_ms).map_err(|e| Error::Internal {
            operation: format!("Config validation: webhooks.test_timeout_ms: {}", e.user_message()),
        })?;
        validation::validate_retry_policy(&webhooks.default_retry_policy).map_err(|e| Error::Internal {
            operation: format!("Config validation: webhooks.default_retry_policy: {}", e.user_message()),
        })?;

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
