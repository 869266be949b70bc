pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config as ConfigLoader, ConfigBuilder, Environment, File, FileFormat};
use std::path::Path;

/// Environment override prefix, e.g. `SIDECAR__UPSTREAM__RPC_URL`
pub const ENV_PREFIX: &str = "SIDECAR";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_COMMITMENTS: [&str; 3] = ["processed", "confirmed", "finalized"];

impl SidecarConfig {
    /// Load defaults, then the optional TOML file, then `SIDECAR__*`
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Self::defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;
        Self::finish(config)
    }

    /// Defaults overlaid with an in-memory TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Self::defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?;
        Self::finish(config)
    }

    fn finish(config: ConfigLoader) -> Result<Self> {
        let cfg: SidecarConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(ConfigLoader::builder()
            // Upstream
            .set_default("upstream.rpc_url", "http://127.0.0.1:8899")?
            .set_default("upstream.require_streaming", true)?
            .set_default("upstream.commitment", "confirmed")?
            .set_default("upstream.health_method", "getHealth")?
            .set_default("upstream.request_timeout_ms", 10_000)?
            .set_default("upstream.ping_interval_secs", 30)?
            // Connection
            .set_default("connection.max_reconnect_attempts", 10)?
            .set_default("connection.call_policy", "queue")?
            .set_default("connection.max_queued_calls", 256)?
            .set_default("connection.max_queue_wait_ms", 5_000)?
            .set_default("connection.call_timeout_ms", 15_000)?
            // Backoff
            .set_default("backoff.base_delay_ms", 500)?
            .set_default("backoff.multiplier", 2.0)?
            .set_default("backoff.max_delay_ms", 30_000)?
            .set_default("backoff.rate_limit_base_delay_ms", 2_000)?
            .set_default("backoff.rate_limit_multiplier", 3.0)?
            .set_default("backoff.jitter_factor", 0.25)?
            .set_default("backoff.max_attempts", 3)?
            // Circuit breaker
            .set_default("circuit_breaker.failure_threshold", 5)?
            .set_default("circuit_breaker.success_threshold", 2)?
            .set_default("circuit_breaker.timeout_ms", 30_000)?
            .set_default("circuit_breaker.half_open_attempts", 3)?
            // Dead letters
            .set_default("dead_letter.max_retries", 5)?
            .set_default("dead_letter.retention_secs", 604_800)?
            .set_default("dead_letter.cleanup_interval_secs", 3_600)?
            .set_default("dead_letter.redrive_interval_secs", 60)?
            .set_default("dead_letter.redrive_batch", 50)?
            // Dedup
            .set_default("dedup.window_secs", 300)?
            .set_default("dedup.sweep_interval_secs", 60)?
            // Local transports
            .set_default("broker.call_addr", "127.0.0.1:7401")?
            .set_default("broker.event_addr", "127.0.0.1:7402")?
            // Monitoring
            .set_default("monitoring.enabled", true)?
            .set_default("monitoring.listen_addr", "127.0.0.1:9090")?
            // Logging
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.json_rpc()?;

        if self.upstream.require_streaming && self.upstream.ws_url.is_none() {
            anyhow::bail!("upstream.require_streaming is set but upstream.ws_url is missing");
        }

        if !VALID_COMMITMENTS.contains(&self.upstream.commitment.as_str()) {
            anyhow::bail!(
                "Invalid commitment '{}', must be one of: {:?}",
                self.upstream.commitment,
                VALID_COMMITMENTS
            );
        }

        if self.upstream.request_timeout_ms == 0 || self.connection.call_timeout_ms == 0 {
            anyhow::bail!("request and call timeouts must be positive");
        }

        let b = &self.backoff;
        if b.base_delay_ms == 0 || b.rate_limit_base_delay_ms == 0 {
            anyhow::bail!("backoff base delays must be positive");
        }
        if b.multiplier < 1.0 || b.rate_limit_multiplier < 1.0 {
            anyhow::bail!("backoff multipliers must be at least 1.0");
        }
        if b.rate_limit_base_delay_ms < b.base_delay_ms || b.rate_limit_multiplier < b.multiplier {
            anyhow::bail!(
                "backoff rate-limit base delay and multiplier cannot be below the normal ones"
            );
        }
        if b.max_delay_ms < b.base_delay_ms {
            anyhow::bail!("backoff.max_delay_ms cannot be below backoff.base_delay_ms");
        }
        if !(0.0..=1.0).contains(&b.jitter_factor) {
            anyhow::bail!("backoff.jitter_factor must be within 0.0..=1.0");
        }
        if b.max_attempts == 0 {
            anyhow::bail!("backoff.max_attempts must be at least 1");
        }

        let c = &self.circuit_breaker;
        if c.failure_threshold == 0 || c.success_threshold == 0 || c.half_open_attempts == 0 {
            anyhow::bail!("circuit breaker thresholds must be positive");
        }
        if c.success_threshold > c.half_open_attempts {
            anyhow::bail!("circuit_breaker.success_threshold cannot exceed half_open_attempts");
        }

        let d = &self.dead_letter;
        if d.redrive_batch == 0 {
            anyhow::bail!("dead_letter.redrive_batch must be positive");
        }
        if d.cleanup_interval_secs == 0 || d.redrive_interval_secs == 0 {
            anyhow::bail!("dead-letter maintenance intervals must be positive");
        }

        if self.dedup.window_secs == 0 || self.dedup.sweep_interval_secs == 0 {
            anyhow::bail!("dedup window and sweep interval must be positive");
        }

        if self.broker.call_addr == self.broker.event_addr {
            anyhow::bail!("broker.call_addr and broker.event_addr must differ");
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.logging.level,
                VALID_LOG_LEVELS
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CallPolicy;
    use std::time::Duration;

    const MINIMAL: &str = r#"
        [upstream]
        ws_url = "ws://127.0.0.1:8900"
    "#;

    #[test]
    fn test_defaults() {
        let cfg = SidecarConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(cfg.upstream.rpc_url, "http://127.0.0.1:8899");
        assert_eq!(cfg.connection.call_policy, CallPolicy::Queue);
        assert_eq!(cfg.dedup_window(), Duration::from_secs(300));
        assert_eq!(cfg.broker.call_addr.port(), 7401);
        assert!(cfg.dead_letter.path.is_none());

        let policy = cfg.backoff_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 3);

        let conn = cfg.connection();
        assert_eq!(conn.max_queue_wait, Duration::from_secs(5));
        assert_eq!(conn.breaker.failure_threshold, 5);
        assert!(conn.require_streaming);
    }

    #[test]
    fn test_file_overrides() {
        let cfg = SidecarConfig::from_toml_str(
            r#"
            [upstream]
            rpc_url = "https://rpc.example.org"
            ws_url = "wss://rpc.example.org"
            commitment = "finalized"

            [connection]
            call_policy = "fail_fast"
            max_reconnect_attempts = 0

            [dead_letter]
            path = "/var/lib/sidecar/dead_letters.jsonl"
        "#,
        )
        .unwrap();

        assert_eq!(cfg.connection.call_policy, CallPolicy::FailFast);
        assert_eq!(cfg.connection().max_reconnect_attempts, 0);
        assert_eq!(cfg.json_rpc().unwrap().commitment, "finalized");
        assert!(cfg.dead_letter.path.is_some());
    }

    #[test]
    fn test_config_validation() {
        // Streaming required but no ws_url
        assert!(SidecarConfig::from_toml_str("").is_err());

        let mut cfg = SidecarConfig::from_toml_str(MINIMAL).unwrap();
        assert!(cfg.validate().is_ok());

        cfg.backoff.jitter_factor = 1.5;
        assert!(cfg.validate().is_err());
        cfg.backoff.jitter_factor = 0.25;

        cfg.backoff.rate_limit_multiplier = 1.5;
        assert!(cfg.validate().is_err());
        cfg.backoff.rate_limit_multiplier = 3.0;

        cfg.upstream.commitment = "eventual".to_string();
        assert!(cfg.validate().is_err());
        cfg.upstream.commitment = "confirmed".to_string();

        cfg.broker.event_addr = cfg.broker.call_addr;
        assert!(cfg.validate().is_err());
        cfg.broker.event_addr = "127.0.0.1:7402".parse().unwrap();

        cfg.upstream.rpc_url = "not a url".to_string();
        assert!(cfg.validate().is_err());
        cfg.upstream.rpc_url = "http://127.0.0.1:8899".to_string();

        cfg.logging.level = "verbose".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rate_limit_backoff_below_normal_rejected() {
        let err = SidecarConfig::from_toml_str(
            r#"
            [upstream]
            ws_url = "ws://127.0.0.1:8900"

            [backoff]
            base_delay_ms = 1000
            rate_limit_base_delay_ms = 100
        "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("rate-limit"));
    }

    #[test]
    fn test_streaming_optional() {
        let cfg = SidecarConfig::from_toml_str(
            r#"
            [upstream]
            require_streaming = false
        "#,
        )
        .unwrap();
        assert!(cfg.json_rpc().unwrap().ws_url.is_none());
    }
}
