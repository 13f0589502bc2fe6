use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lock manager configuration with sensible defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockdConfig {
    /// Name this server puts in outbound GRANTED calls
    pub node_name: String,
    pub grant: GrantConfig,
    pub recovery: RecoveryConfig,
    pub limits: LimitsConfig,
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantConfig {
    /// Delay before retrying a GRANTED call that failed
    pub retry_interval_ms: u64,
    /// How long to wait for GRANTED_RES after a GRANTED_MSG
    pub ack_timeout_ms: u64,
    /// Give up after this many attempts; `None` retries until cancelled
    pub max_attempts: Option<u32>,
}

impl GrantConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// After startup only reclaim requests are served for this long
    pub grace_period_ms: u64,
}

impl RecoveryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Outstanding blocking requests per file before new ones are dropped
    pub max_blocks_per_file: usize,
    /// Capacity of the in-memory lock table
    pub max_locks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Trace registry and matcher decisions through the `log` facade
    pub trace_registries: bool,
    /// Log level
    pub log_level: String,
    /// Maximum log events kept by in-memory diagnostics
    pub max_log_events: usize,
}

impl LockdConfig {
    /// Default configuration for production
    pub fn production() -> Self {
        LockdConfig {
            node_name: "localhost".to_string(),
            grant: GrantConfig {
                retry_interval_ms: 5_000,
                ack_timeout_ms: 10_000,
                max_attempts: None,
            },
            recovery: RecoveryConfig {
                grace_period_ms: 90_000,
            },
            limits: LimitsConfig {
                max_blocks_per_file: 1024,
                max_locks: 65_536,
            },
            diagnostics: DiagnosticsConfig {
                trace_registries: false,
                log_level: "info".to_string(),
                max_log_events: 10_000,
            },
        }
    }

    /// Development configuration
    pub fn development() -> Self {
        let mut config = Self::production();
        config.grant.retry_interval_ms = 1_000;
        config.grant.ack_timeout_ms = 2_000;
        config.recovery.grace_period_ms = 0;
        config.diagnostics.trace_registries = true;
        config.diagnostics.log_level = "debug".to_string();
        config
    }

    /// Testing configuration: millisecond timers, bounded retries
    pub fn testing() -> Self {
        let mut config = Self::development();
        config.grant.retry_interval_ms = 10;
        config.grant.ack_timeout_ms = 50;
        config.grant.max_attempts = Some(20);
        config.limits.max_blocks_per_file = 64;
        config.diagnostics.max_log_events = 1_000;
        config
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "production" => Some(Self::production()),
            "development" => Some(Self::development()),
            "testing" => Some(Self::testing()),
            _ => None,
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse config")
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_json(&text).with_context(|| format!("Invalid config in {}", path.display()))?;
        config
            .validate()
            .map_err(|errors| anyhow::anyhow!("Configuration validation failed: {}", errors.join("; ")))?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.grant.retry_interval_ms == 0 {
            errors.push("retry_interval_ms must be > 0".to_string());
        }

        if self.grant.ack_timeout_ms == 0 {
            errors.push("ack_timeout_ms must be > 0".to_string());
        }

        if self.grant.max_attempts == Some(0) {
            errors.push("max_attempts must be > 0 when set".to_string());
        }

        if self.node_name.is_empty() {
            errors.push("node_name must not be empty".to_string());
        }

        if self.limits.max_blocks_per_file == 0 {
            errors.push("max_blocks_per_file must be > 0".to_string());
        }

        if self.limits.max_locks == 0 {
            errors.push("max_locks must be > 0".to_string());
        }

        if crate::logging::LogLevel::parse(&self.diagnostics.log_level).is_none() {
            errors.push(format!("unknown log_level '{}'", self.diagnostics.log_level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for LockdConfig {
    fn default() -> Self {
        LockdConfig::production()
    }
}

/// Configuration builder for fluent API
pub struct ConfigBuilder {
    config: LockdConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: LockdConfig::production(),
        }
    }

    pub fn from_preset(preset: &str) -> Self {
        ConfigBuilder {
            config: LockdConfig::preset(preset).unwrap_or_else(LockdConfig::production),
        }
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.grant.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.grant.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.grant.max_attempts = attempts;
        self
    }

    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.config.node_name = name.into();
        self
    }

    pub fn grace_period(mut self, period: Duration) -> Self {
        self.config.recovery.grace_period_ms = period.as_millis() as u64;
        self
    }

    pub fn max_blocks_per_file(mut self, max: usize) -> Self {
        self.config.limits.max_blocks_per_file = max;
        self
    }

    pub fn trace_registries(mut self, enable: bool) -> Self {
        self.config.diagnostics.trace_registries = enable;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.diagnostics.log_level = level.into();
        self
    }

    pub fn build(self) -> anyhow::Result<LockdConfig> {
        match self.config.validate() {
            Ok(()) => Ok(self.config),
            Err(errors) => Err(anyhow::anyhow!("Configuration validation failed: {}", errors.join("; "))),
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
