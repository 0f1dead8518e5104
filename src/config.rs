//! Admission configuration.
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```toml
//! [token_bucket]
//! requests_per_minute = 60
//! burst_size = 10
//!
//! [fixed_window]
//! permit_limit = 50
//! window_seconds = 60
//! queue_limit = 2
//! queue_timeout_ms = 60000
//!
//! [client_key]
//! forwarded = "trusted_proxies"   # or "trust_all" (default), "ignore"
//! trusted_proxies = ["10.0.0.0/8"]
//!
//! [registry]
//! idle_ttl_seconds = 600          # omit to never evict
//! ```

use crate::error::{ConfigError, Result};
use crate::key::{ForwardedPolicy, KeyExtractor};
use crate::rate_limit::{BucketRegistry, FixedWindowLimiter};
use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Root configuration. Immutable once a limiter has been built from it.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub token_bucket: TokenBucketConfig,
    #[serde(default)]
    pub fixed_window: FixedWindowConfig,
    #[serde(default)]
    pub client_key: ClientKeyConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Per-client token bucket settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TokenBucketConfig {
    /// Sustained rate. Default: 60
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Bucket capacity. Default: 10
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
        }
    }
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst_size() -> u32 {
    10
}

/// Global fixed window settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FixedWindowConfig {
    /// Admissions per window. Default: 50
    #[serde(default = "default_permit_limit")]
    pub permit_limit: u32,
    /// Window length. Default: 60
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Requests allowed to wait for the next window. Default: 2
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    /// Longest a queued request may wait. Default: 60000
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            permit_limit: default_permit_limit(),
            window_seconds: default_window_seconds(),
            queue_limit: default_queue_limit(),
            queue_timeout_ms: default_queue_timeout_ms(),
        }
    }
}

fn default_permit_limit() -> u32 {
    50
}

fn default_window_seconds() -> u64 {
    60
}

fn default_queue_limit() -> usize {
    2
}

fn default_queue_timeout_ms() -> u64 {
    60_000
}

/// How `X-Forwarded-For` is treated.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardedMode {
    #[default]
    TrustAll,
    Ignore,
    TrustedProxies,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ClientKeyConfig {
    #[serde(default)]
    pub forwarded: ForwardedMode,
    /// Networks whose `X-Forwarded-For` is honoured under `trusted_proxies`.
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Evict buckets idle (and full) for this long. Default: never
    #[serde(default)]
    pub idle_ttl_seconds: Option<u64>,
}

impl AdmissionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(txt: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a TOML file.
    pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Self> {
        let path = p.as_ref();
        let txt = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&txt)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = |field| Err(ConfigError::Zero { field });
        if self.token_bucket.requests_per_minute == 0 {
            return zero("token_bucket.requests_per_minute");
        }
        if self.token_bucket.burst_size == 0 {
            return zero("token_bucket.burst_size");
        }
        if self.fixed_window.permit_limit == 0 {
            return zero("fixed_window.permit_limit");
        }
        if self.fixed_window.window_seconds == 0 {
            return zero("fixed_window.window_seconds");
        }
        if self.fixed_window.queue_limit > Semaphore::MAX_PERMITS {
            return Err(ConfigError::QueueTooLarge {
                limit: self.fixed_window.queue_limit,
                max: Semaphore::MAX_PERMITS,
            });
        }
        if self.registry.idle_ttl_seconds == Some(0) {
            return zero("registry.idle_ttl_seconds");
        }
        if self.client_key.forwarded == ForwardedMode::TrustedProxies
            && self.client_key.trusted_proxies.is_empty()
        {
            return Err(ConfigError::NoTrustedProxies);
        }
        Ok(())
    }

    pub fn key_extractor(&self) -> KeyExtractor {
        let policy = match self.client_key.forwarded {
            ForwardedMode::TrustAll => ForwardedPolicy::TrustAll,
            ForwardedMode::Ignore => ForwardedPolicy::Ignore,
            ForwardedMode::TrustedProxies => {
                ForwardedPolicy::TrustedProxies(self.client_key.trusted_proxies.clone())
            }
        };
        KeyExtractor::new(policy)
    }

    /// Registry sized from `token_bucket`, with eviction if `registry.idle_ttl_seconds` is set.
    pub fn build_registry(&self) -> BucketRegistry {
        let registry = BucketRegistry::per_minute(
            self.token_bucket.requests_per_minute,
            self.token_bucket.burst_size,
        );
        match self.registry.idle_ttl_seconds {
            Some(secs) => registry.with_idle_ttl(Duration::from_secs(secs)),
            None => registry,
        }
    }

    pub fn build_fixed_window(&self) -> FixedWindowLimiter {
        let window = &self.fixed_window;
        FixedWindowLimiter::new(window.permit_limit, Duration::from_secs(window.window_seconds))
            .with_queue(window.queue_limit, Duration::from_millis(window.queue_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = AdmissionConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, AdmissionConfig::default());
        assert_eq!(cfg.token_bucket.requests_per_minute, 60);
        assert_eq!(cfg.token_bucket.burst_size, 10);
        assert_eq!(cfg.fixed_window.permit_limit, 50);
        assert_eq!(cfg.fixed_window.window_seconds, 60);
        assert_eq!(cfg.fixed_window.queue_limit, 2);
        assert_eq!(cfg.fixed_window.queue_timeout_ms, 60_000);
        assert_eq!(cfg.client_key.forwarded, ForwardedMode::TrustAll);
        assert_eq!(cfg.registry.idle_ttl_seconds, None);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = AdmissionConfig::from_toml_str(
            r#"
            [token_bucket]
            burst_size = 3

            [client_key]
            forwarded = "trusted_proxies"
            trusted_proxies = ["10.0.0.0/8", "192.168.1.1/32"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.token_bucket.burst_size, 3);
        assert_eq!(cfg.token_bucket.requests_per_minute, 60);
        assert_eq!(cfg.client_key.trusted_proxies.len(), 2);
        assert!(matches!(
            cfg.key_extractor().policy(),
            ForwardedPolicy::TrustedProxies(nets) if nets.len() == 2
        ));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = AdmissionConfig::from_toml_str("[token_bucket]\nburst_size = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "token_bucket.burst_size",
            }
        ));

        let err = AdmissionConfig::from_toml_str("[fixed_window]\nwindow_seconds = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "fixed_window.window_seconds",
            }
        ));

        let err = AdmissionConfig::from_toml_str("[registry]\nidle_ttl_seconds = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Zero {
                field: "registry.idle_ttl_seconds",
            }
        ));
    }

    #[test]
    fn trusted_proxies_mode_needs_networks() {
        let err = AdmissionConfig::from_toml_str("[client_key]\nforwarded = \"trusted_proxies\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoTrustedProxies));
    }

    #[test]
    fn oversized_queue_is_rejected() {
        let doc = "[fixed_window]\nqueue_limit = 9223372036854775807";
        let err = AdmissionConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::QueueTooLarge {
                limit: 9_223_372_036_854_775_807,
                max: Semaphore::MAX_PERMITS,
            }
        ));

        let at_max = format!("[fixed_window]\nqueue_limit = {}", Semaphore::MAX_PERMITS);
        let cfg = AdmissionConfig::from_toml_str(&at_max).unwrap();
        assert_eq!(cfg.build_fixed_window().queue_limit(), Semaphore::MAX_PERMITS);
    }

    #[test]
    fn unknown_keys_and_bad_types_fail_to_parse() {
        let err = AdmissionConfig::from_toml_str("[token_bucket]\nrpm = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let doc = "[client_key]\ntrusted_proxies = [\"nope\"]";
        let err = AdmissionConfig::from_toml_str(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AdmissionConfig::load_from_path("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn builders_follow_settings() {
        let cfg = AdmissionConfig::from_toml_str(
            "[fixed_window]\npermit_limit = 7\nqueue_limit = 4\n[registry]\nidle_ttl_seconds = 30",
        )
        .unwrap();
        let window = cfg.build_fixed_window();
        assert_eq!(window.permit_limit(), 7);
        assert_eq!(window.queue_limit(), 4);
        assert_eq!(cfg.build_registry().idle_ttl(), Some(Duration::from_secs(30)));
    }
}
