//! Error types for configuration loading.
//!
//! Admission itself never fails: rejections are [`Decision`](crate::Decision)s. Only building a
//! limiter from configuration can go wrong.

use std::path::PathBuf;
use thiserror::Error;

/// Reasons an [`AdmissionConfig`](crate::AdmissionConfig) cannot be loaded or used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A numeric setting that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error(
        "client_key.forwarded = \"trusted_proxies\" requires at least one network in \
         client_key.trusted_proxies"
    )]
    NoTrustedProxies,

    /// More queue slots than a semaphore can hold.
    #[error("fixed_window.queue_limit = {limit} exceeds the maximum of {max}")]
    QueueTooLarge { limit: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
