//! Convenient re-exports for common tollgate types.
pub use crate::{
    config::{
        AdmissionConfig, ClientKeyConfig, FixedWindowConfig, ForwardedMode, RegistryConfig,
        TokenBucketConfig,
    },
    key::{ClientKey, ForwardedPolicy, KeyExtractor, PeerAddr},
    rate_limit::{
        AdmissionChain, AdmissionLayer, BucketRegistry, Decision, FixedWindowLimiter,
        PerClientLimiter, RateLimiter, RejectCause,
    },
    telemetry::{AdmissionEvent, TelemetrySink},
    ConfigError,
};
