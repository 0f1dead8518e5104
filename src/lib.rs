#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Admission control for async HTTP services: decide, per request, whether to let it in.
//!
//! ## Features
//!
//! - **Per-client token buckets** with continuous refill, one per client key
//! - **Concurrent bucket registry** on a sharded map, with optional idle eviction
//! - **Global fixed window** with a small bounded queue for the next window
//! - **Tower middleware** that answers `429 Too Many Requests` with a JSON body and `Retry-After`
//! - **Telemetry sinks** receiving one event per decision
//!
//! ## Quick Start
//!
//! ```rust
//! use http::{Request, Response};
//! use std::convert::Infallible;
//! use tollgate::{AdmissionConfig, AdmissionLayer, PeerAddr};
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdmissionConfig::from_toml_str("[token_bucket]\nburst_size = 2")?;
//!     let layer = AdmissionLayer::from_config(&config)?;
//!     let svc = layer.layer(service_fn(|_req: Request<String>| async {
//!         Ok::<_, Infallible>(Response::new(String::from("ok")))
//!     }));
//!
//!     let mut req = Request::new(String::new());
//!     req.extensions_mut().insert(PeerAddr("192.0.2.1:4000".parse()?));
//!     let res = svc.oneshot(req).await?;
//!     assert_eq!(res.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod prelude;
pub mod rate_limit;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::AdmissionConfig;
pub use error::ConfigError;
pub use key::{ClientKey, ForwardedPolicy, KeyExtractor, PeerAddr, UNKNOWN_CLIENT};
pub use rate_limit::{
    rejection_response, AdmissionChain, AdmissionLayer, AdmissionService, BucketRegistry,
    Decision, FixedWindowLimiter, PerClientLimiter, RateLimiter, RejectCause, Rejection,
    TokenBucket,
};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{AdmissionEvent, AdmissionTally, NullSink, RecordingSink, TelemetrySink};
