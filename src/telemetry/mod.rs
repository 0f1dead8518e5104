//! Telemetry for admission decisions.
//!
//! [`AdmissionService`](crate::AdmissionService) emits one [`AdmissionEvent`] per request. Events
//! flow through `TelemetrySink` implementations: [`NullSink`] drops them, [`RecordingSink`] tallies
//! them by cause in process, and `tollgate-prometheus` exports them as counters.
//!
//! The `TelemetrySink` trait is implemented as a `tower::Service<AdmissionEvent>` for
//! composability. Emission is best-effort: a failing sink never affects the decision.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub use sinks::{emit_best_effort, AdmissionTally, NullSink, RecordingSink, TelemetrySink};
