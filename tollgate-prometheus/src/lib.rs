//! Prometheus metrics sink for `tollgate`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::telemetry::{AdmissionEvent, TelemetrySink};

/// Name of the counter registered by [`PrometheusSink`].
pub const EVENTS_TOTAL: &str = "tollgate_admission_events_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// The counter is labelled by `outcome` (`admitted`/`rejected`) and `cause`
    /// (`none`/`client_exhausted`/`global_overload`). Client keys are never used as labels.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new(EVENTS_TOTAL, "Admission decisions"),
            &["outcome", "cause"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        tracing::debug!(metric = EVENTS_TOTAL, "registered admission counter");
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<AdmissionEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        self.counter.with_label_values(&[event.outcome(), event.cause_label()]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
