use super::events::AdmissionEvent;
use crate::rate_limit::RejectCause;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` once `sink` is ready. Sink errors are dropped so they never reach the request.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Default sink of [`AdmissionLayer`](crate::AdmissionLayer); discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Decisions counted by outcome and rejection cause.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdmissionTally {
    pub admitted: u64,
    pub client_exhausted: u64,
    pub global_overload: u64,
}

impl AdmissionTally {
    pub fn rejected(&self) -> u64 {
        self.client_exhausted + self.global_overload
    }

    pub fn total(&self) -> u64 {
        self.admitted + self.rejected()
    }

    fn record(&mut self, event: &AdmissionEvent) {
        match event {
            AdmissionEvent::Admitted { .. } => self.admitted += 1,
            AdmissionEvent::Rejected { cause: RejectCause::ClientExhausted, .. } => {
                self.client_exhausted += 1
            }
            AdmissionEvent::Rejected { cause: RejectCause::GlobalOverload, .. } => {
                self.global_overload += 1
            }
        }
    }
}

#[derive(Debug)]
struct Recorded {
    tally: AdmissionTally,
    recent: VecDeque<AdmissionEvent>,
    keep: usize,
}

/// In-process sink that tallies every decision and keeps the most recent events.
///
/// Clones share state, so one handle can go to the layer and another stay with the caller.
/// The tally covers every event ever delivered; only the event history is bounded.
#[derive(Clone, Debug)]
pub struct RecordingSink {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    /// Keeps the last 1024 events.
    pub fn new() -> Self {
        Self::keeping_last(1024)
    }

    pub fn keeping_last(keep: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(Recorded {
                tally: AdmissionTally::default(),
                recent: VecDeque::new(),
                keep,
            })),
        }
    }

    pub fn tally(&self) -> AdmissionTally {
        self.lock().tally
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().recent.iter().cloned().collect()
    }

    /// Retained rejections of `client`.
    pub fn rejections_of(&self, client: &str) -> usize {
        self.lock()
            .recent
            .iter()
            .filter(|e| e.outcome() == "rejected" && e.client().as_str() == client)
            .count()
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.tally = AdmissionTally::default();
        state.recent.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for RecordingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut state = self.lock();
        state.tally.record(&event);
        if state.keep > 0 {
            if state.recent.len() == state.keep {
                state.recent.pop_front();
            }
            state.recent.push_back(event);
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for RecordingSink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    fn admitted(client: &str) -> AdmissionEvent {
        AdmissionEvent::Admitted {
            client: client.into(),
            remaining: 1,
        }
    }

    fn rejected(client: &str, cause: RejectCause) -> AdmissionEvent {
        AdmissionEvent::Rejected {
            client: client.into(),
            cause,
            retry_after: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn tally_counts_each_cause() {
        let mut sink = RecordingSink::new();
        sink.call(admitted("a")).await.unwrap();
        sink.call(rejected("a", RejectCause::ClientExhausted)).await.unwrap();
        sink.call(rejected("b", RejectCause::GlobalOverload)).await.unwrap();
        sink.call(rejected("c", RejectCause::GlobalOverload)).await.unwrap();

        let tally = sink.tally();
        assert_eq!(
            tally,
            AdmissionTally {
                admitted: 1,
                client_exhausted: 1,
                global_overload: 2,
            }
        );
        assert_eq!(tally.rejected(), 3);
        assert_eq!(tally.total(), 4);
        assert_eq!(sink.rejections_of("a"), 1);
    }

    #[tokio::test]
    async fn history_is_bounded_but_tally_is_not() {
        let mut sink = RecordingSink::keeping_last(2);
        sink.call(admitted("a")).await.unwrap();
        sink.call(admitted("b")).await.unwrap();
        sink.call(rejected("c", RejectCause::ClientExhausted)).await.unwrap();

        assert_eq!(
            sink.events(),
            vec![admitted("b"), rejected("c", RejectCause::ClientExhausted)]
        );
        assert_eq!(sink.tally().total(), 3);

        sink.reset();
        assert!(sink.events().is_empty());
        assert_eq!(sink.tally(), AdmissionTally::default());
    }

    #[tokio::test]
    async fn zero_history_still_tallies() {
        let mut sink = RecordingSink::keeping_last(0);
        sink.call(admitted("a")).await.unwrap();
        assert!(sink.events().is_empty());
        assert_eq!(sink.tally().admitted, 1);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        #[derive(Clone)]
        struct Fails;
        impl tower::Service<AdmissionEvent> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: AdmissionEvent) -> Self::Future {
                Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")) })
            }
        }

        emit_best_effort(Fails, admitted("a")).await;
    }

    #[tokio::test]
    async fn emit_best_effort_delivers() {
        let sink = RecordingSink::new();
        emit_best_effort(sink.clone(), admitted("a")).await;
        emit_best_effort(NullSink, admitted("a")).await;
        assert_eq!(sink.tally().admitted, 1);
    }
}
