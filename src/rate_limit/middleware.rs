use crate::config::AdmissionConfig;
use crate::error::ConfigError;
use crate::key::KeyExtractor;
use crate::rate_limit::{AdmissionChain, Decision, RateLimiter, Rejection};
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink};
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderValue, Request, Response, StatusCode};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

/// `error` field of every 429 body.
pub const REJECTION_MESSAGE: &str = "rate limit exceeded";

/// A layer that enforces admission decisions on HTTP requests.
#[derive(Clone, Debug)]
pub struct AdmissionLayer<L, T = NullSink> {
    limiter: Arc<L>,
    keys: KeyExtractor,
    sink: T,
}

impl<L> AdmissionLayer<L> {
    /// Create a new admission layer with the default key extractor and no telemetry.
    pub fn new(limiter: L) -> Self {
        Self::from_arc(Arc::new(limiter))
    }

    /// Share an existing limiter with the layer.
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self {
            limiter,
            keys: KeyExtractor::default(),
            sink: NullSink,
        }
    }
}

impl AdmissionLayer<AdmissionChain> {
    /// Validate `config` and build the per-client then global chain it describes.
    ///
    /// With `registry.idle_ttl_seconds` set, an eviction sweeper running every TTL is spawned on
    /// the current tokio runtime. It stops once the layer and its services are dropped.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(config.build_registry());
        if let Some(ttl) = registry.idle_ttl() {
            if tokio::runtime::Handle::try_current().is_ok() {
                registry.spawn_sweeper(ttl);
            } else {
                warn!(
                    "no tokio runtime; idle buckets are only evicted by explicit evict_idle calls"
                );
            }
        }
        let chain = AdmissionChain::per_client_then_global(
            registry,
            Arc::new(config.build_fixed_window()),
        );
        Ok(Self::new(chain).with_key_extractor(config.key_extractor()))
    }
}

impl<L, T> AdmissionLayer<L, T> {
    /// Replace how client keys are derived.
    pub fn with_key_extractor(mut self, keys: KeyExtractor) -> Self {
        self.keys = keys;
        self
    }

    /// Emit one [`AdmissionEvent`] per request to `sink`.
    pub fn with_sink<T2>(self, sink: T2) -> AdmissionLayer<L, T2> {
        AdmissionLayer {
            limiter: self.limiter,
            keys: self.keys,
            sink,
        }
    }

    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }
}

impl<S, L, T> Layer<S> for AdmissionLayer<L, T>
where
    T: Clone,
{
    type Service = AdmissionService<S, L, T>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            keys: self.keys.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Middleware service that admits or rejects each request before the inner service sees it.
///
/// Rejected requests never reach the inner service; they are answered with
/// [`rejection_response`]. Admitted requests are forwarded and their result returned unchanged,
/// including the inner error type.
#[derive(Clone, Debug)]
pub struct AdmissionService<S, L, T = NullSink> {
    inner: S,
    limiter: Arc<L>,
    keys: KeyExtractor,
    sink: T,
}

impl<S, L, T, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S, L, T>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    T: tower::Service<AdmissionEvent, Response = ()> + Clone + Send + 'static,
    T::Error: std::error::Error + Send + 'static,
    T::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        let sink = self.sink.clone();
        let key = self.keys.extract(&req);
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter.acquire(&key).await;
            emit_best_effort(sink, AdmissionEvent::from_decision(key, &decision)).await;
            match decision {
                Decision::Admit { .. } => inner.call(req).await,
                Decision::Reject(rejection) => Ok(rejection_response(&rejection)),
            }
        })
    }
}

/// 429 response for `rejection`: JSON body plus `Retry-After` in whole seconds.
pub fn rejection_response<B: From<String>>(rejection: &Rejection) -> Response<B> {
    let retry_after = rejection.retry_after_secs();
    let body = json!({
        "error": REJECTION_MESSAGE,
        "cause": rejection.cause.as_str(),
        "retry_after": retry_after,
    })
    .to_string();

    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

/// Admission check for pipelines that are not tower services.
///
/// Returns the 429 response to send, or `Ok(())` to continue.
pub async fn check_request<L, B, R>(
    limiter: &L,
    keys: &KeyExtractor,
    req: &Request<B>,
) -> Result<(), Response<R>>
where
    L: RateLimiter + ?Sized,
    R: From<String>,
{
    let key = keys.extract(req);
    match limiter.acquire(&key).await {
        Decision::Admit { .. } => Ok(()),
        Decision::Reject(rejection) => Err(rejection_response(&rejection)),
    }
}
