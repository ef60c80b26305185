//! Request routing through per-bucket queues.
//!
//! [`DefaultRouter`] keeps one [`RequestQueue`] per [`BucketKey`], created on first use, and
//! runs every exchange through three layers:
//!
//! 1. **Server-error retry**: 500/502/503/504 and transport failures are retried with
//!    exponential backoff (2s doubling to 30s, ±50% jitter), indefinitely.
//! 2. **Response functions** registered with
//!    [`on_client_response`](RouterOptionsBuilder::on_client_response), applied to requests on
//!    matching routes.
//! 3. **Rate-limit retry**: a 429 re-enters the back of its bucket queue immediately. The delay
//!    it carries was already applied to the bucket (or to the global cooldown), so the queue
//!    does the waiting.
//! 4. **Dispatch**: admission on the bucket, then the HTTP exchange under the global limiter,
//!    then rate-limit bookkeeping, then release of the bucket.
//!
//! Buckets are independent: a slow or delayed bucket never blocks another, apart from the
//! global limiter.

use crate::bucket::BucketKey;
use crate::error::{BuildError, ClientError, RouterError};
use crate::exchange::{HttpExchange, ServiceExchange};
use crate::limiter::{GlobalRateLimiter, GlobalRateLimiterExt, LocalGlobalRateLimiter};
use crate::queue::{QueueState, RequestQueue};
use crate::request::Request;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::route::Route;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::strategy::{HeaderStrategy, RateLimitInfo, RateLimitStrategy};
use crate::telemetry::{RouterEvent, Telemetry, TelemetrySink};
use crate::transform::{self, Attempt, ResponseFunction};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, trace, warn, Instrument};

/// Something that can route a request to its response.
#[async_trait]
pub trait Router: Send + Sync {
    /// Queue `request` behind its bucket, execute it and return the response.
    ///
    /// Error statuses come back as [`RouterError::Client`]; rate limits and retryable server
    /// errors are handled internally.
    async fn exchange(&self, request: Request) -> Result<Response, RouterError>;
}

/// Everything a router needs besides its buckets.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    exchange: Arc<dyn HttpExchange>,
    global_limiter: Arc<dyn GlobalRateLimiter>,
    strategy: Arc<dyn RateLimitStrategy>,
    route_strategies: Vec<(Route, Arc<dyn RateLimitStrategy>)>,
    response_functions: Vec<ResponseFunction>,
    server_retry: RetryPolicy<RouterError>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl RouterOptions {
    /// Start configuring a router.
    pub fn builder() -> RouterOptionsBuilder {
        RouterOptionsBuilder::default()
    }

    /// The HTTP exchange.
    pub fn exchange(&self) -> &Arc<dyn HttpExchange> {
        &self.exchange
    }

    /// The global limiter.
    pub fn global_limiter(&self) -> &Arc<dyn GlobalRateLimiter> {
        &self.global_limiter
    }

    /// Sleeper bucket queues wait through.
    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Telemetry handle.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Response functions in application order.
    pub fn response_functions(&self) -> &[ResponseFunction] {
        &self.response_functions
    }

    /// Strategy for responses on `route`: a per-route override, else the default.
    pub fn strategy_for(&self, route: &Route) -> &Arc<dyn RateLimitStrategy> {
        self.route_strategies
            .iter()
            .find(|(r, _)| r.method() == route.method() && r.template() == route.template())
            .map_or(&self.strategy, |(_, s)| s)
    }
}

/// Builder for [`RouterOptions`].
#[derive(Debug, Clone)]
pub struct RouterOptionsBuilder {
    exchange: Option<Arc<dyn HttpExchange>>,
    global_limiter: Arc<dyn GlobalRateLimiter>,
    strategy: Arc<dyn RateLimitStrategy>,
    route_strategies: Vec<(Route, Arc<dyn RateLimitStrategy>)>,
    response_functions: Vec<ResponseFunction>,
    server_retry: RetryPolicy<RouterError>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl Default for RouterOptionsBuilder {
    fn default() -> Self {
        Self {
            exchange: None,
            global_limiter: Arc::new(LocalGlobalRateLimiter::default()),
            strategy: Arc::new(HeaderStrategy::default()),
            route_strategies: Vec::new(),
            response_functions: Vec::new(),
            server_retry: RetryPolicy::server_errors(),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::default(),
        }
    }
}

impl RouterOptionsBuilder {
    /// Perform HTTP through `exchange`.
    pub fn exchange(mut self, exchange: impl HttpExchange + 'static) -> Self {
        self.exchange = Some(Arc::new(exchange));
        self
    }

    /// Perform HTTP through a shared exchange.
    pub fn shared_exchange(mut self, exchange: Arc<dyn HttpExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Share `limiter` with other routers.
    ///
    /// The default [`LocalGlobalRateLimiter`] admits a small pool of concurrent global
    /// operations. Pass [`LocalGlobalRateLimiter::single`] for exactly one global slot.
    pub fn global_limiter(mut self, limiter: Arc<dyn GlobalRateLimiter>) -> Self {
        self.global_limiter = limiter;
        self
    }

    /// Default response strategy.
    pub fn strategy(mut self, strategy: impl RateLimitStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Override the strategy for one route (matched on method and template).
    pub fn route_strategy(mut self, route: Route, strategy: impl RateLimitStrategy + 'static) -> Self {
        self.route_strategies.push((route, Arc::new(strategy)));
        self
    }

    /// Apply `function` to the outcome of every matching request, after rate-limit requeues and
    /// before the server-error retry. Functions apply in the order they are added.
    pub fn on_client_response(mut self, function: ResponseFunction) -> Self {
        self.response_functions.push(function);
        self
    }

    /// Replace the server-error retry policy.
    pub fn server_retry(mut self, policy: RetryPolicy<RouterError>) -> Self {
        self.server_retry = policy;
        self
    }

    /// Sleeper used by bucket queues.
    pub fn sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Send router events to `sink`.
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        self.telemetry = Telemetry::new(sink);
        self
    }

    /// Finish; fails without an exchange.
    pub fn build(self) -> Result<RouterOptions, BuildError> {
        let exchange = self.exchange.clone().ok_or(BuildError::MissingExchange)?;
        Ok(self.assemble(exchange))
    }

    fn assemble(self, exchange: Arc<dyn HttpExchange>) -> RouterOptions {
        RouterOptions {
            exchange,
            global_limiter: self.global_limiter,
            strategy: self.strategy,
            route_strategies: self.route_strategies,
            response_functions: self.response_functions,
            server_retry: self.server_retry,
            sleeper: self.sleeper,
            telemetry: self.telemetry,
        }
    }
}

/// Router keeping one queue per bucket in this process.
#[derive(Debug)]
pub struct DefaultRouter {
    options: RouterOptions,
    buckets: DashMap<BucketKey, Arc<RequestQueue>>,
}

impl DefaultRouter {
    /// Router over `options`. Must be used inside a tokio runtime.
    pub fn new(options: RouterOptions) -> Self {
        Self { options, buckets: DashMap::new() }
    }

    /// Options this router was built with.
    pub fn options(&self) -> &RouterOptions {
        &self.options
    }

    /// Queue for `key`, created on first use.
    pub fn queue(&self, key: &BucketKey) -> Arc<RequestQueue> {
        if let Some(queue) = self.buckets.get(key) {
            return queue.clone();
        }
        self.buckets
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(bucket = %key, "creating bucket queue");
                Arc::new(RequestQueue::new(key.clone(), self.options.sleeper.clone()))
            })
            .clone()
    }

    /// State of `key`'s queue, if it exists.
    pub fn bucket_state(&self, key: &BucketKey) -> Option<QueueState> {
        self.buckets.get(key).map(|q| q.state())
    }

    /// Number of buckets seen so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    async fn dispatch(&self, request: &Request) -> Result<Response, RouterError> {
        let key = BucketKey::of(request);
        let queue = self.queue(&key);
        let permit = queue.admit().await?;
        trace!(bucket = %key, "admitted");
        let telemetry = &self.options.telemetry;
        telemetry.emit(RouterEvent::Admitted { bucket: key.clone(), request: request.id() });

        let outcome = exchange_once(&self.options, request).await;
        if let Ok((_, info)) = &outcome {
            if !info.reset_after.is_zero() {
                queue.set_sleep_time(info.reset_after);
                telemetry.emit(RouterEvent::BucketDelayed { bucket: key.clone(), delay: info.reset_after });
            }
        }

        let status = outcome_status(&outcome);
        let result = outcome.and_then(|(response, info)| classify(request, response, info));
        drop(permit);
        telemetry.emit(RouterEvent::Completed { bucket: key, request: request.id(), status });
        result
    }
}

#[async_trait]
impl Router for DefaultRouter {
    async fn exchange(&self, request: Request) -> Result<Response, RouterError> {
        let span = tracing::debug_span!("exchange", request = %request.id(), route = %request.route());
        run_with_retries(&self.options, &request, |req| self.dispatch(req)).instrument(span).await
    }
}

/// One HTTP round trip under the global limiter.
///
/// Reads the rate-limit headers and engages the global cooldown when asked to; applying the
/// bucket delay is left to the caller, which owns the bucket.
pub(crate) async fn exchange_once(
    options: &RouterOptions,
    request: &Request,
) -> Result<(Response, RateLimitInfo), RouterError> {
    let limiter = &options.global_limiter;
    let strategy = options.strategy_for(request.route());
    limiter
        .with_limiter(async {
            let response = options.exchange.execute(request).await?;
            let info = strategy.apply(&response);
            if let Some(delay) = info.global {
                match limiter.rate_limit_for(delay).await {
                    Ok(()) => options.telemetry.emit(RouterEvent::GloballyLimited { delay }),
                    Err(e) => warn!(error = %e, ?delay, "could not engage global cooldown"),
                }
            }
            Ok((response, info))
        })
        .await
}

/// Status of the response behind `outcome`, if one was read.
pub(crate) fn outcome_status(outcome: &Result<(Response, RateLimitInfo), RouterError>) -> Option<u16> {
    match outcome {
        Ok((response, _)) => Some(response.status().as_u16()),
        Err(e) => e.status().map(|s| s.as_u16()),
    }
}

/// Map a response to the caller-facing result.
pub(crate) fn classify(
    request: &Request,
    response: Response,
    info: RateLimitInfo,
) -> Result<Response, RouterError> {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return Ok(response);
    }
    let error = ClientError::new(
        request.route().method().clone(),
        request.uri(),
        status,
        response.headers().clone(),
        response.body().clone(),
    );
    if status == StatusCode::TOO_MANY_REQUESTS {
        let global = info.global.is_some();
        let retry_after = info.global.unwrap_or(info.reset_after);
        return Err(RouterError::RateLimited { error, retry_after, global });
    }
    Err(RouterError::Client(error))
}

/// Server-error retry around response functions around rate-limit requeues around `dispatch`.
pub(crate) async fn run_with_retries<'a, F, Fut>(
    options: &'a RouterOptions,
    request: &'a Request,
    dispatch: F,
) -> Result<Response, RouterError>
where
    F: Fn(&'a Request) -> Fut + Send + Sync + 'a,
    Fut: Future<Output = Result<Response, RouterError>> + Send + 'a,
{
    let dispatch = &dispatch;
    let telemetry = options.telemetry.clone();
    let id = request.id();
    let server_retry = options.server_retry.clone().on_retry(move |attempt, delay, _error| {
        telemetry.emit(RouterEvent::Retrying {
            request: id,
            attempt,
            delay,
            reason: "server_error",
        })
    });
    let requeueing: Attempt<'_> =
        Arc::new(move || requeue_rate_limited(options, request, dispatch).boxed());
    let attempt = transform::chain(&options.response_functions, request, requeueing);
    server_retry.execute(|| attempt()).await
}

/// Dispatch until the outcome is something other than a 429.
async fn requeue_rate_limited<'a, F, Fut>(
    options: &RouterOptions,
    request: &'a Request,
    dispatch: &F,
) -> Result<Response, RouterError>
where
    F: Fn(&'a Request) -> Fut,
    Fut: Future<Output = Result<Response, RouterError>>,
{
    let mut rate_limited = 0usize;
    loop {
        match dispatch(request).await {
            Err(RouterError::RateLimited { retry_after, global, .. }) => {
                rate_limited += 1;
                debug!(?retry_after, global, attempt = rate_limited, "rate limited, requeueing");
                options.telemetry.emit(RouterEvent::Retrying {
                    request: request.id(),
                    attempt: rate_limited,
                    delay: retry_after,
                    reason: "rate_limited",
                });
            }
            other => return other,
        }
    }
}

/// [`Router`] as a `tower::Service`.
#[derive(Debug)]
pub struct RouterService<R> {
    router: Arc<R>,
}

impl<R> RouterService<R> {
    /// Serve requests through `router`.
    pub fn new(router: Arc<R>) -> Self {
        Self { router }
    }

    /// The wrapped router.
    pub fn router(&self) -> &Arc<R> {
        &self.router
    }
}

impl<R> Clone for RouterService<R> {
    fn clone(&self) -> Self {
        Self { router: self.router.clone() }
    }
}

impl<R> Service<Request> for RouterService<R>
where
    R: Router + 'static,
{
    type Response = Response;
    type Error = RouterError;
    type Future = BoxFuture<'static, Result<Response, RouterError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let router = self.router.clone();
        Box::pin(async move { router.exchange(request).await })
    }
}

/// Layer turning an HTTP service into a rate-limited [`RouterService`].
///
/// Every service produced by one layer shares the layer's global limiter.
#[derive(Debug, Clone)]
pub struct RouterLayer {
    builder: RouterOptionsBuilder,
}

impl RouterLayer {
    /// Layer applying `builder`'s configuration; any exchange set on it is replaced.
    pub fn new(builder: RouterOptionsBuilder) -> Self {
        Self { builder }
    }
}

impl<S> Layer<S> for RouterLayer
where
    S: Service<Request, Response = Response> + Clone + Send + Sync + 'static,
    S::Error: Into<RouterError>,
    S::Future: Send,
{
    type Service = RouterService<DefaultRouter>;

    fn layer(&self, inner: S) -> Self::Service {
        let options = self.builder.clone().assemble(Arc::new(ServiceExchange::new(inner)));
        RouterService::new(Arc::new(DefaultRouter::new(options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn request(route: &str, values: &[&str]) -> Request {
        Request::new(Route::get(route.to_string()), values.iter().copied()).unwrap()
    }

    #[test]
    fn classify_passes_successes_through() {
        let req = request("/gateway", &[]);
        let resp = classify(&req, Response::empty(StatusCode::NO_CONTENT), RateLimitInfo::default());
        assert_eq!(resp.unwrap().status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn classify_maps_error_statuses() {
        let req = request("/channels/{channel.id}", &["1"]);
        let err = classify(
            &req,
            Response::new(StatusCode::FORBIDDEN, HeaderMap::new(), r#"{"code":50013}"#),
            RateLimitInfo::default(),
        )
        .unwrap_err();
        let client = err.as_client_error().unwrap();
        assert_eq!(client.status(), StatusCode::FORBIDDEN);
        assert_eq!(client.uri(), "/channels/1");

        let limited = classify(
            &req,
            Response::empty(StatusCode::TOO_MANY_REQUESTS),
            RateLimitInfo { reset_after: Duration::ZERO, global: Some(Duration::from_secs(3)) },
        )
        .unwrap_err();
        assert!(matches!(
            limited,
            RouterError::RateLimited { global: true, retry_after, .. } if retry_after == Duration::from_secs(3)
        ));
    }

    #[test]
    fn builder_requires_an_exchange() {
        assert_eq!(RouterOptions::builder().build().unwrap_err(), BuildError::MissingExchange);
    }

    #[test]
    fn route_strategy_overrides_match_method_and_template() {
        let exchange = ServiceExchange::new(tower::service_fn(|_r: Request| async {
            Ok::<_, RouterError>(Response::empty(StatusCode::OK))
        }));
        let reaction = Route::put("/channels/{channel.id}/messages/{message.id}/reactions/{emoji}/@me");
        let options = RouterOptions::builder()
            .exchange(exchange)
            .route_strategy(
                reaction.clone(),
                crate::strategy::FixedDelayStrategy::new(Duration::from_millis(250)),
            )
            .build()
            .unwrap();
        let fixed = options.strategy_for(&reaction).apply(&Response::empty(StatusCode::NO_CONTENT));
        assert_eq!(fixed.reset_after, Duration::from_millis(250));
        let other = options
            .strategy_for(&Route::get("/gateway"))
            .apply(&Response::empty(StatusCode::NO_CONTENT));
        assert_eq!(other.reset_after, Duration::ZERO);
    }

    #[derive(Clone)]
    struct NeverReady;

    impl Service<RouterEvent> for NeverReady {
        type Response = ();
        type Error = std::convert::Infallible;
        type Future = futures::future::Ready<Result<(), Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn call(&mut self, _event: RouterEvent) -> Self::Future {
            futures::future::ready(Ok(()))
        }
    }

    impl TelemetrySink for NeverReady {
        type SinkError = std::convert::Infallible;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_sink_does_not_hold_buckets() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let http = tower::service_fn(move |_r: Request| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RouterError>(Response::empty(StatusCode::OK)) }
        });
        let options = RouterOptions::builder()
            .exchange(ServiceExchange::new(http))
            .telemetry(NeverReady)
            .build()
            .unwrap();
        let router = DefaultRouter::new(options);

        for _ in 0..3 {
            let response = tokio::time::timeout(
                Duration::from_secs(1),
                router.exchange(request("/channels/{channel.id}", &["7"])),
            )
            .await
            .expect("exchange stalled on telemetry");
            assert_eq!(response.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let key = BucketKey::of(&request("/channels/{channel.id}", &["7"]));
        assert_eq!(router.bucket_state(&key), Some(QueueState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn layer_builds_a_working_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let http = tower::service_fn(move |_r: Request| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, RouterError>(Response::empty(StatusCode::OK)) }
        });
        let sink = MemorySink::new();
        let service = RouterLayer::new(RouterOptions::builder().telemetry(sink.clone())).layer(http);
        let response = service.oneshot(request("/channels/{channel.id}", &["7"])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let events = sink.events();
        assert!(matches!(events.first(), Some(RouterEvent::Admitted { .. })));
        assert!(matches!(events.last(), Some(RouterEvent::Completed { status: Some(200), .. })));
    }
}
