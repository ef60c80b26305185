#![allow(missing_docs)]

mod common;

use bucketgate::telemetry::{MemorySink, RouterEvent};
use bucketgate::transform::{ResponseFunction, RouteMatcher, RETRY_ONCE_DELAY};
use bucketgate::{
    Backoff, BucketKey, DefaultRouter, InstantSleeper, Jitter, QueueState, Request, RetryPolicy,
    Route, Router, RouterError, RouterOptions,
};
use common::{settle, Reply, ScriptedExchange};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn message(channel: &str, message: u32) -> Request {
    Request::new(
        Route::get("/channels/{channel.id}/messages/{message.id}"),
        [channel.to_string(), message.to_string()],
    )
    .unwrap()
}

fn router(exchange: &ScriptedExchange) -> DefaultRouter {
    DefaultRouter::new(RouterOptions::builder().exchange(exchange.clone()).build().unwrap())
}

#[tokio::test(start_paused = true)]
async fn same_bucket_never_overlaps() {
    let exchange = ScriptedExchange::new();
    for _ in 0..8 {
        exchange.push(Reply::ok().after(Duration::from_millis(20)));
    }
    let router = router(&exchange);

    let requests = (0..4).flat_map(|i| [message("1", i), message("2", i)]);
    let results = join_all(requests.map(|r| router.exchange(r))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(exchange.calls().len(), 8);
    assert_eq!(exchange.overlaps(), 0);
    assert_eq!(router.bucket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn different_buckets_run_concurrently() {
    let exchange = ScriptedExchange::new();
    let router = router(&exchange);
    exchange.push(Reply::ok().after(Duration::from_millis(100)));
    exchange.push(Reply::ok().after(Duration::from_millis(100)));

    let start = Instant::now();
    let (a, b) = tokio::join!(router.exchange(message("1", 0)), router.exchange(message("2", 0)));
    a.unwrap();
    b.unwrap();
    assert!(start.elapsed() < Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn bucket_preserves_submission_order() {
    let exchange = ScriptedExchange::new();
    for _ in 0..5 {
        exchange.push(Reply::ok().after(Duration::from_millis(5)));
    }
    let router = router(&exchange);

    join_all((0..5).map(|i| router.exchange(message("123", i)))).await;
    let order: Vec<String> = exchange.calls().into_iter().map(|c| c.path).collect();
    let expected: Vec<String> = (0..5).map(|i| format!("/channels/123/messages/{i}")).collect();
    assert_eq!(order, expected);
}

#[tokio::test(start_paused = true)]
async fn learned_delay_holds_back_the_next_request() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::ok().after(Duration::from_millis(50)).exhausted(Duration::from_millis(200)));
    let router = router(&exchange);

    let start = Instant::now();
    let (r1, r2) = tokio::join!(router.exchange(message("123", 1)), router.exchange(message("123", 2)));
    r1.unwrap();
    r2.unwrap();

    let second = &exchange.calls_to("/channels/123/messages/2")[0];
    assert!(second.started - start >= Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_request_goes_behind_waiting_requests() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(429).header("retry-after", "0.1").after(Duration::from_millis(10)));
    let sink = MemorySink::new();
    let options =
        RouterOptions::builder().exchange(exchange.clone()).telemetry(sink.clone()).build().unwrap();
    let router = DefaultRouter::new(options);

    let start = Instant::now();
    let (r1, r2) = tokio::join!(router.exchange(message("7", 1)), router.exchange(message("7", 2)));
    assert!(r1.is_ok(), "429 should be absorbed: {r1:?}");
    r2.unwrap();

    let order: Vec<String> = exchange.calls().into_iter().map(|c| c.path).collect();
    assert_eq!(
        order,
        ["/channels/7/messages/1", "/channels/7/messages/2", "/channels/7/messages/1"]
    );
    // the retry-after delayed the bucket, not just the retried request
    assert!(exchange.calls()[1].started - start >= Duration::from_millis(110));
    assert!(sink.events().iter().any(|e| matches!(
        e,
        RouterEvent::Retrying { reason: "rate_limited", attempt: 1, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried_with_backoff() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(503));
    let router = router(&exchange);

    let response = router.exchange(message("9", 1)).await.unwrap();
    assert_eq!(response.status(), 200);

    let calls = exchange.calls();
    assert_eq!(calls.len(), 2);
    let gap = calls[1].started - calls[0].finished;
    assert!(gap >= Duration::from_secs(1) && gap <= Duration::from_secs(3), "gap {gap:?}");
}

#[tokio::test(start_paused = true)]
async fn transport_failures_are_retried() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::transport_error());
    exchange.push(Reply::transport_error());
    let router = router(&exchange);

    router.exchange(message("9", 1)).await.unwrap();
    assert_eq!(exchange.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn client_errors_surface_and_release_the_bucket() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(404));
    let router = router(&exchange);

    let request = message("3", 1);
    let key = BucketKey::of(&request);
    let err = router.exchange(request).await.unwrap_err();
    assert!(matches!(&err, RouterError::Client(e) if e.status() == 404));
    assert_eq!(exchange.calls().len(), 1, "4xx must not be retried");

    settle().await;
    assert_eq!(router.bucket_state(&key), Some(QueueState::Idle));
    router.exchange(message("3", 2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_releases_the_bucket() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::ok().after(Duration::from_secs(60)));
    let router = Arc::new(router(&exchange));

    let r = router.clone();
    let stuck = tokio::spawn(async move { r.exchange(message("4", 1)).await });
    settle().await;
    stuck.abort();
    let _ = stuck.await;

    let start = Instant::now();
    tokio::time::timeout(Duration::from_secs(1), router.exchange(message("4", 2)))
        .await
        .expect("bucket stayed blocked after cancellation")
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn method_scoped_routes_get_their_own_bucket() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::ok().after(Duration::from_millis(100)));
    exchange.push(Reply::ok().after(Duration::from_millis(100)));
    let router = router(&exchange);
    let delete = Route::delete("/channels/{channel.id}/messages/{message.id}").scoped_by_method();

    let start = Instant::now();
    let (a, b) = tokio::join!(
        router.exchange(message("5", 1)),
        router.exchange(Request::new(delete, ["5", "2"]).unwrap())
    );
    a.unwrap();
    b.unwrap();
    assert!(start.elapsed() < Duration::from_millis(150));
    assert_eq!(router.bucket_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn retried_server_error_does_not_jump_the_queue() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(500).after(Duration::from_millis(10)));
    let retry = RetryPolicy::<RouterError>::builder()
        .unbounded()
        .backoff(Backoff::constant(Duration::ZERO))
        .with_jitter(Jitter::None)
        .should_retry(RouterError::is_retryable_server_error)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let options = RouterOptions::builder().exchange(exchange.clone()).server_retry(retry).build().unwrap();
    let router = DefaultRouter::new(options);

    let (r1, r2) = tokio::join!(router.exchange(message("8", 1)), router.exchange(message("8", 2)));
    r1.unwrap();
    r2.unwrap();
    let order: Vec<String> = exchange.calls().into_iter().map(|c| c.path).collect();
    assert_eq!(
        order,
        ["/channels/8/messages/1", "/channels/8/messages/2", "/channels/8/messages/1"]
    );
}

#[tokio::test(start_paused = true)]
async fn not_found_on_a_matching_route_comes_back_empty() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(404).header("x-audit", "1"));
    exchange.push(Reply::status(404));
    let messages = Route::get("/channels/{channel.id}/messages/{message.id}");
    let options = RouterOptions::builder()
        .exchange(exchange.clone())
        .on_client_response(
            ResponseFunction::empty_if_not_found().matching(RouteMatcher::route(messages)),
        )
        .build()
        .unwrap();
    let router = DefaultRouter::new(options);

    let response = router.exchange(message("5", 1)).await.unwrap();
    assert_eq!(response.status(), 404);
    assert!(response.body().is_empty());
    assert_eq!(response.headers()["x-audit"], "1");

    let guild = Request::new(Route::get("/guilds/{guild.id}"), ["9"]).unwrap();
    let err = router.exchange(guild).await.unwrap_err();
    assert_eq!(err.status().map(|s| s.as_u16()), Some(404));
}

#[tokio::test(start_paused = true)]
async fn retry_once_goes_back_through_the_bucket() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(409));
    let options = RouterOptions::builder()
        .exchange(exchange.clone())
        .on_client_response(ResponseFunction::retry_once_on_error_status([409]))
        .build()
        .unwrap();
    let router = DefaultRouter::new(options);

    let request = message("6", 1);
    let key = BucketKey::of(&request);
    router.exchange(request).await.unwrap();

    let calls = exchange.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].started - calls[0].finished >= RETRY_ONCE_DELAY);
    assert_eq!(router.bucket_state(&key), Some(QueueState::Idle));
}

#[tokio::test(start_paused = true)]
async fn response_functions_never_see_rate_limits() {
    let exchange = ScriptedExchange::new();
    exchange.push(Reply::status(429).header("retry-after", "0.1"));
    let options = RouterOptions::builder()
        .exchange(exchange.clone())
        .on_client_response(ResponseFunction::empty_on_error_status([429]))
        .build()
        .unwrap();
    let router = DefaultRouter::new(options);

    let response = router.exchange(message("7", 1)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(exchange.calls().len(), 2);
}
