//! Integration tests for `HttpFetcher` and `Downloader` against a mock server.

use std::sync::Arc;
use std::time::Duration;

use docfetch_core::download::{
    Downloader, ErrorKind, FetchRequest, Fetcher, HttpFetcher, RateLimiter, RetryPolicy,
};
use docfetch_core::queue::{Priority, Task, TaskPayload};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn pdf_body() -> Vec<u8> {
    let mut body = b"%PDF-1.7\n".to_vec();
    body.extend(std::iter::repeat_n(b'x', 256));
    body
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(10),
        Duration::from_millis(50),
        2.0,
    )
    .with_max_jitter(Duration::ZERO)
}

fn downloader(max_attempts: u32) -> Downloader {
    Downloader::new(
        Arc::new(HttpFetcher::with_timeouts(
            Duration::from_secs(5),
            Duration::from_secs(5),
        )),
        Arc::new(RateLimiter::disabled()),
        fast_retries(max_attempts),
    )
}

fn task(url: String) -> Task {
    Task::new(TaskPayload::new(url), Priority::Other)
}

#[tokio::test]
async fn test_fetch_returns_body_and_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/judgment.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(pdf_body())
                .insert_header("content-type", "application/pdf"),
        )
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new();
    let url = format!("{}/judgment.pdf", server.uri());
    let response = fetcher.fetch(FetchRequest::direct(&url)).await.unwrap();

    assert!(response.is_success());
    assert_eq!(response.body, pdf_body());
    assert_eq!(response.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(fetcher.cached_clients(), 1);
}

#[tokio::test]
async fn test_fetch_rejects_body_over_cap() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/huge.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; 4096]))
        .mount(&server)
        .await;

    let fetcher = HttpFetcher::new().with_max_body_bytes(1024);
    let url = format!("{}/huge.pdf", server.uri());
    let error = fetcher.fetch(FetchRequest::direct(&url)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Permanent);
}

#[tokio::test]
async fn test_server_error_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pdf_body()))
        .expect(1)
        .mount(&server)
        .await;

    let downloader = downloader(3);
    let result = downloader
        .execute(&task(format!("{}/flaky.pdf", server.uri())))
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.status, Some(200));
    assert_eq!(result.bytes, pdf_body().len() as u64);
    assert_eq!(downloader.retried(), 2);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let downloader = downloader(4);
    let result = downloader
        .execute(&task(format!("{}/missing.pdf", server.uri())))
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.status, Some(404));
    assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    assert_eq!(downloader.retried(), 0);
}

#[tokio::test]
async fn test_persistent_server_error_exhausts_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let result = downloader(3)
        .execute(&task(format!("{}/down.pdf", server.uri())))
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.error_kind, Some(ErrorKind::Transient));
}

#[tokio::test]
async fn test_html_error_page_fails_pdf_validation() {
    let server = MockServer::start().await;
    let login_page = format!("<!DOCTYPE html><html><body>{}</body></html>", "x".repeat(200));
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(login_page))
        .expect(1)
        .mount(&server)
        .await;

    let result = downloader(3)
        .execute(&task(format!("{}/order.pdf", server.uri())))
        .await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.error_kind, Some(ErrorKind::Permanent));
    assert!(result.body.is_none());
}

#[tokio::test]
async fn test_rate_limited_response_honours_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(pdf_body()))
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let result = downloader(2)
        .execute(&task(format!("{}/busy.pdf", server.uri())))
        .await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_unreachable_host_is_transient() {
    // Port 9 on localhost is almost never listening
    let result = downloader(1)
        .execute(&task("http://127.0.0.1:9/closed.pdf".to_string()))
        .await;

    assert!(!result.success);
    assert_eq!(result.status, None);
    assert_eq!(result.error_kind, Some(ErrorKind::Transient));
}
