//! The reqwest strategies and the crawler against a local HTTP server.

use std::time::Duration;

use argos_client::{ChallengeExecutor, HttpExecutor, http_strategies};
use argos_core::config::EngineConfig;
use argos_core::fetch::{FetchRequest, FetchStatus};
use argos_core::strategy::Strategy;
use argos_core::testutil::good_page;
use argos_core::traits::{Fetcher, StrategyExecutor};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn plain_executor_returns_any_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410).set_body_string("gone"))
        .mount(&server)
        .await;

    let executor = HttpExecutor::plain().unwrap().allow_private_urls();
    let response = executor
        .execute(&format!("{}/gone", server.uri()), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(response.status, 410);
    assert_eq!(response.body, "gone");
}

#[tokio::test]
async fn slow_response_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let executor = HttpExecutor::plain().unwrap().allow_private_urls();
    let err = executor
        .execute(&server.uri(), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, argos_core::AppError::Timeout(_)), "{err}");
}

#[tokio::test]
async fn crawler_escalates_from_plain_to_stealth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .and(header("sec-fetch-mode", "navigate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(good_page("Article")))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(ResponseTemplate::new(403).set_body_string("Access denied"))
        .mount(&server)
        .await;

    let config = EngineConfig::default();
    let crawler = argos_client::crawler(&config, http_strategies(true).unwrap());
    let url = format!("{}/article", server.uri());

    let result = crawler.fetch(&FetchRequest::new(url.as_str()).unwrap()).await;

    assert_eq!(result.status, FetchStatus::Success);
    assert_eq!(result.strategy, Some(Strategy::StealthHttp));
    assert_eq!(result.trace.len(), 2);
    assert_eq!(crawler.cache().get(&url).await.map(|e| e.strategy), Some(Strategy::StealthHttp));
}

#[tokio::test]
async fn challenge_executor_primes_cookies_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "session=primed; Path=/")
                .set_body_string("welcome"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/record"))
        .and(header("cookie", "session=primed"))
        .and(header("referer", format!("{}/", server.uri()).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(good_page("Record")))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/record"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let executor = ChallengeExecutor::new().unwrap().allow_private_urls();
    let response = executor
        .execute(&format!("{}/record", server.uri()), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert!(response.body.contains("Record"));
}
