use buildkite_test_collector::core::{Payload, TestData};
use buildkite_test_collector::{ApiClient, RunEnvBuilder};
use httpmock::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

fn env(token: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::from([("CI".to_string(), "true".to_string())]);
    if let Some(token) = token {
        env.insert("BUILDKITE_ANALYTICS_TOKEN".to_string(), token.to_string());
    }
    env
}

fn successful_test() -> TestData {
    let mut test = TestData::start(Uuid::new_v4(), "tests::api", "uploads");
    test.passed();
    test.finish();
    test
}

fn failed_test() -> TestData {
    let mut test = TestData::start(Uuid::new_v4(), "tests::api", "breaks");
    test.failed(Some("boom".to_string()), vec![]);
    test.finish();
    test
}

fn payload_with(tests: Vec<TestData>) -> Payload {
    let mut payload = Payload::init(RunEnvBuilder::new(&env(None)).build()).started();
    for test in tests {
        payload.push_test_data(test);
    }
    payload
}

fn accepted_body() -> serde_json::Value {
    serde_json::json!({
        "id": Uuid::new_v4().to_string(),
        "run_id": Uuid::new_v4().to_string(),
        "queued": 1,
        "skipped": 0,
        "errors": [],
        "run_url": "https://buildkite.com/organizations/acme/analytics/suites/test/runs/52c5d9f6"
    })
}

fn client(base_url: &str, token: Option<&str>) -> ApiClient {
    ApiClient::new(base_url, token, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_submit_without_token_returns_none() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/uploads");
        then.status(202);
    });

    let outcomes = client(&server.base_url(), None)
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    assert_eq!(outcomes, vec![None]);
    mock.assert_hits(0);
}

#[tokio::test]
async fn test_submit_with_blank_token_returns_none() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/uploads");
        then.status(202);
    });

    let outcomes = client(&server.base_url(), Some("\n"))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    assert_eq!(outcomes, vec![None]);
    mock.assert_hits(0);
}

#[tokio::test]
async fn test_submit_returns_api_response() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/uploads")
            .json_body_partial(r#"{"format": "json", "run_env": {"CI": "generic"}}"#);
        then.status(202).json_body(accepted_body());
    });

    let token = Uuid::new_v4().to_string();
    let outcomes = client(&server.url("/v1"), Some(&token))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    mock.assert();
    let response = outcomes[0].as_ref().unwrap();
    assert!(response.status >= 200 && response.status < 300);
    assert_eq!(response.body["errors"].as_array().unwrap().len(), 0);
    assert_eq!(response.queued(), Some(1));
}

#[tokio::test]
async fn test_submit_with_bad_response_returns_none() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/uploads");
        then.status(401)
            .json_body(serde_json::json!({"error": Uuid::new_v4().to_string()}));
    });

    let outcomes = client(&server.base_url(), Some("token"))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    assert_eq!(outcomes, vec![None]);
}

#[tokio::test]
async fn test_submit_with_large_payload_batches_requests() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/uploads");
        then.status(202).json_body(accepted_body());
    });

    let outcomes = client(&server.base_url(), Some("token"))
        .submit(payload_with(vec![successful_test(), failed_test()]), 1)
        .await;

    mock.assert_hits(2);
    assert_eq!(outcomes.len(), 2);
    for outcome in outcomes {
        let response = outcome.unwrap();
        assert!(response.is_success());
        assert_eq!(response.queued(), Some(1));
    }
}

#[tokio::test]
async fn test_failing_batch_does_not_stop_later_batches() {
    let server = MockServer::start();
    let rejected = server.mock(|when, then| {
        when.method(POST)
            .path("/uploads")
            .body_contains("\"name\":\"uploads\"");
        then.status(400);
    });
    let accepted = server.mock(|when, then| {
        when.method(POST)
            .path("/uploads")
            .body_contains("\"name\":\"breaks\"");
        then.status(202).json_body(accepted_body());
    });

    let outcomes = client(&server.base_url(), Some("token"))
        .submit(payload_with(vec![successful_test(), failed_test()]), 1)
        .await;

    rejected.assert();
    accepted.assert();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_none());
    assert!(outcomes[1].as_ref().unwrap().is_success());
}

#[tokio::test]
async fn test_read_timeout_returns_none() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/uploads");
        then.status(202).delay(Duration::from_millis(800));
    });

    let outcomes = ApiClient::new(&server.base_url(), Some("token"), Duration::from_millis(100))
        .unwrap()
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    assert_eq!(outcomes, vec![None]);
}

#[tokio::test]
async fn test_connection_refused_returns_none() {
    // Port 9 (discard) is not listening on test machines.
    let outcomes = client("http://127.0.0.1:9/v1", Some("token"))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    assert_eq!(outcomes, vec![None]);
}

#[tokio::test]
async fn test_connection_refused_is_retried_then_gives_up() {
    let started = std::time::Instant::now();
    let outcomes = ApiClient::new("http://127.0.0.1:9/v1", Some("token"), Duration::from_secs(5))
        .unwrap()
        .with_retries(2, Duration::from_millis(50))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    // Two backoffs: 50ms then 100ms.
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(outcomes, vec![None]);
}

#[tokio::test]
async fn test_rate_limited_upload_is_retried() {
    let server = MockServer::start();
    let limited = server.mock(|when, then| {
        when.method(POST).path("/uploads");
        then.status(429).header("Retry-After", "0");
    });

    let outcomes = ApiClient::new(&server.base_url(), Some("token"), Duration::from_secs(5))
        .unwrap()
        .with_retries(2, Duration::from_millis(1))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    limited.assert_hits(3);
    assert_eq!(outcomes, vec![None]);
}

#[tokio::test]
async fn test_api_url_override() {
    let server = MockServer::start();
    let upload_id = Uuid::new_v4().to_string();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/something-else/v1/uploads");
        then.status(202)
            .json_body(serde_json::json!({"upload_id": upload_id}));
    });

    let outcomes = client(&server.url("/something-else/v1"), Some("token"))
        .submit(payload_with(vec![successful_test()]), 100)
        .await;

    mock.assert();
    assert_eq!(outcomes[0].as_ref().unwrap().body["upload_id"], upload_id);
}
