//! End-to-end runs of the two-step login against a mock portal

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use union_monitor::error::LoginError;
use union_monitor::session::{SessionProvider, SessionStore};
use union_monitor::shutdown::ShutdownSignal;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_captcha_rejections_are_retried_until_login_succeeds() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(captcha_rejected())
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("id=union-admin"))
        .and(body_string_contains("recaptcha_res=captcha-3"))
        .respond_with(login_success("s%3Afirst"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let captcha = Arc::new(FakeCaptcha::default());
    let codes = Arc::new(FakeCodes::default());
    let client = session_client(&mock_server, captcha.clone(), codes.clone(), ShutdownSignal::new());

    let credential = tokio_test::assert_ok!(client.login().await);

    assert_eq!(credential.token(), "s%3Afirst");
    assert_eq!(captcha.calls(), 3, "one fresh captcha per submission");
    assert!(codes.requests().is_empty(), "no verification code needed");
}

#[tokio::test]
async fn test_verification_code_completes_login() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=&"))
        .respond_with(mfa_required())
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=123456"))
        .respond_with(login_success("s%3Averified"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let captcha = Arc::new(FakeCaptcha::default());
    let codes = Arc::new(FakeCodes::with_codes(&["123456"]));
    let client = session_client(&mock_server, captcha.clone(), codes.clone(), ShutdownSignal::new());

    let credential = client.login().await.unwrap();

    assert_eq!(credential.token(), "s%3Averified");
    assert_eq!(codes.requests().len(), 1);
    assert_eq!(captcha.calls(), 2);
}

#[tokio::test]
async fn test_step_two_captcha_rejection_reuses_the_code() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=&"))
        .respond_with(mfa_required())
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=654321"))
        .respond_with(captcha_rejected())
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=654321"))
        .respond_with(login_success("s%3Asecond"))
        .mount(&mock_server)
        .await;

    let codes = Arc::new(FakeCodes::with_codes(&["654321"]));
    let client = session_client(
        &mock_server,
        Arc::new(FakeCaptcha::default()),
        codes.clone(),
        ShutdownSignal::new(),
    );

    let credential = client.login().await.unwrap();

    assert_eq!(credential.token(), "s%3Asecond");
    assert_eq!(codes.requests().len(), 1, "cached code is resubmitted");
}

#[tokio::test]
async fn test_unmatched_code_fetches_a_newer_one() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=&"))
        .respond_with(mfa_required())
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=111111"))
        .respond_with(unmatched_code())
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .and(body_string_contains("mfacode=222222"))
        .respond_with(login_success("s%3Aretried"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let codes = Arc::new(FakeCodes::with_codes(&["111111", "222222"]));
    let client = session_client(
        &mock_server,
        Arc::new(FakeCaptcha::default()),
        codes.clone(),
        ShutdownSignal::new(),
    );

    let credential = client.login().await.unwrap();
    assert_eq!(credential.token(), "s%3Aretried");

    let requests = codes.requests();
    assert_eq!(requests.len(), 2);
    assert!(
        requests[1] > requests[0],
        "second fetch must only accept newer messages"
    );
}

#[tokio::test]
async fn test_code_timeout_fails_the_login() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(mfa_required())
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = session_client(
        &mock_server,
        Arc::new(FakeCaptcha::default()),
        Arc::new(FakeCodes::timing_out()),
        ShutdownSignal::new(),
    );

    assert_matches!(client.login().await, Err(LoginError::CodeTimeout));
}

#[tokio::test]
async fn test_unknown_response_is_a_protocol_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "err": 5, "msg": "account locked" })),
        )
        .mount(&mock_server)
        .await;

    let client = session_client(
        &mock_server,
        Arc::new(FakeCaptcha::default()),
        Arc::new(FakeCodes::default()),
        ShutdownSignal::new(),
    );

    let err = client.login().await.unwrap_err();
    assert_matches!(&err, LoginError::Protocol(msg) if msg.contains("account locked"));
}

#[tokio::test]
async fn test_shutdown_cancels_a_login_stuck_on_captcha() {
    let mock_server = MockServer::start().await;
    let shutdown = ShutdownSignal::new();
    let captcha = Arc::new(FakeCaptcha {
        never_solves: true,
        ..FakeCaptcha::default()
    });
    let client = session_client(
        &mock_server,
        captcha.clone(),
        Arc::new(FakeCodes::default()),
        shutdown.clone(),
    );

    let login = tokio::spawn(async move { client.acquire().await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.trigger();

    let result = tokio::time::timeout(Duration::from_secs(1), login)
        .await
        .expect("login should stop promptly")
        .unwrap();

    assert_matches!(result, Err(LoginError::Cancelled));
    assert!(captcha.calls() > 1);
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_single_flights_concurrent_logins() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(login_success("s%3Ashared").set_delay(Duration::from_millis(50)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = session_client(
        &mock_server,
        Arc::new(FakeCaptcha::default()),
        Arc::new(FakeCodes::default()),
        ShutdownSignal::new(),
    );
    let store = Arc::new(SessionStore::new(Arc::new(client), Duration::from_secs(3600)));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_acquire().await })
        })
        .collect();

    for task in tasks {
        let credential = task.await.unwrap().expect("credential");
        assert_eq!(credential.token(), "s%3Ashared");
    }
}
