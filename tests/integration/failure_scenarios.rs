//! Degraded portal, login and delivery behavior
//!
//! None of these may surface as an error from a check cycle; the cycle is either
//! skipped or completes with partial results.

use chrono::Utc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_rejected_session_is_dropped_and_reacquired() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(login_success("s%3Arenewed"))
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/clublimit"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html><form action=\"/login\"></form></html>"),
        )
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    mount_listing(&mock_server, vec![]).await;

    let (context, captcha) = context(&mock_server, roles(1));
    let mut engine = context.alert_engine();

    let rejected = engine.check_cycle(Utc::now()).await;
    assert!(rejected.skipped);
    assert!(context.store.current().await.is_none());

    let recovered = engine.check_cycle(Utc::now()).await;
    assert!(!recovered.skipped);
    assert_eq!(captcha.calls(), 2);
}

#[tokio::test]
async fn test_portal_outage_skips_cycle_and_keeps_session() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Akept").await;

    Mock::given(method("POST"))
        .and(path("/clublimit"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(1));

    let report = context.check_once().await;

    assert!(report.skipped);
    assert_eq!(report.entities, 0);
    assert!(context.store.current().await.is_some());
}

#[tokio::test]
async fn test_failed_login_skips_cycle_without_fetching() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/clublimit"))
        .respond_with(listing(vec![]))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(1));

    let report = context.check_once().await;

    assert!(report.skipped);
    assert!(context.store.current().await.is_none());
}

#[tokio::test]
async fn test_malformed_rows_do_not_hide_healthy_ones() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Arows").await;
    mount_listing(
        &mock_server,
        vec![
            serde_json::json!({ "f2": "no backend id" }),
            serde_json::json!("not even an object"),
            club_row(5, "-1,500", "0", "", ""),
        ],
    )
    .await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .respond_with(telegram_ok())
        .expect(1)
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(5)[..1].to_vec());
    let report = context.check_once().await;

    assert_eq!(report.entities, 1);
    assert_eq!(report.alerts, 1);
}

#[tokio::test]
async fn test_blocked_recipient_still_starts_cooldown() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Ablocked").await;
    mount_listing(&mock_server, vec![club_row(9, "-1,200", "0", "", "")]).await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .and(body_string_contains(&format!("\"chat_id\":{CLUB_OWNER}")))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "ok": false,
            "description": "Forbidden: bot was blocked by the user"
        })))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .respond_with(telegram_ok())
        .expect(1)
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(9));
    let mut engine = context.alert_engine();
    let t0 = Utc::now();

    let first = engine.check_cycle(t0).await;
    assert_eq!((first.delivered, first.failed), (1, 1));

    let second = engine.check_cycle(t0 + chrono::Duration::seconds(30)).await;
    assert_eq!(second.alerts, 0);
    assert_eq!(second.suppressed, 1);
}
