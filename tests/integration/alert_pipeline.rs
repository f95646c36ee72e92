//! Snapshot → evaluation → Telegram delivery through the wired application context

use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer};

use crate::helpers::*;

#[tokio::test]
async fn test_pnl_floor_alert_fans_out_and_respects_cooldown() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Aalerts").await;
    mount_listing(
        &mock_server,
        vec![
            club_row(250793, "-950", "-100", "", ""),
            club_row(102, "10", "0", "1,000", "1,000"),
        ],
    )
    .await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .and(body_partial_json(serde_json::json!({ "parse_mode": "HTML" })))
        .respond_with(telegram_ok())
        .expect(4)
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(250793));
    let mut engine = context.alert_engine();
    let t0 = Utc::now();

    let first = engine.check_cycle(t0).await;
    assert_eq!((first.entities, first.alerts, first.delivered), (2, 1, 2));

    let mut recipients: Vec<i64> = telegram_messages(&mock_server)
        .await
        .iter()
        .filter_map(|m| m["chat_id"].as_i64())
        .collect();
    recipients.sort();
    assert_eq!(recipients, vec![UNION_HEAD, CLUB_OWNER]);

    let text = telegram_messages(&mock_server).await[0]["text"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(text.contains("SIGNIFICANT LOSS ALERT"));
    assert!(text.contains("Club 250793"));
    assert!(text.contains("$-1,050.00"));

    let muted = engine.check_cycle(t0 + chrono::Duration::seconds(120)).await;
    assert_eq!((muted.alerts, muted.suppressed), (0, 1));

    let again = engine.check_cycle(t0 + chrono::Duration::seconds(301)).await;
    assert_eq!(again.alerts, 1);
    assert_eq!(telegram_messages(&mock_server).await.len(), 4);
}

#[tokio::test]
async fn test_only_union_heads_hear_about_unassigned_clubs() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Aalerts").await;
    mount_listing(&mock_server, vec![club_row(7, "-950", "0", "1,000", "")]).await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .respond_with(telegram_ok())
        .expect(1)
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(250793));

    let report = context.check_once().await;

    assert_eq!(report.alerts, 1);
    let messages = telegram_messages(&mock_server).await;
    assert_eq!(messages[0]["chat_id"], UNION_HEAD);
    assert!(messages[0]["text"].as_str().unwrap().contains("LOSS LIMIT WARNING"));
    assert!(messages[0]["text"].as_str().unwrap().contains("95.0%"));
}

#[tokio::test]
async fn test_zero_limits_never_alert() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Aalerts").await;
    mount_listing(
        &mock_server,
        vec![
            club_row(1, "-999", "0", "0", "0"),
            club_row(2, "999", "0", "", "0"),
        ],
    )
    .await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .respond_with(telegram_ok())
        .expect(0)
        .mount(&mock_server)
        .await;

    let (context, _captcha) = context(&mock_server, roles(1));
    let report = context.check_once().await;

    assert_eq!(report.entities, 2);
    assert_eq!(report.alerts, 0);
}

#[tokio::test]
async fn test_running_app_logs_in_and_alerts_until_stopped() {
    let mock_server = MockServer::start().await;
    mount_direct_login(&mock_server, "s%3Arunning").await;
    mount_listing(&mock_server, vec![club_row(250793, "-2,000", "0", "", "")]).await;

    Mock::given(method("POST"))
        .and(path(telegram_path()))
        .respond_with(telegram_ok())
        .mount(&mock_server)
        .await;

    let (context, captcha) = context(&mock_server, roles(250793));

    let running = context.start().await;
    assert_eq!(
        context.store.current().await.map(|c| c.token().to_string()),
        Some("s%3Arunning".to_string())
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(telegram_messages(&mock_server).await.len(), 2);

    let report = running.alerts.check_now().await.unwrap();
    assert_eq!(report.suppressed, 1);

    let alerts = running.alerts.clone();
    running.stop().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!alerts.is_running());
    assert_eq!(captcha.calls(), 1, "the refresher has not fired yet");
}
