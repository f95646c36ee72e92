//! Shared fakes and mock-portal builders for integration tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use union_monitor::app::AppContext;
use union_monitor::captcha::{CaptchaSolver, SolveBackoff};
use union_monitor::config::{Config, Role, RoleEntry, TelegramConfig};
use union_monitor::error::LoginError;
use union_monitor::login::{LoginPolicy, PortalCredentials, SessionClient};
use union_monitor::mfa::VerificationCodeSource;
use union_monitor::notify::TelegramNotifier;
use union_monitor::portal::PortalClient;
use union_monitor::recipients::RoleTable;
use union_monitor::shutdown::ShutdownSignal;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const BOT_TOKEN: &str = "4242:test";
pub const UNION_HEAD: i64 = 100;
pub const CLUB_OWNER: i64 = 200;

/// Hands out a fresh token per call, optionally failing forever.
#[derive(Default)]
pub struct FakeCaptcha {
    pub calls: AtomicUsize,
    pub never_solves: bool,
}

impl FakeCaptcha {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptchaSolver for FakeCaptcha {
    async fn solve(&self) -> Option<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (!self.never_solves).then(|| format!("captcha-{call}"))
    }
}

/// Returns queued codes in order and records the `since` of each request.
#[derive(Default)]
pub struct FakeCodes {
    codes: Mutex<VecDeque<Result<String, LoginError>>>,
    pub requests: Mutex<Vec<DateTime<Utc>>>,
}

impl FakeCodes {
    pub fn with_codes(codes: &[&str]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().map(|c| Ok(c.to_string())).collect()),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn timing_out() -> Self {
        Self {
            codes: Mutex::new(VecDeque::from([Err(LoginError::CodeTimeout)])),
            requests: Mutex::new(vec![]),
        }
    }

    pub fn requests(&self) -> Vec<DateTime<Utc>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl VerificationCodeSource for FakeCodes {
    async fn fetch_code(
        &self,
        since: DateTime<Utc>,
        _timeout: Duration,
    ) -> Result<String, LoginError> {
        self.requests.lock().unwrap().push(since);
        self.codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LoginError::CodeTimeout))
    }
}

pub fn fast_policy() -> LoginPolicy {
    LoginPolicy {
        rejection_step: Duration::from_millis(5),
        rejection_cap: Duration::from_millis(20),
        unmatched_delay: Duration::from_millis(10),
        code_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(5),
    }
}

pub fn fast_backoff() -> SolveBackoff {
    SolveBackoff {
        start: Duration::from_millis(1),
        cap: Duration::from_millis(5),
    }
}

pub fn session_client(
    server: &MockServer,
    captcha: Arc<FakeCaptcha>,
    codes: Arc<FakeCodes>,
    shutdown: ShutdownSignal,
) -> SessionClient {
    SessionClient::new(
        &server.uri(),
        PortalCredentials {
            login_id: "union-admin".to_string(),
            password: "hunter2".to_string(),
        },
        captcha,
        codes,
        fast_backoff(),
        fast_policy(),
        shutdown,
    )
}

pub fn login_success(sid: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("set-cookie", format!("connect.sid={sid}; Path=/; HttpOnly"))
        .set_body_json(json!({ "err": 0, "msg": "", "data": {} }))
}

pub fn captcha_rejected() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "err": -2, "msg": "reCAPTCHA failed" }))
}

pub fn mfa_required() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "err": 1,
        "msg": "",
        "data": { "code": "REQUIRED_MFA_CODE", "description": { "codeSent": true } }
    }))
}

pub fn unmatched_code() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "err": 1,
        "msg": "",
        "data": { "code": "UNMATCHED_VERIFICATION_CODE", "message": "Unmatched verification code." }
    }))
}

/// Step 1 succeeds straight away with `sid`.
pub async fn mount_direct_login(server: &MockServer, sid: &str) {
    Mock::given(method("POST"))
        .and(path("/login_submit"))
        .respond_with(login_success(sid))
        .mount(server)
        .await;
}

pub fn club_row(cno: i64, ring: &str, tournament: &str, loss: &str, win: &str) -> Value {
    json!({
        "num": "1", "uno": "7", "cno": cno, "non": 0,
        "f1": format!("{cno}-pub"), "f2": format!("Club {cno}"), "f3": "owner",
        "f4": ring, "f4_ty": 0, "f5": tournament, "f5_ty": 0,
        "f6": loss, "f7": win, "f8": "Y", "edit_yn": 1
    })
}

pub fn listing(rows: Vec<Value>) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "COMM": { "ret": 0 },
        "PAGE": { "tot_pages": 1, "cur_page": 1 },
        "DATA": rows
    }))
}

pub async fn mount_listing(server: &MockServer, rows: Vec<Value>) {
    Mock::given(method("POST"))
        .and(path("/clublimit"))
        .and(body_string_contains("iam=list"))
        .respond_with(listing(rows))
        .mount(server)
        .await;
}

pub fn telegram_path() -> String {
    format!("/bot{BOT_TOKEN}/sendMessage")
}

pub fn telegram_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": {} }))
}

pub fn roles(club: i64) -> Vec<RoleEntry> {
    vec![
        RoleEntry {
            user_id: UNION_HEAD,
            role: Role::UnionHead,
            clubs: vec![],
        },
        RoleEntry {
            user_id: CLUB_OWNER,
            role: Role::ClubOwner,
            clubs: vec![club],
        },
    ]
}

/// A fully wired context whose portal, login endpoint and Telegram all live on `server`.
pub fn context(server: &MockServer, roles: Vec<RoleEntry>) -> (AppContext, Arc<FakeCaptcha>) {
    let mut config = Config::default();
    config.portal.base_url = server.uri();
    config.alerts.interval_secs = 3600;
    config.session.refresh_interval_secs = 3600;
    config.roles = roles.clone();

    let shutdown = ShutdownSignal::new();
    let captcha = Arc::new(FakeCaptcha::default());
    let client = session_client(
        server,
        captcha.clone(),
        Arc::new(FakeCodes::default()),
        shutdown.clone(),
    );
    let portal = PortalClient::new(&server.uri(), Duration::from_secs(5)).unwrap();
    let notifier = TelegramNotifier::new(
        &TelegramConfig {
            api_url: server.uri(),
            request_timeout_secs: 5,
        },
        BOT_TOKEN,
    )
    .unwrap();

    let context = AppContext::from_parts(
        config,
        shutdown,
        Arc::new(client),
        Arc::new(portal),
        Arc::new(RoleTable::new(roles)),
        Arc::new(notifier),
    );
    (context, captcha)
}

/// Bodies of all Telegram requests the server has seen so far.
pub async fn telegram_messages(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == telegram_path())
        .filter_map(|r| serde_json::from_slice(&r.body).ok())
        .collect()
}
