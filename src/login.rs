//! Two-step portal login: credentials + captcha, then an optional emailed code
//!
//! ## State machine
//!
//! ```text
//! START → CAPTCHA_RETRY ──┬──→ SUCCESS
//!                         └──→ MFA_REQUIRED → MFA_RETRY → SUCCESS
//! ```
//!
//! Captcha rejections and unmatched codes loop inside their state. Everything the
//! machine does not recognise ends the call with [`LoginError::Protocol`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{Client, Response};
use serde::{Deserialize, Deserializer, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::captcha::{CaptchaSolver, SolveBackoff, solve_forever};
use crate::config::{LoginConfig, MailboxConfig, PortalConfig};
use crate::error::{LoginError, excerpt};
use crate::mfa::VerificationCodeSource;
use crate::session::{SessionCredential, SessionProvider};
use crate::shutdown::ShutdownSignal;
use crate::util::{lenient_text, mask_secret};

pub const SESSION_COOKIE: &str = "connect.sid";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36";

#[derive(Clone, Default)]
pub struct PortalCredentials {
    pub login_id: String,
    pub password: String,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("login_id", &self.login_id)
            .field("password", &mask_secret(&self.password))
            .finish()
    }
}

impl PortalCredentials {
    pub fn is_complete(&self) -> bool {
        !self.login_id.trim().is_empty() && !self.password.is_empty()
    }
}

/// Timings of the login retry loops
#[derive(Debug, Clone, Copy)]
pub struct LoginPolicy {
    pub rejection_step: Duration,
    pub rejection_cap: Duration,
    pub unmatched_delay: Duration,
    pub code_timeout: Duration,
    pub request_timeout: Duration,
}

impl LoginPolicy {
    pub fn new(login: &LoginConfig, mailbox: &MailboxConfig, portal: &PortalConfig) -> Self {
        Self {
            rejection_step: Duration::from_millis(login.rejection_backoff_step_ms),
            rejection_cap: Duration::from_millis(login.rejection_backoff_cap_ms),
            unmatched_delay: Duration::from_millis(login.unmatched_code_delay_ms),
            code_timeout: Duration::from_secs(mailbox.code_timeout_secs),
            request_timeout: portal.request_timeout(),
        }
    }

    /// Wait after the `attempt`-th captcha rejection: linear in the attempt, capped.
    pub fn rejection_backoff(&self, attempt: u32) -> Duration {
        self.rejection_step
            .checked_mul(attempt)
            .map_or(self.rejection_cap, |delay| delay.min(self.rejection_cap))
    }
}

/// JSON body of the login endpoint
#[derive(Debug, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub msg: String,
    #[serde(default, deserialize_with = "lenient_object")]
    pub data: LoginData,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginData {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub message: String,
    #[serde(default, deserialize_with = "lenient_object")]
    pub description: LoginDescription,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoginDescription {
    #[serde(default, rename = "codeSent")]
    pub code_sent: Option<bool>,
}

/// Objects that arrive as anything else (null, strings) become their default.
fn lenient_object<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(object @ Value::Object(_)) => serde_json::from_value(object).unwrap_or_default(),
        _ => T::default(),
    })
}

impl LoginResponse {
    pub fn err_code(&self) -> Option<i64> {
        match self.err.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_captcha_rejected(&self) -> bool {
        self.err_code() == Some(-2) || self.msg.to_lowercase().contains("recaptcha")
    }

    pub fn is_mfa_required(&self) -> bool {
        self.data.code.as_deref() == Some("REQUIRED_MFA_CODE")
            || self.data.description.code_sent == Some(true)
    }

    pub fn is_unmatched_code(&self) -> bool {
        let message = self.data.message.to_lowercase();
        self.data.code.as_deref() == Some("UNMATCHED_VERIFICATION_CODE")
            || (message.contains("unmatched")
                && message.contains("verification")
                && message.contains("code"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Credentials,
    Verification,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    CaptchaRejected,
    MfaRequired,
    UnmatchedCode,
    Authenticated(String),
    Unexpected,
}

/// Maps a login response onto the next transition of the state machine.
pub fn classify(step: LoginStep, response: &LoginResponse, sid: Option<String>) -> LoginOutcome {
    if response.is_captcha_rejected() {
        return LoginOutcome::CaptchaRejected;
    }

    match step {
        LoginStep::Credentials => {
            if let Some(sid) = sid
                && response.err_code() == Some(0)
                && response.data.code.is_none()
            {
                return LoginOutcome::Authenticated(sid);
            }
            if response.is_mfa_required() {
                return LoginOutcome::MfaRequired;
            }
        }
        LoginStep::Verification => {
            if response.is_unmatched_code() {
                return LoginOutcome::UnmatchedCode;
            }
            if let Some(sid) = sid {
                return LoginOutcome::Authenticated(sid);
            }
        }
    }

    LoginOutcome::Unexpected
}

/// Value of cookie `name` from the response's `Set-Cookie` headers.
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|line| line.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Per-call state; dropped when `login` returns.
#[derive(Debug, Default)]
struct LoginAttempt {
    captcha_attempts: u32,
    mfa_attempts: u32,
    mfa_code: Option<String>,
    mfa_requested_at: Option<DateTime<Utc>>,
}

/// Performs the portal login protocol
pub struct SessionClient {
    login_url: String,
    origin: String,
    credentials: PortalCredentials,
    captcha: Arc<dyn CaptchaSolver>,
    codes: Arc<dyn VerificationCodeSource>,
    solve_backoff: SolveBackoff,
    policy: LoginPolicy,
    shutdown: ShutdownSignal,
}

impl SessionClient {
    pub fn new(
        portal_url: &str,
        credentials: PortalCredentials,
        captcha: Arc<dyn CaptchaSolver>,
        codes: Arc<dyn VerificationCodeSource>,
        solve_backoff: SolveBackoff,
        policy: LoginPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        let origin = portal_url.trim_end_matches('/').to_string();
        Self {
            login_url: format!("{origin}/login_submit"),
            origin,
            credentials,
            captcha,
            codes,
            solve_backoff,
            policy,
            shutdown,
        }
    }

    /// Runs the whole login and returns the session credential.
    #[instrument(skip(self))]
    pub async fn login(&self) -> Result<SessionCredential, LoginError> {
        if !self.credentials.is_complete() {
            return Err(LoginError::MissingCredentials);
        }

        // one cookie jar per login so step 2 carries the cookies of step 1
        let client = Client::builder()
            .cookie_store(true)
            .timeout(self.policy.request_timeout)
            .build()?;

        let mut attempt = LoginAttempt::default();

        loop {
            attempt.captcha_attempts += 1;
            let token = self.captcha_token().await?;
            let (response, sid) = self.submit(&client, &token, "").await?;

            match classify(LoginStep::Credentials, &response, sid) {
                LoginOutcome::CaptchaRejected => {
                    let delay = self.policy.rejection_backoff(attempt.captcha_attempts);
                    warn!(
                        "step 1 captcha rejected (attempt {}); retrying in {}ms",
                        attempt.captcha_attempts,
                        delay.as_millis()
                    );
                    self.pause(delay).await?;
                }
                LoginOutcome::Authenticated(sid) => {
                    info!("logged in without verification code");
                    return Ok(SessionCredential::new(sid));
                }
                LoginOutcome::MfaRequired => {
                    debug!("verification code required");
                    break;
                }
                _ => return Err(unexpected(LoginStep::Credentials, &response)),
            }
        }

        attempt.mfa_requested_at = Some(Utc::now());

        loop {
            attempt.mfa_attempts += 1;

            let code = match attempt.mfa_code.clone() {
                Some(code) => code,
                None => {
                    let since = attempt.mfa_requested_at.unwrap_or_else(Utc::now);
                    let code = self.codes.fetch_code(since, self.policy.code_timeout).await?;
                    info!("verification code fetched ({})", mask_secret(&code));
                    attempt.mfa_code = Some(code.clone());
                    code
                }
            };

            let token = self.captcha_token().await?;
            let (response, sid) = self.submit(&client, &token, &code).await?;

            match classify(LoginStep::Verification, &response, sid) {
                LoginOutcome::CaptchaRejected => {
                    let delay = self.policy.rejection_backoff(attempt.mfa_attempts);
                    warn!(
                        "step 2 captcha rejected (attempt {}); retrying in {}ms",
                        attempt.mfa_attempts,
                        delay.as_millis()
                    );
                    self.pause(delay).await?;
                }
                LoginOutcome::UnmatchedCode => {
                    warn!(
                        "verification code unmatched (attempt {}); fetching a new one",
                        attempt.mfa_attempts
                    );
                    attempt.mfa_code = None;
                    self.pause(self.policy.unmatched_delay).await?;
                    attempt.mfa_requested_at = Some(Utc::now());
                }
                LoginOutcome::Authenticated(sid) => {
                    info!("logged in with verification code");
                    return Ok(SessionCredential::new(sid));
                }
                _ => return Err(unexpected(LoginStep::Verification, &response)),
            }
        }
    }

    async fn captcha_token(&self) -> Result<String, LoginError> {
        solve_forever(self.captcha.as_ref(), self.solve_backoff, &self.shutdown)
            .await
            .ok_or(LoginError::Cancelled)
    }

    async fn pause(&self, delay: Duration) -> Result<(), LoginError> {
        if self.shutdown.sleep(delay).await {
            Ok(())
        } else {
            Err(LoginError::Cancelled)
        }
    }

    async fn submit(
        &self,
        client: &Client,
        captcha_token: &str,
        mfa_code: &str,
    ) -> Result<(LoginResponse, Option<String>), LoginError> {
        let form = [
            ("id", self.credentials.login_id.as_str()),
            ("pwd", self.credentials.password.as_str()),
            ("recaptcha_res", captcha_token),
            ("mfacode", mfa_code),
            ("os", "Windows"),
            ("os_ver", "10"),
            ("method_type", ""),
        ];

        let response = client
            .post(&self.login_url)
            .header("Accept", "*/*")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Origin", &self.origin)
            .header("Referer", format!("{}/login", self.origin))
            .header("User-Agent", USER_AGENT)
            .form(&form)
            .send()
            .await?;

        decode_login_response(response).await
    }
}

async fn decode_login_response(
    response: Response,
) -> Result<(LoginResponse, Option<String>), LoginError> {
    // the portal answers errors with 200 and a JSON body, so the status is not checked
    let status = response.status();
    let sid = session_cookie(response.headers(), SESSION_COOKIE);
    let body = response.text().await?;

    let parsed = serde_json::from_str::<LoginResponse>(&body).map_err(|_| {
        LoginError::Protocol(format!(
            "non-JSON response: {} {}",
            status.as_u16(),
            excerpt(&body, 500)
        ))
    })?;

    Ok((parsed, sid))
}

fn unexpected(step: LoginStep, response: &LoginResponse) -> LoginError {
    LoginError::Protocol(format!(
        "{step:?} step: err={:?} msg={:?} data.code={:?}",
        response.err_code(),
        excerpt(&response.msg, 200),
        response.data.code
    ))
}

#[async_trait]
impl SessionProvider for SessionClient {
    async fn acquire(&self) -> Result<SessionCredential, LoginError> {
        self.login().await
    }
}
