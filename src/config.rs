use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::trace;

use crate::error::ConfigError;
use crate::util;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub portal: PortalConfig,

    #[serde(default)]
    pub captcha: CaptchaConfig,

    #[serde(default)]
    pub mailbox: MailboxConfig,

    #[serde(default)]
    pub login: LoginConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Who gets alerted for which club
    #[serde(default)]
    pub roles: Vec<RoleEntry>,
}

/// Target portal endpoints
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_portal_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: default_portal_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl PortalConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_portal_url() -> String {
    String::from("https://union.clubgg.com")
}

fn default_request_timeout() -> u64 {
    30
}

/// Captcha solving service
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CaptchaConfig {
    #[serde(default = "default_captcha_url")]
    pub api_url: String,

    #[serde(default = "default_site_key")]
    pub site_key: String,

    /// Page the token is bound to; defaults to the portal's start page
    pub page_url: Option<String>,

    #[serde(default = "default_page_action")]
    pub page_action: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_polls")]
    pub max_polls: u32,

    #[serde(default = "default_captcha_backoff_start")]
    pub backoff_start_ms: u64,

    #[serde(default = "default_captcha_backoff_cap")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_captcha_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            api_url: default_captcha_url(),
            site_key: default_site_key(),
            page_url: None,
            page_action: default_page_action(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            backoff_start_ms: default_captcha_backoff_start(),
            backoff_cap_ms: default_captcha_backoff_cap(),
            request_timeout_secs: default_captcha_timeout(),
        }
    }
}

fn default_captcha_url() -> String {
    String::from("https://api.capsolver.com")
}

fn default_site_key() -> String {
    String::from("6LfGLOwpAAAAAB_yx0Fp06dwDxYIsQ3WD5dSXKbQ")
}

fn default_page_action() -> String {
    String::from("submit")
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_max_polls() -> u32 {
    30
}

fn default_captcha_backoff_start() -> u64 {
    1_000
}

fn default_captcha_backoff_cap() -> u64 {
    30_000
}

fn default_captcha_timeout() -> u64 {
    20
}

/// Mailbox that receives the verification codes
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_gmail_url")]
    pub api_url: String,

    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default = "default_mail_query")]
    pub query: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_code_timeout")]
    pub code_timeout_secs: u64,

    /// Clock skew tolerance when comparing message dates to the request time
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            api_url: default_gmail_url(),
            token_url: default_token_url(),
            query: default_mail_query(),
            poll_interval_ms: default_poll_interval_ms(),
            code_timeout_secs: default_code_timeout(),
            grace_secs: default_grace(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_gmail_url() -> String {
    String::from("https://gmail.googleapis.com/gmail/v1")
}

fn default_token_url() -> String {
    String::from("https://oauth2.googleapis.com/token")
}

fn default_mail_query() -> String {
    String::from(
        r#"from:support@clubgg.com subject:"ClubGG Email Verification Code" newer_than:1d"#,
    )
}

fn default_code_timeout() -> u64 {
    120
}

fn default_grace() -> u64 {
    10
}

/// Retry timings of the login state machine
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_rejection_step")]
    pub rejection_backoff_step_ms: u64,

    #[serde(default = "default_rejection_cap")]
    pub rejection_backoff_cap_ms: u64,

    #[serde(default = "default_unmatched_delay")]
    pub unmatched_code_delay_ms: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            rejection_backoff_step_ms: default_rejection_step(),
            rejection_backoff_cap_ms: default_rejection_cap(),
            unmatched_code_delay_ms: default_unmatched_delay(),
        }
    }
}

fn default_rejection_step() -> u64 {
    100
}

fn default_rejection_cap() -> u64 {
    5_000
}

fn default_unmatched_delay() -> u64 {
    2_000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// How long a credential is trusted without renewal
    #[serde(default = "default_validity")]
    pub validity_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            validity_secs: default_validity(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    50 * 60
}

fn default_validity() -> u64 {
    60 * 60
}

/// Alert thresholds and loop timing
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_warning_percent")]
    pub loss_warning_percent: f64,

    #[serde(default = "default_warning_percent")]
    pub win_warning_percent: f64,

    #[serde(default = "default_pnl_floor")]
    pub pnl_floor: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_check_interval(),
            cooldown_secs: default_cooldown(),
            loss_warning_percent: default_warning_percent(),
            win_warning_percent: default_warning_percent(),
            pnl_floor: default_pnl_floor(),
        }
    }
}

fn default_check_interval() -> u64 {
    60
}

fn default_cooldown() -> u64 {
    5 * 60
}

fn default_warning_percent() -> f64 {
    90.0
}

fn default_pnl_floor() -> f64 {
    -1000.0
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_url")]
    pub api_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_url: default_telegram_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_telegram_url() -> String {
    String::from("https://api.telegram.org")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    UnionHead,
    RegionHead,
    ClubOwner,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RoleEntry {
    pub user_id: i64,
    pub role: Role,
    /// Backend club ids this entry covers (ignored for union heads)
    #[serde(default)]
    pub clubs: Vec<i64>,
}

/// Secrets read from the environment
#[derive(Clone, Default)]
pub struct Secrets {
    pub login_id: String,
    pub login_password: String,
    pub captcha_key: Option<String>,
    pub gmail_client_id: Option<String>,
    pub gmail_client_secret: Option<String>,
    pub gmail_refresh_token: Option<String>,
    pub telegram_token: Option<String>,
}

/// Secrets the login and alert paths cannot run without
#[derive(Clone)]
pub struct ServiceSecrets {
    pub login_id: String,
    pub login_password: String,
    pub captcha_key: String,
    pub gmail: GmailSecrets,
    pub telegram_token: String,
}

#[derive(Clone)]
pub struct GmailSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self {
            login_id: util::get_login_id(),
            login_password: util::get_login_password(),
            captcha_key: util::get_captcha_key(),
            gmail_client_id: util::get_gmail_client_id(),
            gmail_client_secret: util::get_gmail_client_secret(),
            gmail_refresh_token: util::get_gmail_refresh_token(),
            telegram_token: util::get_telegram_token(),
        }
    }

    /// Checks that the portal login and every external service have their secret.
    pub fn require_services(&self) -> Result<ServiceSecrets, ConfigError> {
        fn require(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
            value.clone().ok_or(ConfigError::MissingSecret(name))
        }

        fn require_text(value: &str, name: &'static str) -> Result<String, ConfigError> {
            match value.trim() {
                "" => Err(ConfigError::MissingSecret(name)),
                _ => Ok(value.to_string()),
            }
        }

        Ok(ServiceSecrets {
            login_id: require_text(&self.login_id, "UNION_LOGIN_ID")?,
            login_password: require_text(&self.login_password, "UNION_LOGIN_PWD")?,
            captcha_key: require(&self.captcha_key, "CAPSOLVER_API_KEY")?,
            gmail: GmailSecrets {
                client_id: require(&self.gmail_client_id, "GMAIL_CLIENT_ID")?,
                client_secret: require(&self.gmail_client_secret, "GMAIL_CLIENT_SECRET")?,
                refresh_token: require(&self.gmail_refresh_token, "GMAIL_REFRESH_TOKEN")?,
            },
            telegram_token: require(&self.telegram_token, "TELEGRAM_BOT_TOKEN")?,
        })
    }
}

fn masked(value: &Option<String>) -> Option<String> {
    value.as_deref().map(util::mask_secret)
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("login_id", &self.login_id)
            .field("login_password", &util::mask_secret(&self.login_password))
            .field("captcha_key", &masked(&self.captcha_key))
            .field("gmail_client_id", &self.gmail_client_id)
            .field("gmail_client_secret", &masked(&self.gmail_client_secret))
            .field("gmail_refresh_token", &masked(&self.gmail_refresh_token))
            .field("telegram_token", &masked(&self.telegram_token))
            .finish()
    }
}

impl fmt::Debug for ServiceSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSecrets")
            .field("login_id", &self.login_id)
            .field("login_password", &util::mask_secret(&self.login_password))
            .field("captcha_key", &util::mask_secret(&self.captcha_key))
            .field("gmail", &self.gmail)
            .field("telegram_token", &util::mask_secret(&self.telegram_token))
            .finish()
    }
}

impl fmt::Debug for GmailSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmailSecrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &util::mask_secret(&self.client_secret))
            .field("refresh_token", &util::mask_secret(&self.refresh_token))
            .finish()
    }
}

impl Config {
    /// Rejects values the background loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.refresh_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.alerts.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "alerts.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config =
        serde_json::from_str(&file_content).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
