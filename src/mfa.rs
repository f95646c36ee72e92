//! Verification code retrieval for the portal's email second factor

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::config::MailboxConfig;
use crate::error::LoginError;
use crate::mailbox::Mailbox;

static STRONG_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<strong\b[^>]*>(.*?)</strong>").expect("static regex is valid")
});
static SIX_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{6})\b").expect("static regex is valid"));
static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[^>]+>").expect("static regex is valid"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex is valid"));
static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|\d+);").expect("static regex is valid"));

/// Anything that can produce the one-time code sent after `since`.
#[async_trait]
pub trait VerificationCodeSource: Send + Sync {
    async fn fetch_code(
        &self,
        since: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<String, LoginError>;
}

/// Polls a mailbox for the portal's verification email
pub struct CodeRetriever<M> {
    mailbox: M,
    query: String,
    poll_interval: Duration,
    grace: chrono::Duration,
}

impl<M: Mailbox> CodeRetriever<M> {
    pub fn new(mailbox: M, config: &MailboxConfig) -> Self {
        Self {
            mailbox,
            query: config.query.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            grace: chrono::Duration::seconds(config.grace_secs as i64),
        }
    }

    /// One pass over the matching messages.
    async fn scan(&self, floor_ms: i64) -> anyhow::Result<Option<String>> {
        let ids = self.mailbox.list_message_ids(&self.query).await?;
        trace!("{} candidate message(s)", ids.len());

        for id in ids {
            let message = match self.mailbox.get_message(&id).await {
                Ok(message) => message,
                Err(e) => {
                    warn!("failed to fetch message {id}: {:#}", e);
                    continue;
                }
            };
            if message.internal_date_ms <= floor_ms {
                trace!("message {id} predates this login attempt, skipping");
                continue;
            }

            if let Some(code) = extract_code(&message.full_text()) {
                return Ok(Some(code));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl<M: Mailbox> VerificationCodeSource for CodeRetriever<M> {
    #[instrument(skip(self))]
    async fn fetch_code(
        &self,
        since: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<String, LoginError> {
        let deadline = Instant::now() + timeout;
        let floor_ms = (since - self.grace).timestamp_millis();

        while Instant::now() < deadline {
            match self.scan(floor_ms).await {
                Ok(Some(code)) => {
                    debug!("verification code received");
                    return Ok(code);
                }
                Ok(None) => {}
                Err(e) => warn!("mailbox poll failed: {:#}", e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }

        Err(LoginError::CodeTimeout)
    }
}

/// Finds the 6-digit code in an email body.
///
/// Preference order: the second `<strong>` run, any `<strong>` run, then the
/// whole text with tags stripped.
pub fn extract_code(text: &str) -> Option<String> {
    let strongs: Vec<String> = STRONG_RUN
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| clean_text(&decode_entities(m.as_str())))
        .collect();

    if let Some(second) = strongs.get(1)
        && let Some(code) = six_digits(second)
    {
        return Some(code);
    }

    if let Some(code) = strongs.iter().find_map(|s| six_digits(s)) {
        return Some(code);
    }

    let plain = TAG.replace_all(&decode_entities(text), "").into_owned();
    six_digits(&plain)
}

fn six_digits(text: &str) -> Option<String> {
    SIX_DIGITS
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn clean_text(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Decodes the HTML entities verification emails actually use.
fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");

    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });

    // `&amp;` last so "&amp;lt;" stays "&lt;"
    numeric.replace("&amp;", "&")
}
