//! Read access to the mailbox that receives verification emails

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{instrument, trace};

use crate::config::{GmailSecrets, MailboxConfig};

/// A fetched message, reduced to what code extraction needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailMessage {
    pub id: String,
    /// Server-side receive time in epoch milliseconds
    pub internal_date_ms: i64,
    pub subject: String,
    /// Decoded `text/plain` and `text/html` bodies, in document order
    pub bodies: Vec<String>,
    pub snippet: String,
}

impl MailMessage {
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.internal_date_ms).single()
    }

    /// Subject, bodies and snippet joined into one searchable text.
    pub fn full_text(&self) -> String {
        std::iter::once(self.subject.as_str())
            .chain(self.bodies.iter().map(String::as_str))
            .chain(std::iter::once(self.snippet.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Ids of messages matching a search query, newest first.
    async fn list_message_ids(&self, query: &str) -> Result<Vec<String>>;

    async fn get_message(&self, id: &str) -> Result<MailMessage>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    payload: Option<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    headers: Vec<RawHeader>,
    #[serde(default)]
    body: Option<RawBody>,
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Gmail REST client authenticated through an OAuth2 refresh token
pub struct GmailMailbox {
    client: Client,
    api_url: String,
    token_url: String,
    secrets: GmailSecrets,
    token: Mutex<Option<AccessToken>>,
}

// neither the OAuth secrets nor the access token are printed
impl std::fmt::Debug for GmailMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailMailbox")
            .field("api_url", &self.api_url)
            .field("token_url", &self.token_url)
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

impl GmailMailbox {
    pub fn new(config: &MailboxConfig, secrets: GmailSecrets) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build mailbox HTTP client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            secrets,
            token: Mutex::new(None),
        })
    }

    /// Returns a cached access token, exchanging the refresh token when it is
    /// missing or about to expire.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Utc::now()
        {
            return Ok(token.value.clone());
        }

        trace!("exchanging refresh token for a new access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.secrets.client_id.as_str()),
                ("client_secret", self.secrets.client_secret.as_str()),
                ("refresh_token", self.secrets.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("failed to request access token")?;

        if !response.status().is_success() {
            anyhow::bail!("token endpoint returned HTTP {}", response.status());
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("failed to decode token response")?;

        // renew a minute early so a token never expires mid-request
        let lifetime = chrono::Duration::seconds((token.expires_in - 60).max(0));
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at: Utc::now() + lifetime,
        });

        Ok(token.access_token)
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    #[instrument(skip(self))]
    async fn list_message_ids(&self, query: &str) -> Result<Vec<String>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/users/me/messages", self.api_url))
            .bearer_auth(token)
            .query(&[("q", query), ("maxResults", "10")])
            .send()
            .await
            .context("failed to list messages")?;

        if !response.status().is_success() {
            anyhow::bail!("message listing returned HTTP {}", response.status());
        }

        let list: ListResponse = response
            .json()
            .await
            .context("failed to decode message listing")?;

        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    #[instrument(skip(self))]
    async fn get_message(&self, id: &str) -> Result<MailMessage> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!("{}/users/me/messages/{id}", self.api_url))
            .bearer_auth(token)
            .query(&[("format", "full")])
            .send()
            .await
            .context("failed to fetch message")?;

        if !response.status().is_success() {
            anyhow::bail!("message fetch returned HTTP {}", response.status());
        }

        let raw: RawMessage = response
            .json()
            .await
            .context("failed to decode message")?;

        Ok(convert_message(raw))
    }
}

fn convert_message(raw: RawMessage) -> MailMessage {
    let payload = raw.payload.unwrap_or_default();

    let subject = payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("subject"))
        .map(|h| h.value.clone())
        .unwrap_or_default();

    let mut bodies = Vec::new();
    collect_bodies(&payload, &mut bodies);

    MailMessage {
        id: raw.id,
        internal_date_ms: raw
            .internal_date
            .and_then(|d| d.parse().ok())
            .unwrap_or_default(),
        subject,
        bodies,
        snippet: raw.snippet.unwrap_or_default(),
    }
}

fn collect_bodies(part: &RawPart, out: &mut Vec<String>) {
    let is_text = matches!(part.mime_type.as_deref(), Some("text/plain" | "text/html"));
    if is_text
        && let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref())
        && let Some(text) = decode_base64url(data)
    {
        out.push(text);
    }

    for child in &part.parts {
        collect_bodies(child, out);
    }
}

/// Decodes base64url with or without padding; invalid UTF-8 is replaced.
pub fn decode_base64url(data: &str) -> Option<String> {
    let trimmed = data.trim();
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(trimmed))
        .ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}
