//! Alert delivery through the Telegram bot API

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::EntitySnapshot;
use crate::alerts::AlertKind;
use crate::config::TelegramConfig;
use crate::error::excerpt;
use crate::util::format_amount;

/// Delivers a rendered message to one recipient
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: i64, text: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
}

// the endpoint embeds the bot token
impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("endpoint", &crate::util::mask_secret(&self.endpoint))
            .finish_non_exhaustive()
    }
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build Telegram HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_url.trim_end_matches('/'),
                token
            ),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip(self, text))]
    async fn send(&self, recipient: i64, text: &str) -> Result<()> {
        let payload = SendMessage {
            chat_id: recipient,
            text,
            parse_mode: "HTML",
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .context("failed to reach Telegram")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read Telegram response")?;

        if !status.is_success() {
            bail!("Telegram returned HTTP {}: {}", status, excerpt(&body, 200));
        }

        let parsed: ApiResponse =
            serde_json::from_str(&body).context("failed to decode Telegram response")?;
        if !parsed.ok {
            bail!(
                "Telegram rejected the message: {}",
                parsed.description.unwrap_or_default()
            );
        }

        debug!("message delivered to {recipient}");
        Ok(())
    }
}

/// Text of one alert for one entity, rendered as Telegram HTML
#[derive(Debug, Clone)]
pub struct AlertMessage<'a> {
    kind: AlertKind,
    entity: &'a EntitySnapshot,
}

impl<'a> AlertMessage<'a> {
    pub fn new(kind: AlertKind, entity: &'a EntitySnapshot) -> Self {
        Self { kind, entity }
    }

    fn header(&self) -> &'static str {
        match self.kind {
            AlertKind::LossLimit => "🚨 <b>LOSS LIMIT WARNING</b>",
            AlertKind::WinLimit => "🎯 <b>WIN LIMIT WARNING</b>",
            AlertKind::PnlFloor => "📉 <b>SIGNIFICANT LOSS ALERT</b>",
        }
    }

    pub fn render(&self) -> String {
        let e = self.entity;
        let mut text = format!(
            "{}\n\n🏢 <b>Club:</b> {}\n🆔 <b>Club ID:</b> {}\n👤 <b>Owner:</b> {}\n\n",
            self.header(),
            escape_html(&e.name),
            escape_html(&e.public_id),
            escape_html(&e.owner),
        );

        let body = match self.kind {
            AlertKind::LossLimit => format!(
                "💰 <b>Current Loss:</b> ${}\n📊 <b>Loss Limit:</b> ${}\n📈 <b>Usage:</b> {:.1}%",
                format_amount(e.ring_pnl.abs()),
                format_amount(e.loss_limit),
                usage_percent(e.ring_pnl.abs(), e.loss_limit),
            ),
            AlertKind::WinLimit => format!(
                "💰 <b>Current Win:</b> ${}\n📊 <b>Win Limit:</b> ${}\n📈 <b>Usage:</b> {:.1}%",
                format_amount(e.ring_pnl),
                format_amount(e.win_limit),
                usage_percent(e.ring_pnl, e.win_limit),
            ),
            AlertKind::PnlFloor => format!(
                "💰 <b>Total P&amp;L:</b> ${}\n🎰 <b>Ring Game P&amp;L:</b> ${}\n🏆 <b>Tournament P&amp;L:</b> ${}",
                format_amount(e.total_pnl()),
                format_amount(e.ring_pnl),
                format_amount(e.tournament_pnl),
            ),
        };

        text.push_str(&body);
        text
    }
}

fn usage_percent(amount: f64, limit: f64) -> f64 {
    if limit > 0.0 { amount / limit * 100.0 } else { 0.0 }
}

/// Escapes the characters Telegram's HTML mode treats as markup.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
