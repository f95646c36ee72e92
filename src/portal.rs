//! Club limit listing and detail endpoints of the union portal

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use crate::error::{PortalError, excerpt};
use crate::login::SESSION_COOKIE;
use crate::session::SessionCredential;
use crate::util::{lenient_amount, lenient_text};
use crate::{EntityDetail, EntitySnapshot};

/// Upper bound on followed pages, in case `tot_pages` is garbage.
const MAX_PAGES: u32 = 500;

/// Produces the current snapshot of every monitored entity
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_all(
        &self,
        credential: &SessionCredential,
    ) -> Result<Vec<EntitySnapshot>, PortalError>;
}

/// One row of `DATA` in the listing response.
#[derive(Debug, Deserialize)]
struct LimitRow {
    #[serde(deserialize_with = "numeric_id")]
    cno: i64,
    #[serde(default, deserialize_with = "lenient_text")]
    f1: String,
    #[serde(default, deserialize_with = "lenient_text")]
    f2: String,
    #[serde(default, deserialize_with = "lenient_text")]
    f3: String,
    #[serde(default, deserialize_with = "lenient_amount")]
    f4: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    f5: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    f6: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    f7: f64,
}

impl From<LimitRow> for EntitySnapshot {
    fn from(row: LimitRow) -> Self {
        EntitySnapshot {
            id: row.cno,
            public_id: row.f1,
            name: row.f2,
            owner: row.f3,
            ring_pnl: row.f4,
            tournament_pnl: row.f5,
            loss_limit: row.f6,
            win_limit: row.f7,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LimitInfo {
    #[serde(default, deserialize_with = "lenient_text")]
    nm: String,
    #[serde(default, deserialize_with = "lenient_text")]
    id: String,
    #[serde(default, deserialize_with = "lenient_text")]
    master: String,
    #[serde(default, deserialize_with = "lenient_amount")]
    win: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    loss: f64,
    #[serde(default)]
    include: Option<Value>,
}

impl From<LimitInfo> for EntityDetail {
    fn from(info: LimitInfo) -> Self {
        EntityDetail {
            public_id: info.id,
            name: info.nm,
            owner: info.master,
            win_limit: info.win,
            loss_limit: info.loss,
            include: info.include.as_ref().and_then(include_flag),
        }
    }
}

/// `cno` arrives as a number or a numeric string.
fn numeric_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom("cno out of range")),
        Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("invalid cno: {other}"))),
    }
}

fn include_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "1" | "true" => Some(true),
            "n" | "no" | "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Page count from the `PAGE` object, 1 when missing.
fn total_pages(body: &Value) -> u32 {
    let raw = &body["PAGE"]["tot_pages"];
    let pages = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    pages
        .map(|p| p.clamp(1, MAX_PAGES as u64) as u32)
        .unwrap_or(1)
}

/// Converts one listing page into snapshots, dropping rows that do not parse.
fn parse_rows(body: &Value) -> Result<Vec<EntitySnapshot>, PortalError> {
    let rows = match body.get("DATA") {
        Some(Value::Array(rows)) => rows,
        Some(Value::Null) => return Ok(vec![]),
        Some(other) => {
            return Err(PortalError::Shape(format!(
                "DATA is not an array: {}",
                excerpt(&other.to_string(), 120)
            )));
        }
        None => return Err(PortalError::Shape("response has no DATA".to_string())),
    };

    let mut snapshots = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<LimitRow>(row.clone()) {
            Ok(row) => snapshots.push(row.into()),
            Err(e) => warn!(
                "skipping malformed club row ({e}): {}",
                excerpt(&row.to_string(), 120)
            ),
        }
    }

    Ok(snapshots)
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start();
    head.starts_with('<')
}

/// HTTP client for the portal's `/clublimit` endpoint
#[derive(Debug, Clone)]
pub struct PortalClient {
    client: Client,
    origin: String,
    endpoint: String,
}

impl PortalClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build portal HTTP client")?;

        let origin = base_url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            endpoint: format!("{origin}/clublimit"),
            origin,
        })
    }

    async fn post_form(
        &self,
        credential: &SessionCredential,
        form: &[(&str, &str)],
    ) -> Result<Value, PortalError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Accept", "*/*")
            .header("Origin", &self.origin)
            .header("Referer", &self.endpoint)
            .header(
                "Cookie",
                format!("{SESSION_COOKIE}={}", credential.token()),
            )
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PortalError::Unauthorized);
        }
        if !status.is_success() {
            return Err(PortalError::Status(status.as_u16()));
        }

        let text = response.text().await?;
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Ok(value),
            // an expired session gets the login page instead of JSON
            Err(_) if looks_like_html(&text) => Err(PortalError::Unauthorized),
            Err(e) => Err(PortalError::Shape(format!(
                "{e}: {}",
                excerpt(&text, 200)
            ))),
        }
    }

    async fn fetch_page(
        &self,
        credential: &SessionCredential,
        page: u32,
    ) -> Result<Value, PortalError> {
        let page = page.to_string();
        trace!("fetching club limit page {page}");
        self.post_form(
            credential,
            &[
                ("iam", "list"),
                ("clubnm", ""),
                ("cur_page", &page),
                ("column", "ring"),
                ("asc", "2"),
            ],
        )
        .await
    }

    /// Weekly limit record of one club (`entity_id` is the backend `cno`).
    #[instrument(skip(self, credential))]
    pub async fn fetch_detail(
        &self,
        credential: &SessionCredential,
        entity_id: i64,
    ) -> Result<EntityDetail, PortalError> {
        let id = entity_id.to_string();
        let body = self
            .post_form(credential, &[("iam", "view"), ("cno", &id)])
            .await?;

        let info = body
            .get("INFO")
            .filter(|info| info.is_object())
            .cloned()
            .ok_or_else(|| PortalError::Shape("response has no INFO".to_string()))?;

        serde_json::from_value::<LimitInfo>(info)
            .map(EntityDetail::from)
            .map_err(|e| PortalError::Shape(e.to_string()))
    }
}

#[async_trait]
impl SnapshotSource for PortalClient {
    #[instrument(skip_all)]
    async fn fetch_all(
        &self,
        credential: &SessionCredential,
    ) -> Result<Vec<EntitySnapshot>, PortalError> {
        let first = self.fetch_page(credential, 1).await?;
        let pages = total_pages(&first);
        let mut snapshots = parse_rows(&first)?;

        for page in 2..=pages {
            let body = self.fetch_page(credential, page).await?;
            snapshots.extend(parse_rows(&body)?);
        }

        debug!("fetched {} club(s) over {pages} page(s)", snapshots.len());
        Ok(snapshots)
    }
}
