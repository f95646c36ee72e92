//! reCAPTCHA token acquisition through a third-party solving service

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, trace, warn};

use crate::config::CaptchaConfig;
use crate::shutdown::ShutdownSignal;

/// Source of captcha proof tokens.
///
/// `solve` returning `None` is a failed attempt, not an error; callers retry.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self) -> Option<String>;
}

/// Exponential backoff between failed solve attempts
#[derive(Debug, Clone, Copy)]
pub struct SolveBackoff {
    pub start: Duration,
    pub cap: Duration,
}

impl SolveBackoff {
    /// Delay after the `attempt`-th failure (1-based): start, 2×start, 4×start, … up to cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.start
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl From<&CaptchaConfig> for SolveBackoff {
    fn from(config: &CaptchaConfig) -> Self {
        Self {
            start: Duration::from_millis(config.backoff_start_ms),
            cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }
}

/// Calls `solver` until it yields a token.
///
/// There is no attempt ceiling; the only way out without a token is `shutdown`,
/// which is checked between attempts and interrupts the backoff sleep.
#[instrument(skip_all)]
pub async fn solve_forever(
    solver: &dyn CaptchaSolver,
    backoff: SolveBackoff,
    shutdown: &ShutdownSignal,
) -> Option<String> {
    let mut attempt = 0u32;
    loop {
        if shutdown.is_triggered() {
            debug!("shutdown requested, giving up on captcha");
            return None;
        }

        attempt = attempt.saturating_add(1);
        let solved = tokio::select! {
            token = solver.solve() => token,
            _ = shutdown.triggered() => return None,
        };
        if let Some(token) = solved {
            trace!("captcha solved after {attempt} attempt(s)");
            return Some(token);
        }

        let delay = backoff.delay(attempt);
        warn!(
            "captcha attempt {attempt} failed; retrying in {}ms",
            delay.as_millis()
        );
        if !shutdown.sleep(delay).await {
            return None;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    task_id: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    status: Option<String>,
    solution: Option<Solution>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    g_recaptcha_response: Option<String>,
}

/// CapSolver client for reCAPTCHA v3 Enterprise tokens
#[derive(Clone)]
pub struct CapSolver {
    client: Client,
    api_url: String,
    api_key: String,
    site_key: String,
    page_url: String,
    page_action: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl std::fmt::Debug for CapSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapSolver")
            .field("api_url", &self.api_url)
            .field("api_key", &crate::util::mask_secret(&self.api_key))
            .field("site_key", &self.site_key)
            .field("page_url", &self.page_url)
            .finish_non_exhaustive()
    }
}

impl CapSolver {
    pub fn new(config: &CaptchaConfig, api_key: String, portal_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build captcha HTTP client")?;

        let page_url = config
            .page_url
            .clone()
            .unwrap_or_else(|| format!("{}/", portal_url.trim_end_matches('/')));

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            site_key: config.site_key.clone(),
            page_url,
            page_action: config.page_action.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
        })
    }

    async fn create_task(&self) -> Result<String> {
        let payload = json!({
            "clientKey": self.api_key,
            "task": {
                "type": "ReCaptchaV3EnterpriseTaskProxyLess",
                "websiteURL": self.page_url,
                "websiteKey": self.site_key,
                "pageAction": self.page_action,
            }
        });

        let response: CreateTaskResponse = self
            .client
            .post(format!("{}/createTask", self.api_url))
            .json(&payload)
            .send()
            .await
            .context("failed to submit captcha task")?
            .json()
            .await
            .context("failed to decode createTask response")?;

        match response.task_id {
            Some(task_id) => Ok(task_id),
            None => anyhow::bail!(
                "captcha service returned no task id: {}",
                response.error_description.unwrap_or_default()
            ),
        }
    }

    async fn poll_result(&self, task_id: &str) -> Result<Option<String>> {
        let response: TaskResultResponse = self
            .client
            .post(format!("{}/getTaskResult", self.api_url))
            .json(&json!({ "clientKey": self.api_key, "taskId": task_id }))
            .send()
            .await
            .context("failed to poll captcha task")?
            .json()
            .await
            .context("failed to decode getTaskResult response")?;

        match response.status.as_deref() {
            Some("ready") => Ok(response.solution.and_then(|s| s.g_recaptcha_response)),
            Some("failed") => anyhow::bail!(
                "captcha task failed: {}",
                response.error_description.unwrap_or_default()
            ),
            _ => Ok(None),
        }
    }

    async fn try_solve(&self) -> Result<Option<String>> {
        let task_id = self.create_task().await?;
        trace!("created captcha task {task_id}");

        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(token) = self.poll_result(&task_id).await? {
                return Ok(Some(token));
            }
        }

        debug!(
            "captcha task {task_id} not ready after {} polls",
            self.max_polls
        );
        Ok(None)
    }
}

#[async_trait]
impl CaptchaSolver for CapSolver {
    #[instrument(skip(self))]
    async fn solve(&self) -> Option<String> {
        match self.try_solve().await {
            Ok(token) => token.filter(|t| !t.is_empty()),
            Err(e) => {
                debug!("captcha solve failed: {:#}", e);
                None
            }
        }
    }
}
