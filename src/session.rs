//! Holder of the current session credential and its background renewal
//!
//! The store keeps at most one credential and replaces it as a whole value. Three
//! consumers acquire credentials through the same [`SessionProvider`]:
//!
//! - `ensure_fresh` at startup (failures are logged, never returned)
//! - the refresher actor, every `interval` after an initial wait of one `interval`
//! - `get_or_acquire` on demand, single-flighted so concurrent callers share one login

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::error::LoginError;

/// Opaque proof of an authenticated portal session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential {
    token: String,
    acquired_at: DateTime<Utc>,
}

impl SessionCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self::acquired_at(token, Utc::now())
    }

    pub fn acquired_at(token: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            acquired_at,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn is_stale(&self, validity: Duration, now: DateTime<Utc>) -> bool {
        let validity = chrono::Duration::from_std(validity).unwrap_or(chrono::Duration::MAX);
        now - self.acquired_at >= validity
    }
}

// the token never ends up in logs
impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &crate::util::mask_secret(&self.token))
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// Single asynchronous login contract
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self) -> Result<SessionCredential, LoginError>;
}

pub struct SessionStore {
    provider: Arc<dyn SessionProvider>,
    current: RwLock<Option<SessionCredential>>,
    /// Serialises acquisitions
    acquiring: Mutex<()>,
    validity: Duration,
}

impl SessionStore {
    pub fn new(provider: Arc<dyn SessionProvider>, validity: Duration) -> Self {
        Self {
            provider,
            current: RwLock::new(None),
            acquiring: Mutex::new(()),
            validity,
        }
    }

    /// Snapshot of the held credential, `None` when absent or stale.
    pub async fn current(&self) -> Option<SessionCredential> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|c| !c.is_stale(self.validity, Utc::now()))
            .cloned()
    }

    pub async fn replace(&self, credential: SessionCredential) {
        *self.current.write().await = Some(credential);
    }

    /// Drops the held credential, e.g. after the portal rejected it.
    pub async fn invalidate(&self) {
        if self.current.write().await.take().is_some() {
            info!("session credential invalidated");
        }
    }

    /// Acquires a credential if none is held. Never fails.
    #[instrument(skip(self))]
    pub async fn ensure_fresh(&self) {
        if self.current().await.is_some() {
            debug!("credential already present");
            return;
        }

        info!("initial session fetch");
        if self.get_or_acquire().await.is_some() {
            info!("initial session ready");
        }
    }

    /// The current credential, logging in first when there is none.
    ///
    /// Concurrent callers wait for the login already in flight instead of
    /// starting their own. Returns `None` when the login failed.
    #[instrument(skip(self))]
    pub async fn get_or_acquire(&self) -> Option<SessionCredential> {
        if let Some(credential) = self.current().await {
            return Some(credential);
        }

        let _guard = self.acquiring.lock().await;

        // someone else may have finished a login while we waited
        if let Some(credential) = self.current().await {
            return Some(credential);
        }

        match self.provider.acquire().await {
            Ok(credential) => {
                self.replace(credential.clone()).await;
                Some(credential)
            }
            Err(e) => {
                error!("could not obtain session: {e}");
                None
            }
        }
    }

    /// Logs in unconditionally and replaces the credential on success.
    ///
    /// On failure the previous credential is kept.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), LoginError> {
        let _guard = self.acquiring.lock().await;

        info!("refreshing session");
        let credential = self.provider.acquire().await?;
        self.replace(credential).await;
        info!("session refreshed");
        Ok(())
    }
}

#[derive(Debug)]
pub enum RefresherCommand {
    /// Refresh immediately, independent of the timer
    RefreshNow {
        respond_to: oneshot::Sender<Result<(), LoginError>>,
    },

    Shutdown,
}

/// Actor renewing the session on a fixed interval
pub struct SessionRefresher {
    store: Arc<SessionStore>,
    interval: Duration,
    command_rx: mpsc::Receiver<RefresherCommand>,
}

impl SessionRefresher {
    pub fn new(
        store: Arc<SessionStore>,
        interval: Duration,
        command_rx: mpsc::Receiver<RefresherCommand>,
    ) -> Self {
        Self {
            store,
            interval,
            command_rx,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting session refresher");

        // first tick one interval out; startup already ran ensure_fresh
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.store.refresh().await {
                        error!("failed to refresh session: {e}");
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RefresherCommand::RefreshNow { respond_to } => {
                            debug!("received RefreshNow command");
                            let _ = respond_to.send(self.store.refresh().await);
                        }

                        RefresherCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        info!("session refresher stopped");
    }
}

/// Handle for controlling a [`SessionRefresher`]
#[derive(Clone)]
pub struct RefresherHandle {
    sender: mpsc::Sender<RefresherCommand>,
}

impl RefresherHandle {
    pub fn spawn(store: Arc<SessionStore>, interval: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = SessionRefresher::new(store, interval, cmd_rx);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn refresh_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RefresherCommand::RefreshNow { respond_to: tx })
            .await
            .context("failed to send RefreshNow command")?;

        rx.await.context("failed to receive response")??;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(RefresherCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
