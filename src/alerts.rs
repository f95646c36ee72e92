//! Threshold evaluation and the periodic alert loop
//!
//! Every cycle fetches the full club snapshot and checks each club against three rules:
//!
//! ```text
//! LossLimit: loss_limit > 0, ring < 0, |ring| / loss_limit ≥ loss_warning_percent
//! WinLimit:  win_limit  > 0, ring > 0,  ring  / win_limit  ≥ win_warning_percent
//! PnlFloor:  ring + tournament ≤ pnl_floor
//! ```
//!
//! A fired (club, kind) pair is muted for `cooldown` afterwards, whether or not the
//! messages reached anyone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::EntitySnapshot;
use crate::config::AlertConfig;
use crate::error::PortalError;
use crate::notify::{AlertMessage, Notifier};
use crate::portal::SnapshotSource;
use crate::recipients::RecipientResolver;
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LossLimit,
    WinLimit,
    PnlFloor,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::LossLimit => write!(f, "loss_limit"),
            AlertKind::WinLimit => write!(f, "win_limit"),
            AlertKind::PnlFloor => write!(f, "pnl_floor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub loss_warning_percent: f64,
    pub win_warning_percent: f64,
    pub pnl_floor: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        (&AlertConfig::default()).into()
    }
}

impl From<&AlertConfig> for Thresholds {
    fn from(config: &AlertConfig) -> Self {
        Self {
            loss_warning_percent: config.loss_warning_percent,
            win_warning_percent: config.win_warning_percent,
            pnl_floor: config.pnl_floor,
        }
    }
}

/// Alert kinds `entity` currently triggers, in `LossLimit, WinLimit, PnlFloor` order.
pub fn evaluate(entity: &EntitySnapshot, thresholds: &Thresholds) -> Vec<AlertKind> {
    let mut kinds = Vec::new();
    let ring = entity.ring_pnl;

    if entity.loss_limit > 0.0
        && ring < 0.0
        && ring.abs() / entity.loss_limit * 100.0 >= thresholds.loss_warning_percent
    {
        kinds.push(AlertKind::LossLimit);
    }

    if entity.win_limit > 0.0
        && ring > 0.0
        && ring / entity.win_limit * 100.0 >= thresholds.win_warning_percent
    {
        kinds.push(AlertKind::WinLimit);
    }

    if entity.total_pnl() <= thresholds.pnl_floor {
        kinds.push(AlertKind::PnlFloor);
    }

    kinds
}

/// Last send time per (entity, kind)
#[derive(Debug, Clone)]
pub struct CooldownTracker {
    cooldown: chrono::Duration,
    last_sent: HashMap<(i64, AlertKind), DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: chrono::Duration::from_std(cooldown).unwrap_or(chrono::Duration::MAX),
            last_sent: HashMap::new(),
        }
    }

    /// True unless the pair was recorded within the last `cooldown` (inclusive).
    pub fn should_send(&self, entity_id: i64, kind: AlertKind, now: DateTime<Utc>) -> bool {
        match self.last_sent.get(&(entity_id, kind)) {
            Some(last) => now - *last > self.cooldown,
            None => true,
        }
    }

    pub fn record(&mut self, entity_id: i64, kind: AlertKind, now: DateTime<Utc>) {
        self.last_sent.insert((entity_id, kind), now);
    }

    /// Forgets entries that can no longer suppress anything.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let cooldown = self.cooldown;
        self.last_sent.retain(|_, last| now - *last <= cooldown);
    }

    pub fn len(&self) -> usize {
        self.last_sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_sent.is_empty()
    }
}

/// Outcome of one [`AlertEngine::check_cycle`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// No snapshot was available, nothing was evaluated
    pub skipped: bool,
    pub entities: usize,
    /// (entity, kind) pairs that fired outside their cooldown
    pub alerts: usize,
    /// (entity, kind) pairs that fired but were muted by the cooldown
    pub suppressed: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

pub struct AlertEngine {
    store: Arc<SessionStore>,
    source: Arc<dyn SnapshotSource>,
    resolver: Arc<dyn RecipientResolver>,
    notifier: Arc<dyn Notifier>,
    thresholds: Thresholds,
    cooldowns: CooldownTracker,
}

impl AlertEngine {
    pub fn new(
        store: Arc<SessionStore>,
        source: Arc<dyn SnapshotSource>,
        resolver: Arc<dyn RecipientResolver>,
        notifier: Arc<dyn Notifier>,
        config: &AlertConfig,
    ) -> Self {
        Self {
            store,
            source,
            resolver,
            notifier,
            thresholds: config.into(),
            cooldowns: CooldownTracker::new(Duration::from_secs(config.cooldown_secs)),
        }
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    /// Runs one evaluation pass at time `now`. Never fails; problems end up in the
    /// logs and in the returned report.
    #[instrument(skip(self))]
    pub async fn check_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        self.cooldowns.sweep(now);

        let Some(credential) = self.store.get_or_acquire().await else {
            warn!("no session available, skipping alert check");
            return CycleReport::skipped();
        };

        let entities = match self.source.fetch_all(&credential).await {
            Ok(entities) => entities,
            Err(PortalError::Unauthorized) => {
                warn!("session rejected by the portal, skipping alert check");
                self.store.invalidate().await;
                return CycleReport::skipped();
            }
            Err(e) => {
                warn!("no club data for alert check: {e}");
                return CycleReport::skipped();
            }
        };

        let mut report = CycleReport {
            entities: entities.len(),
            ..CycleReport::default()
        };

        for entity in &entities {
            for kind in evaluate(entity, &self.thresholds) {
                if !self.cooldowns.should_send(entity.id, kind, now) {
                    trace!("{kind} for club {} still in cooldown", entity.id);
                    report.suppressed += 1;
                    continue;
                }

                report.alerts += 1;
                let (delivered, failed) = self.dispatch(entity, kind).await;
                report.delivered += delivered;
                report.failed += failed;

                self.cooldowns.record(entity.id, kind, now);
            }
        }

        info!(
            "alert check completed: {} club(s), {} alert(s), {} message(s) sent",
            report.entities, report.alerts, report.delivered
        );
        report
    }

    /// Sends one alert to all of its recipients; returns (delivered, failed).
    async fn dispatch(&self, entity: &EntitySnapshot, kind: AlertKind) -> (usize, usize) {
        let recipients = self.resolver.recipients_for(entity.id);
        if recipients.is_empty() {
            warn!("{kind} for club {} has no recipients", entity.id);
            return (0, 0);
        }

        let text = AlertMessage::new(kind, entity).render();
        let sends = recipients.iter().map(|&recipient| {
            let text = text.as_str();
            async move { (recipient, self.notifier.send(recipient, text).await) }
        });

        let mut delivered = 0;
        let mut failed = 0;
        for (recipient, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    info!("{kind} alert sent to {recipient} for club {}", entity.id);
                    delivered += 1;
                }
                Err(e) => {
                    error!("failed to send {kind} alert to {recipient}: {:#}", e);
                    failed += 1;
                }
            }
        }

        (delivered, failed)
    }
}

#[derive(Debug)]
pub enum AlertCommand {
    /// Run a check cycle right away and report its outcome
    CheckNow {
        respond_to: oneshot::Sender<CycleReport>,
    },

    Shutdown,
}

/// Actor driving [`AlertEngine::check_cycle`] on a fixed interval
pub struct AlertActor {
    engine: AlertEngine,
    interval: Duration,
    command_rx: mpsc::Receiver<AlertCommand>,
}

impl AlertActor {
    pub fn new(
        engine: AlertEngine,
        interval: Duration,
        command_rx: mpsc::Receiver<AlertCommand>,
    ) -> Self {
        Self {
            engine,
            interval,
            command_rx,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alert actor");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.engine.check_cycle(Utc::now()).await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AlertCommand::CheckNow { respond_to } => {
                            debug!("received CheckNow command");
                            let report = self.engine.check_cycle(Utc::now()).await;
                            let _ = respond_to.send(report);
                        }

                        AlertCommand::Shutdown => {
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

        info!("alert actor stopped");
    }
}

/// Handle for controlling an [`AlertActor`]
#[derive(Clone)]
pub struct AlertHandle {
    sender: mpsc::Sender<AlertCommand>,
}

impl AlertHandle {
    pub fn spawn(engine: AlertEngine, interval: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = AlertActor::new(engine, interval, cmd_rx);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn check_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlertCommand::CheckNow { respond_to: tx })
            .await
            .context("failed to send CheckNow command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(AlertCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
