//! Wiring of the long-lived components

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, instrument};

use crate::alerts::{AlertEngine, AlertHandle, CycleReport};
use crate::captcha::{CapSolver, SolveBackoff};
use crate::config::{Config, Secrets};
use crate::error::LoginError;
use crate::login::{LoginPolicy, PortalCredentials, SessionClient};
use crate::mailbox::GmailMailbox;
use crate::mfa::CodeRetriever;
use crate::notify::{Notifier, TelegramNotifier};
use crate::portal::{PortalClient, SnapshotSource};
use crate::recipients::{RecipientResolver, RoleTable};
use crate::session::{RefresherHandle, SessionCredential, SessionProvider, SessionStore};
use crate::shutdown::ShutdownSignal;

/// Everything the background tasks share, built once at startup
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub shutdown: ShutdownSignal,
    pub store: Arc<SessionStore>,
    pub source: Arc<dyn SnapshotSource>,
    pub resolver: Arc<dyn RecipientResolver>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppContext {
    /// Builds the production component graph. Fails when a secret is missing.
    pub fn build(config: Config, secrets: &Secrets) -> Result<Self> {
        let services = secrets.require_services()?;
        let shutdown = ShutdownSignal::new();

        let captcha = CapSolver::new(
            &config.captcha,
            services.captcha_key,
            &config.portal.base_url,
        )?;
        let mailbox = GmailMailbox::new(&config.mailbox, services.gmail)?;
        let codes = CodeRetriever::new(mailbox, &config.mailbox);

        let client = SessionClient::new(
            &config.portal.base_url,
            PortalCredentials {
                login_id: services.login_id,
                password: services.login_password,
            },
            Arc::new(captcha),
            Arc::new(codes),
            SolveBackoff::from(&config.captcha),
            LoginPolicy::new(&config.login, &config.mailbox, &config.portal),
            shutdown.clone(),
        );

        let portal = PortalClient::new(&config.portal.base_url, config.portal.request_timeout())?;
        let notifier = TelegramNotifier::new(&config.telegram, &services.telegram_token)?;
        let roles = RoleTable::new(config.roles.clone());
        if roles.is_empty() {
            info!("no roles configured, alerts will not be delivered");
        }

        Ok(Self::from_parts(
            config,
            shutdown,
            Arc::new(client),
            Arc::new(portal),
            Arc::new(roles),
            Arc::new(notifier),
        ))
    }

    /// Assembles a context from already constructed components.
    pub fn from_parts(
        config: Config,
        shutdown: ShutdownSignal,
        provider: Arc<dyn SessionProvider>,
        source: Arc<dyn SnapshotSource>,
        resolver: Arc<dyn RecipientResolver>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let validity = Duration::from_secs(config.session.validity_secs);
        Self {
            store: Arc::new(SessionStore::new(provider, validity)),
            config,
            shutdown,
            source,
            resolver,
            notifier,
        }
    }

    pub fn alert_engine(&self) -> AlertEngine {
        AlertEngine::new(
            self.store.clone(),
            self.source.clone(),
            self.resolver.clone(),
            self.notifier.clone(),
            &self.config.alerts,
        )
    }

    /// Performs one login and stores the result.
    pub async fn login_once(&self) -> Result<SessionCredential, LoginError> {
        self.store.refresh().await?;
        self.store
            .current()
            .await
            .ok_or_else(|| LoginError::Protocol("credential expired immediately".to_string()))
    }

    /// Runs a single alert cycle outside the periodic loop.
    pub async fn check_once(&self) -> CycleReport {
        self.alert_engine().check_cycle(Utc::now()).await
    }

    /// Acquires the initial session and starts the refresher and the alert loop.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Running {
        self.store.ensure_fresh().await;

        let refresher = RefresherHandle::spawn(
            self.store.clone(),
            Duration::from_secs(self.config.session.refresh_interval_secs),
        );
        let alerts = AlertHandle::spawn(
            self.alert_engine(),
            Duration::from_secs(self.config.alerts.interval_secs),
        );
        info!("session refresher and alert loop running");

        Running {
            shutdown: self.shutdown.clone(),
            refresher,
            alerts,
        }
    }
}

/// Handles of the started background tasks
pub struct Running {
    shutdown: ShutdownSignal,
    pub refresher: RefresherHandle,
    pub alerts: AlertHandle,
}

impl Running {
    /// Stops both loops and cancels any login still waiting on a retry.
    pub async fn stop(self) {
        self.shutdown.trigger();

        if let Err(e) = self.alerts.shutdown().await {
            error!("alert loop: {:#}", e);
        }
        if let Err(e) = self.refresher.shutdown().await {
            error!("session refresher: {:#}", e);
        }
        info!("background tasks stopped");
    }
}
