//! Reconciliation cycle: fetch portal records, normalize, diff against the
//! event store, notify once, persist.

pub mod config;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sapn_adapters::{
    normalize_record, FixturePortalClient, InovarPortalClient, PortalClient, PortalError,
};
use sapn_core::{EventBatch, EventDraft, EventType, ReconciliationResult};
use sapn_notify::{FailureNotice, LogNotifier, Notifier, SmtpNotifier};
use sapn_storage::{EventStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{AppConfig, ConfigError};

pub const CRATE_NAME: &str = "sapn-sync";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Upstream(#[from] PortalError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Failures an operator should hear about: the portal refused us or the
    /// store cannot be reached. Query bugs are left to the logs.
    pub fn warrants_alert(&self) -> bool {
        match self {
            ReconcileError::Upstream(_) => true,
            ReconcileError::Store(err) => err.is_unavailable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// Re-send events stored with `notified = false` on the next cycle.
    pub retry_unnotified: bool,
    pub notify_on_failure: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            retry_unnotified: true,
            notify_on_failure: true,
        }
    }
}

pub struct ReconciliationDriver {
    client: Arc<dyn PortalClient>,
    store: EventStore,
    notifier: Arc<dyn Notifier>,
    options: DriverOptions,
    gate: Mutex<()>,
}

impl ReconciliationDriver {
    pub fn new(
        client: Arc<dyn PortalClient>,
        store: EventStore,
        notifier: Arc<dyn Notifier>,
        options: DriverOptions,
    ) -> Self {
        Self {
            client,
            store,
            notifier,
            options,
            gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn options(&self) -> DriverOptions {
        self.options
    }

    /// Runs one reconciliation cycle. Concurrent callers are queued behind
    /// the same gate, so at most one cycle writes to the store at a time.
    pub async fn run(&self) -> Result<ReconciliationResult, ReconcileError> {
        let _guard = self.gate.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, portal = self.client.portal_id());
        async move {
            match self.reconcile(run_id).await {
                Ok(result) => {
                    info!(
                        new_absences = result.new_absences,
                        new_behavior_alerts = result.new_behavior_alerts,
                        retried_events = result.retried_events,
                        email_sent = result.email_sent,
                        "reconciliation finished"
                    );
                    Ok(result)
                }
                Err(err) => {
                    error!(error = %err, "reconciliation failed");
                    self.report_failure(&err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn reconcile(&self, run_id: Uuid) -> Result<ReconciliationResult, ReconcileError> {
        let mut drafts = Vec::new();
        for event_type in EventType::ALL {
            let records = self.client.fetch(event_type).await?;
            let fetched = records.len();
            let mut skipped = 0usize;
            for record in &records {
                match normalize_record(event_type, record) {
                    Ok(draft) => drafts.push(draft),
                    Err(err) => {
                        skipped += 1;
                        warn!(%event_type, error = %err, "skipping malformed record");
                    }
                }
            }
            info!(%event_type, fetched, skipped, "portal records normalized");
        }

        let mut seen = HashSet::new();
        drafts.retain(|draft| seen.insert(draft.event_id.clone()));

        let known = self.store.all_ids().await?;
        let new_events: Vec<EventDraft> = drafts
            .into_iter()
            .filter(|draft| !known.contains(&draft.event_id))
            .collect();

        let pending = if self.options.retry_unnotified {
            self.store.pending_notification().await?
        } else {
            Vec::new()
        };

        let mut result = ReconciliationResult::empty(run_id, Utc::now());
        if new_events.is_empty() && pending.is_empty() {
            info!("no new events");
            return Ok(result);
        }

        result.new_absences = count_of(&new_events, EventType::Absence);
        result.new_behavior_alerts = count_of(&new_events, EventType::BehaviorAlert);
        result.retried_events = pending.len();

        let pending_ids: Vec<String> = pending.iter().map(|e| e.event_id.clone()).collect();
        let mut batch: EventBatch = new_events.iter().cloned().collect();
        for event in pending {
            batch.push_retried(EventDraft::from(event));
        }

        result.email_sent = match self.notifier.send(&batch).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, events = batch.len(), "notification failed; events stay unnotified");
                false
            }
        };

        self.store.insert_batch(&new_events, result.email_sent).await?;
        if result.email_sent && !pending_ids.is_empty() {
            let marked = self.store.mark_notified(&pending_ids).await?;
            info!(marked, "previously unnotified events delivered");
        }

        result.timestamp = Utc::now();
        Ok(result)
    }

    async fn report_failure(&self, err: &ReconcileError) {
        if !self.options.notify_on_failure || !err.warrants_alert() {
            return;
        }
        let message = match err {
            ReconcileError::Upstream(e) if e.is_blocked() => "portal check blocked by an anti-bot challenge",
            ReconcileError::Upstream(_) => "portal check failed",
            ReconcileError::Store(_) => "event store unavailable",
        };
        let notice = FailureNotice::new(message, Some(err.to_string()));
        if let Err(notify_err) = self.notifier.send_failure(&notice).await {
            warn!(error = %notify_err, "failure notification could not be sent");
        }
    }
}

fn count_of(drafts: &[EventDraft], event_type: EventType) -> usize {
    drafts.iter().filter(|d| d.event_type == event_type).count()
}

/// Per-invocation switches layered over [`AppConfig`] (CLI flags).
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub fixture: Option<PathBuf>,
    pub dry_run: bool,
}

pub fn build_portal_client(
    config: &AppConfig,
    fixture: Option<&Path>,
) -> Result<Arc<dyn PortalClient>> {
    if let Some(path) = fixture {
        info!(fixture = %path.display(), "using fixture portal client");
        return Ok(Arc::new(FixturePortalClient::from_path(path)?));
    }
    let portal = config.portal_config()?;
    Ok(Arc::new(
        InovarPortalClient::new(portal).context("building portal client")?,
    ))
}

pub fn build_notifier(config: &AppConfig, dry_run: bool) -> Result<Arc<dyn Notifier>> {
    if dry_run {
        return Ok(Arc::new(LogNotifier::new()));
    }
    let smtp = config.smtp_config()?;
    Ok(Arc::new(
        SmtpNotifier::new(smtp).context("building smtp notifier")?,
    ))
}

pub async fn build_driver(
    config: &AppConfig,
    overrides: &RunOverrides,
) -> Result<ReconciliationDriver> {
    if overrides.fixture.is_none() && !overrides.dry_run {
        config.require_all()?;
    }
    let client = build_portal_client(config, overrides.fixture.as_deref())?;
    let notifier = build_notifier(config, overrides.dry_run)?;
    let store = EventStore::open(&config.store_config())
        .await
        .with_context(|| format!("opening event store {}", config.database_path.display()))?;
    Ok(ReconciliationDriver::new(
        client,
        store,
        notifier,
        config.driver_options(),
    ))
}

pub async fn run_check_once_from_env() -> Result<ReconciliationResult> {
    let config = AppConfig::from_env()?;
    let driver = build_driver(&config, &RunOverrides::default()).await?;
    let result = driver.run().await;
    driver.store().close().await;
    Ok(result?)
}

/// Registers the periodic check when `SAPN_SCHEDULER_ENABLED` is set. The
/// caller owns starting the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    driver: Arc<ReconciliationDriver>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.check_cron.as_str();
    let job = Job::new_async_tz(cron, config.timezone, move |_uuid, _l| {
        let driver = Arc::clone(&driver);
        Box::pin(async move {
            if let Err(err) = driver.run().await {
                error!(error = %err, "scheduled check failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, timezone = %config.timezone, "scheduled check registered");
    Ok(Some(sched))
}
