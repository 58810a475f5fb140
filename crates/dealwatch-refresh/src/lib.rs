//! The refresh job: fetch, persist, threshold-query, notify, on a fixed timer.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dealwatch_core::parse_id_list;
use dealwatch_notify::{Notifier, NotifyOutcome, SmtpConfig};
use dealwatch_source::{BatchFetcher, MockMarketplace, RecordSource, SourceError};
use dealwatch_store::{DiscountStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwatch-refresh";

/// Discount cutoff for alerting, in percentage points. Fixed; not an
/// operator-facing knob.
pub const DISCOUNT_THRESHOLD: f64 = 15.0;

/// Cadence of the refresh timer. Fixed ten minutes; not configurable.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub database_path: PathBuf,
    pub product_ids: Vec<i64>,
    pub recipient: Option<String>,
    pub threshold: f64,
    pub interval: Duration,
    pub chunk_size: usize,
    pub max_workers: usize,
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("DEALWATCH_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("discounts.db")),
            product_ids: std::env::var("DEALWATCH_PRODUCT_IDS")
                .ok()
                .and_then(|v| parse_id_list(&v).ok())
                .unwrap_or_else(|| vec![1, 2, 3, 4, 5]),
            recipient: std::env::var("DEALWATCH_RECIPIENT")
                .ok()
                .filter(|v| !v.is_empty()),
            threshold: DISCOUNT_THRESHOLD,
            interval: REFRESH_INTERVAL,
            chunk_size: dealwatch_source::DEFAULT_CHUNK_SIZE,
            max_workers: dealwatch_source::DEFAULT_MAX_WORKERS,
        }
    }
}

/// Pipeline stage a cycle is in when something goes wrong. A cycle walks
/// fetching -> persisting -> querying -> notifying and returns to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetching,
    Persisting,
    Querying,
    Notifying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Fetching => "fetching",
            Phase::Persisting => "persisting",
            Phase::Querying => "querying",
            Phase::Notifying => "notifying",
        };
        f.write_str(name)
    }
}

/// A failed cycle names the phase it died in. Fatal to the current cycle
/// only; the next timer tick starts fresh.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cycle aborted while fetching: {0}")]
    Fetch(#[from] SourceError),
    #[error("cycle aborted while persisting: {0}")]
    Persist(#[source] StoreError),
    #[error("cycle aborted while querying: {0}")]
    Query(#[source] StoreError),
}

impl CycleError {
    pub fn phase(&self) -> Phase {
        match self {
            CycleError::Fetch(_) => Phase::Fetching,
            CycleError::Persist(_) => Phase::Persisting,
            CycleError::Query(_) => Phase::Querying,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub flagged: usize,
    pub notified: NotifyOutcome,
}

/// Owns the store, source and notifier handles. Constructed once at process
/// start and passed by reference everywhere; no ambient global state.
pub struct RefreshJob {
    config: RefreshConfig,
    source: Arc<dyn RecordSource>,
    fetcher: BatchFetcher,
    store: DiscountStore,
    notifier: Notifier,
    // Cycles are one-at-a-time; the timer and the manual trigger both contend
    // for this gate.
    cycle_gate: Mutex<()>,
}

impl RefreshJob {
    pub fn new(
        config: RefreshConfig,
        source: Arc<dyn RecordSource>,
        store: DiscountStore,
        notifier: Notifier,
    ) -> Self {
        let fetcher = BatchFetcher::new(config.chunk_size, config.max_workers);
        Self {
            config,
            source,
            fetcher,
            store,
            notifier,
            cycle_gate: Mutex::new(()),
        }
    }

    /// Standard wiring: mock marketplace, SQLite file from the config, SMTP
    /// notifier from the environment.
    pub async fn from_config(config: RefreshConfig) -> anyhow::Result<Self> {
        let store = DiscountStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening discount store {}", config.database_path.display()))?;
        let notifier = Notifier::smtp(&SmtpConfig::from_env()).context("building smtp notifier")?;
        let source: Arc<dyn RecordSource> = Arc::new(MockMarketplace::new());
        Ok(Self::new(config, source, store, notifier))
    }

    pub fn store(&self) -> &DiscountStore {
        &self.store
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Run one full cycle, waiting for any in-flight cycle to finish first.
    pub async fn run_once(&self) -> Result<CycleSummary, CycleError> {
        let _gate = self.cycle_gate.lock().await;
        self.run_cycle().await
    }

    /// Run one cycle unless another is already in flight, in which case skip
    /// (returns `Ok(None)`). The scheduler tick goes through here.
    pub async fn try_run_once(&self) -> Result<Option<CycleSummary>, CycleError> {
        match self.cycle_gate.try_lock() {
            Ok(_gate) => self.run_cycle().await.map(Some),
            Err(_) => {
                warn!("previous refresh cycle still running; skipping this tick");
                Ok(None)
            }
        }
    }

    async fn run_cycle(&self) -> Result<CycleSummary, CycleError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("refresh_cycle", %run_id);
        let _guard = span.enter();

        debug!(phase = %Phase::Fetching, ids = self.config.product_ids.len(), "cycle started");
        let records = self
            .fetcher
            .fetch_all(&self.source, &self.config.product_ids)
            .await?;
        let fetched = records.len();

        debug!(phase = %Phase::Persisting, records = fetched, "persisting batch");
        self.store
            .upsert_all(&records)
            .await
            .map_err(CycleError::Persist)?;

        debug!(phase = %Phase::Querying, threshold = self.config.threshold, "querying flagged discounts");
        let flagged = self
            .store
            .find_at_or_above(self.config.threshold)
            .await
            .map_err(CycleError::Query)?;

        let notified = match (&self.config.recipient, flagged.is_empty()) {
            (Some(recipient), false) => {
                debug!(phase = %Phase::Notifying, flagged = flagged.len(), "sending discount alert");
                self.notifier.notify(recipient, &flagged).await
            }
            _ => NotifyOutcome::Skipped,
        };

        let summary = CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched,
            flagged: flagged.len(),
            notified,
        };
        info!(
            fetched = summary.fetched,
            flagged = summary.flagged,
            notified = ?summary.notified,
            "refresh cycle complete"
        );
        Ok(summary)
    }

    /// Start the recurring timer. Ticks land on [`Self::try_run_once`], so a
    /// slow cycle makes the next tick skip instead of overlapping.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<ScheduleHandle> {
        let mut sched = JobScheduler::new().await.context("creating refresh scheduler")?;

        let interval = self.config.interval;
        let job_ref = Arc::clone(&self);
        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let job = Arc::clone(&job_ref);
            Box::pin(async move {
                match job.try_run_once().await {
                    Ok(Some(_)) | Ok(None) => {}
                    Err(err) => warn!(phase = %err.phase(), error = %err, "scheduled refresh cycle aborted"),
                }
            })
        })
        .context("creating repeated refresh job")?;

        sched.add(job).await.context("adding refresh job")?;
        sched.start().await.context("starting refresh scheduler")?;
        info!(interval_secs = interval.as_secs(), "refresh scheduler started");
        Ok(ScheduleHandle { sched })
    }
}

/// Explicit start/stop lifecycle for the timer; dropping the handle without
/// calling [`Self::stop`] leaves the scheduler running until process exit.
pub struct ScheduleHandle {
    sched: JobScheduler,
}

impl ScheduleHandle {
    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.sched
            .shutdown()
            .await
            .context("shutting down refresh scheduler")?;
        info!("refresh scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dealwatch_core::DiscountRecord;
    use dealwatch_notify::{Mailer, Message, NotifyError};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct TestMailer {
        delivered: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for TestMailer {
        async fn deliver(&self, _message: Message) -> Result<(), NotifyError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(NotifyError::Other("simulated transport failure".to_string()));
            }
            Ok(())
        }
    }

    /// Mock marketplace whose prices drift with a shared offset, so a second
    /// cycle observes changed data for the same ids.
    struct ShiftingSource {
        price_drop: Arc<AtomicI64>,
    }

    #[async_trait]
    impl RecordSource for ShiftingSource {
        async fn fetch(&self, id: i64) -> Result<DiscountRecord, SourceError> {
            let price_drop = self.price_drop.load(Ordering::SeqCst);
            Ok(DiscountRecord {
                id,
                name: format!("Product {id}"),
                price: (100 - id - price_drop) as f64,
                discount: ((id + price_drop) % 20) as f64,
                last_updated: Utc::now(),
            })
        }
    }

    struct FailingSource;

    #[async_trait]
    impl RecordSource for FailingSource {
        async fn fetch(&self, id: i64) -> Result<DiscountRecord, SourceError> {
            Err(SourceError::Unreachable {
                id,
                reason: "simulated outage".to_string(),
            })
        }
    }

    struct SlowSource {
        delay: Duration,
    }

    #[async_trait]
    impl RecordSource for SlowSource {
        async fn fetch(&self, id: i64) -> Result<DiscountRecord, SourceError> {
            tokio::time::sleep(self.delay).await;
            MockMarketplace::new().fetch(id).await
        }
    }

    fn config(dir: &std::path::Path, ids: Vec<i64>, recipient: Option<&str>) -> RefreshConfig {
        RefreshConfig {
            database_path: dir.join("discounts.db"),
            product_ids: ids,
            recipient: recipient.map(str::to_string),
            threshold: DISCOUNT_THRESHOLD,
            interval: Duration::from_secs(600),
            chunk_size: 2,
            max_workers: 2,
        }
    }

    async fn job_with(
        config: RefreshConfig,
        source: Arc<dyn RecordSource>,
        fail_mail: bool,
    ) -> (RefreshJob, Arc<AtomicUsize>) {
        let store = DiscountStore::open(&config.database_path).await.expect("open store");
        let delivered = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(
            "alerts@example.com",
            Box::new(TestMailer {
                delivered: Arc::clone(&delivered),
                fail: fail_mail,
            }),
        );
        (RefreshJob::new(config, source, store, notifier), delivered)
    }

    #[tokio::test]
    async fn cycle_fetches_persists_flags_and_notifies() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), vec![1, 2, 16, 17], Some("user@example.com"));
        let (job, delivered) = job_with(config, Arc::new(MockMarketplace::new()), false).await;

        let summary = job.run_once().await.unwrap();
        assert_eq!(summary.fetched, 4);
        assert_eq!(summary.flagged, 2); // ids 16 and 17 are at or above 15%
        assert_eq!(summary.notified, NotifyOutcome::Sent);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(job.store().len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn no_flagged_records_skips_notification() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), vec![1, 2, 3], Some("user@example.com"));
        let (job, delivered) = job_with(config, Arc::new(MockMarketplace::new()), false).await;

        let summary = job.run_once().await.unwrap();
        assert_eq!(summary.flagged, 0);
        assert_eq!(summary.notified, NotifyOutcome::Skipped);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_recipient_skips_notification() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), vec![16, 17], None);
        let (job, delivered) = job_with(config, Arc::new(MockMarketplace::new()), false).await;

        let summary = job.run_once().await.unwrap();
        assert_eq!(summary.flagged, 2);
        assert_eq!(summary.notified, NotifyOutcome::Skipped);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notify_failure_does_not_abort_and_store_is_updated() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), vec![16, 17], Some("user@example.com"));
        let (job, delivered) = job_with(config, Arc::new(MockMarketplace::new()), true).await;

        let summary = job.run_once().await.unwrap();
        assert_eq!(summary.notified, NotifyOutcome::Failed);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        // The upsert happened before the delivery attempt.
        assert_eq!(job.store().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_cycle_and_names_the_phase() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), vec![1, 2], Some("user@example.com"));
        let (job, delivered) = job_with(config, Arc::new(FailingSource), false).await;

        let err = job.run_once().await.unwrap_err();
        assert_eq!(err.phase(), Phase::Fetching);
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert!(job.store().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn second_cycle_replaces_rows_instead_of_duplicating() {
        let dir = tempdir().unwrap();
        let price_drop = Arc::new(AtomicI64::new(0));
        let config = config(dir.path(), vec![5], None);
        let source = Arc::new(ShiftingSource {
            price_drop: Arc::clone(&price_drop),
        });
        let (job, _) = job_with(config, source, false).await;

        job.run_once().await.unwrap();
        price_drop.store(10, Ordering::SeqCst);
        job.run_once().await.unwrap();

        let all = job.store().all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].price, 85.0); // 100 - 5 - 10
        assert_eq!(all[0].discount, 15.0); // (5 + 10) % 20
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped_while_a_cycle_runs() {
        let dir = tempdir().unwrap();
        let config = config(dir.path(), vec![1, 2], None);
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(300),
        });
        let (job, _) = job_with(config, source, false).await;
        let job = Arc::new(job);

        let first = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.run_once().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let skipped = job.try_run_once().await.unwrap();
        assert!(skipped.is_none());

        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.fetched, 2);

        // With the first cycle done the guard opens again.
        let second = job.try_run_once().await.unwrap();
        assert!(second.is_some());
    }
}
