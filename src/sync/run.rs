//! Run orchestration
//!
//! One run loads the known staleness records, admits the items that are
//! due, fans their detail fetches out under the concurrency cap, persists
//! successes, escalates exhausted items and finally records the run's
//! health. The browser session lives for exactly one run.

use crate::config::Config;
use crate::escalation::PendingQueue;
use crate::fetch::{
    BlockSnapshot, BlockTracker, BrowserLauncher, BrowserSession, ChromiumLauncher, Deadline,
    FetchError, FetchOutcome, FetchTarget, HttpTransport, ResilientFetcher, Strategy, Transport,
};
use crate::health::{HealthRecorder, RunReport};
use crate::schedule::{settle_all, ConcurrencyLimit};
use crate::state::{admit_for_fetch, Admission, ItemState, StalenessRecord};
use crate::storage::{lock_store, open_storage, SqliteStorage, Storage};
use crate::sync::terminal::extract_terminal_at;
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Counters for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Identifiers looked at (known records, seeds and extras)
    pub considered: usize,
    pub admitted: usize,
    pub skipped_fresh: usize,
    pub skipped_stale: usize,
    pub closed: usize,

    /// Records that received a new stale mark this run
    pub marked_stale: usize,
    pub succeeded: usize,

    /// Successes that needed the browser
    pub via_heavyweight: usize,
    pub failed: usize,

    /// Failures queued as pending tasks
    pub escalated: usize,
    pub duration: Duration,
    pub failures: Vec<ItemFailure>,
}

impl RunSummary {
    /// A run fails when it admitted work and none of it succeeded
    pub fn is_failure(&self) -> bool {
        self.admitted > 0 && self.succeeded == 0
    }

    fn failure_text(&self) -> String {
        match self.failures.last() {
            Some(last) => format!(
                "{} of {} admitted items failed; last: {} ({})",
                self.failed, self.admitted, last.identifier, last.reason
            ),
            None => format!("{} of {} admitted items failed", self.failed, self.admitted),
        }
    }
}

/// Why one item was not synced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub identifier: String,

    /// Terminal classification: block, timeout or other
    pub kind: &'static str,
    pub reason: String,

    /// Last strategy tried; `None` when no fetch was attempted
    pub strategy: Option<Strategy>,
    pub escalated: bool,
}

/// One admission decision, as shown by a dry run
#[derive(Debug, Clone)]
pub struct PlannedItem {
    pub identifier: String,
    pub admission: Admission,
}

/// Everything a run needs, wired once and reusable across runs
pub struct SyncRun {
    config: Config,
    config_hash: String,
    store: Arc<Mutex<SqliteStorage>>,
    transport: Arc<dyn Transport>,
    launcher: Option<Arc<dyn BrowserLauncher>>,
    tracker: Arc<BlockTracker>,
    queue: PendingQueue<SqliteStorage>,
    health: HealthRecorder<SqliteStorage>,
}

impl SyncRun {
    /// Creates a run with the production transport and browser
    ///
    /// # Arguments
    ///
    /// * `config` - The validated configuration
    /// * `config_hash` - Hash of the configuration file, recorded in health meta
    ///
    /// # Returns
    ///
    /// * `Ok(SyncRun)` - Ready to run
    /// * `Err(HarvestError)` - The store or HTTP client could not be set up
    pub fn new(config: Config, config_hash: String) -> Result<Self> {
        let storage = open_storage(Path::new(&config.storage.database_path))?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        let launcher: Option<Arc<dyn BrowserLauncher>> = if config.fetch.heavyweight_enabled {
            Some(Arc::new(ChromiumLauncher::new(config.browser.clone())))
        } else {
            None
        };

        Ok(Self::with_components(
            config,
            config_hash,
            storage,
            transport,
            launcher,
        ))
    }

    /// Creates a run from explicit components
    pub fn with_components(
        config: Config,
        config_hash: String,
        storage: SqliteStorage,
        transport: Arc<dyn Transport>,
        launcher: Option<Arc<dyn BrowserLauncher>>,
    ) -> Self {
        let store = Arc::new(Mutex::new(storage));
        let tracker = Arc::new(BlockTracker::new(config.circuit_breaker.clone()));
        let queue = PendingQueue::new(Arc::clone(&store));
        let health = HealthRecorder::new(Arc::clone(&store), config.health.alert_window);

        Self {
            config,
            config_hash,
            store,
            transport,
            launcher,
            tracker,
            queue,
            health,
        }
    }

    /// The shared store
    pub fn store(&self) -> Arc<Mutex<SqliteStorage>> {
        Arc::clone(&self.store)
    }

    /// Block metrics accumulated over this instance's runs
    pub fn block_snapshot(&self) -> BlockSnapshot {
        self.tracker.snapshot()
    }

    /// Admission decisions for every candidate, without fetching or writing
    pub fn plan(&self, extra_ids: &[String]) -> Result<Vec<PlannedItem>> {
        let now = Utc::now();
        let policy = self.config.staleness.policy();

        Ok(self
            .candidates(extra_ids)?
            .into_iter()
            .map(|(identifier, record)| PlannedItem {
                admission: admit_for_fetch(record.as_ref(), now, &policy),
                identifier,
            })
            .collect())
    }

    /// Executes one run
    ///
    /// The browser session is closed and the outcome recorded in the health
    /// log whether or not the run succeeds.
    ///
    /// # Arguments
    ///
    /// * `extra_ids` - Identifiers to consider in addition to known and seeded ones
    ///
    /// # Returns
    ///
    /// * `Ok(RunSummary)` - The run completed; individual items may have failed
    /// * `Err(HarvestError)` - The run itself could not proceed (store failure)
    pub async fn run(&self, extra_ids: &[String]) -> Result<RunSummary> {
        let started = Instant::now();
        let session = self
            .launcher
            .as_ref()
            .map(|launcher| Arc::new(BrowserSession::new(Arc::clone(launcher))));

        tracing::info!(
            scraper_type = %self.config.source.scraper_type,
            concurrency = self.config.executor.concurrency,
            heavyweight = session.is_some(),
            "Starting sync run"
        );

        let result = self.execute(extra_ids, session.clone()).await;

        if let Some(session) = &session {
            session.close().await;
        }

        let duration = started.elapsed();
        let result = result.map(|mut summary| {
            summary.duration = duration;
            summary
        });
        self.record_health(&result, duration);

        match &result {
            Ok(summary) => tracing::info!(
                considered = summary.considered,
                admitted = summary.admitted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                escalated = summary.escalated,
                duration_ms = duration.as_millis() as u64,
                "Sync run complete"
            ),
            Err(e) => tracing::error!(error = %e, "Sync run aborted"),
        }

        result
    }

    async fn execute(
        &self,
        extra_ids: &[String],
        session: Option<Arc<BrowserSession>>,
    ) -> Result<RunSummary> {
        let now = Utc::now();
        let policy = self.config.staleness.policy();
        let candidates = self.candidates(extra_ids)?;

        let mut summary = RunSummary {
            considered: candidates.len(),
            ..RunSummary::default()
        };
        let mut admitted = Vec::new();

        {
            let mut store = lock_store(&self.store);
            for (identifier, record) in candidates {
                let admission = admit_for_fetch(record.as_ref(), now, &policy);
                tracing::debug!(
                    identifier = %identifier,
                    state = %admission.state,
                    reason = admission.reason,
                    "Admission decision"
                );

                if admission.mark_stale {
                    store.mark_stale(&identifier, now)?;
                    summary.marked_stale += 1;
                }

                match admission.state {
                    ItemState::Fresh => summary.skipped_fresh += 1,
                    ItemState::Stale => summary.skipped_stale += 1,
                    ItemState::Closed => summary.closed += 1,
                    ItemState::Unseen | ItemState::Rescrapable => {}
                }

                if admission.admit {
                    admitted.push(identifier);
                }
            }
        }

        summary.admitted = admitted.len();
        tracing::info!(
            admitted = summary.admitted,
            skipped_fresh = summary.skipped_fresh,
            skipped_stale = summary.skipped_stale,
            closed = summary.closed,
            "Admission complete"
        );

        let deadline = self
            .config
            .executor
            .run_deadline_secs
            .map(|secs| Deadline::after(Duration::from_secs(secs)));

        let mut fetcher =
            ResilientFetcher::new(Arc::clone(&self.transport), &self.config, Arc::clone(&self.tracker));
        if let Some(session) = session {
            fetcher = fetcher.with_browser(session);
        }
        if let Some(deadline) = deadline {
            fetcher = fetcher.with_deadline(deadline);
        }

        let limit = ConcurrencyLimit::new(self.config.executor.concurrency);
        let results = settle_all(
            &limit,
            admitted
                .iter()
                .map(|identifier| self.sync_item(&fetcher, identifier, deadline.as_ref())),
        )
        .await;

        for result in results {
            match result {
                Ok(strategy) => {
                    summary.succeeded += 1;
                    if strategy == Strategy::Heavyweight {
                        summary.via_heavyweight += 1;
                    }
                }
                Err(failure) => {
                    summary.failed += 1;
                    if failure.escalated {
                        summary.escalated += 1;
                    }
                    summary.failures.push(failure);
                }
            }
        }

        Ok(summary)
    }

    /// Fetches and persists one item
    async fn sync_item(
        &self,
        fetcher: &ResilientFetcher,
        identifier: &str,
        deadline: Option<&Deadline>,
    ) -> std::result::Result<Strategy, ItemFailure> {
        if deadline.is_some_and(Deadline::is_expired) {
            return Err(ItemFailure {
                identifier: identifier.to_string(),
                kind: FetchError::DeadlineExceeded.kind(),
                reason: FetchError::DeadlineExceeded.reason(),
                strategy: None,
                escalated: false,
            });
        }

        let source = &self.config.source;
        let target = FetchTarget {
            url: source.detail_url(identifier),
            context: [
                ("identifier".to_string(), identifier.to_string()),
                ("kind".to_string(), source.task_kind.clone()),
            ]
            .into_iter()
            .collect(),
            expected_kind: source.expected_kind,
        };

        let started = Instant::now();
        let outcome = match fetcher.resilient_fetch(&target).await {
            Ok(outcome) => outcome,
            Err(FetchError::DeadlineExceeded) => {
                return Err(ItemFailure {
                    identifier: identifier.to_string(),
                    kind: FetchError::DeadlineExceeded.kind(),
                    reason: FetchError::DeadlineExceeded.reason(),
                    strategy: None,
                    escalated: false,
                });
            }
            Err(err) => {
                let failed = FetchOutcome::failure(&err, started.elapsed());
                tracing::warn!(
                    identifier,
                    strategy = %failed.strategy_used,
                    attempts = failed.attempts_used,
                    http_status = ?failed.http_status,
                    latency_ms = failed.latency.as_millis() as u64,
                    error = %err,
                    "Item fetch failed"
                );

                let escalated =
                    matches!(err, FetchError::Exhausted { .. }) && self.escalate(&target, identifier, &err);
                return Err(ItemFailure {
                    identifier: identifier.to_string(),
                    kind: err.kind(),
                    reason: err.reason(),
                    strategy: Some(failed.strategy_used),
                    escalated,
                });
            }
        };

        let payload = outcome.payload.unwrap_or_default();
        let terminal_at = source
            .terminal_field
            .as_deref()
            .and_then(|field| extract_terminal_at(&payload, field));

        let stored = lock_store(&self.store).mark_synced(identifier, Utc::now(), &payload, terminal_at);
        if let Err(e) = stored {
            tracing::error!(identifier, error = %e, "Failed to persist synced item");
            return Err(ItemFailure {
                identifier: identifier.to_string(),
                kind: "other",
                reason: "storage_error".to_string(),
                strategy: Some(outcome.strategy_used),
                escalated: false,
            });
        }

        tracing::info!(
            identifier,
            strategy = %outcome.strategy_used,
            attempts = outcome.attempts_used,
            latency_ms = outcome.latency.as_millis() as u64,
            "Item synced"
        );

        Ok(outcome.strategy_used)
    }

    /// Queues an exhausted item; false when the store rejected it
    fn escalate(&self, target: &FetchTarget, identifier: &str, err: &FetchError) -> bool {
        let context = json!({
            "context": target.context,
            "attempts": err.attempts(),
            "strategy": err.strategy(),
            "error_kind": err.kind(),
            "http_status": err.status(),
            "block_signal": err.block_signal().map(|signal| signal.reason()),
            "error": err.to_string(),
        });

        match self.queue.upsert(
            &self.config.source.task_kind,
            identifier,
            &target.url,
            &err.reason(),
            context,
        ) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(identifier, error = %e, "Failed to queue pending task");
                false
            }
        }
    }

    /// Known records first, then seeded and extra identifiers, without repeats
    fn candidates(&self, extra_ids: &[String]) -> Result<Vec<(String, Option<StalenessRecord>)>> {
        let records = lock_store(&self.store).load_records()?;

        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let known = records.iter().map(|record| record.identifier.as_str());
        let requested = self
            .config
            .source
            .identifiers
            .iter()
            .chain(extra_ids)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty());

        for identifier in known.chain(requested) {
            if seen.insert(identifier.to_string()) {
                order.push(identifier.to_string());
            }
        }

        let mut by_id: HashMap<String, StalenessRecord> = records
            .into_iter()
            .map(|record| (record.identifier.clone(), record))
            .collect();

        Ok(order
            .into_iter()
            .map(|identifier| {
                let record = by_id.remove(&identifier);
                (identifier, record)
            })
            .collect())
    }

    fn record_health(&self, result: &Result<RunSummary>, duration: Duration) {
        let scraper_type = &self.config.source.scraper_type;
        let duration_ms = duration.as_millis() as u64;
        let blocks = serde_json::to_value(self.tracker.snapshot()).unwrap_or_default();

        let report = match result {
            Ok(summary) => {
                let meta = json!({
                    "summary": serde_json::to_value(summary).unwrap_or_default(),
                    "blocks": blocks,
                    "config_hash": self.config_hash,
                });
                let report = if summary.is_failure() {
                    RunReport {
                        items_processed: summary.succeeded as u64,
                        ..RunReport::fail(scraper_type, duration_ms, summary.failure_text())
                    }
                } else {
                    RunReport::ok(scraper_type, duration_ms, summary.succeeded as u64)
                };
                report.with_meta(meta)
            }
            Err(e) => RunReport::fail(scraper_type, duration_ms, e.to_string()).with_meta(json!({
                "blocks": blocks,
                "config_hash": self.config_hash,
            })),
        };

        self.health.record_run(&report);
    }
}

/// Loads the store, runs once and returns the summary
///
/// # Arguments
///
/// * `config` - The validated configuration
/// * `config_hash` - Hash of the configuration file
/// * `extra_ids` - Identifiers to consider in addition to known and seeded ones
pub async fn run_sync(config: Config, config_hash: String, extra_ids: &[String]) -> Result<RunSummary> {
    let run = SyncRun::new(config, config_hash)?;
    run.run(extra_ids).await
}
