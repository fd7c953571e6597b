//! Incremental sync engine: dedup merge, the per-unit sync state machine,
//! status reconciliation and the scheduler hook.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siap_api::{dataset_label, is_syncable, syncable_datasets, PageSource};
use siap_core::{key_spec_for, record_key, DataRecord, KeySpec, SyncState, SyncUnit};
use siap_storage::{SyncStatePatch, SyncStateStore, TabularStore};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "siap-sync";

/// Pacing delay between remote pages inside one invocation.
const PAGE_DELAY: Duration = Duration::from_millis(300);

/// Safety cap when driving a unit to completion across repeated invocations.
const MAX_INVOCATIONS_PER_UNIT: usize = 64;

/// Cron line for the scheduler job: check due-ness every 30 minutes.
const SCHEDULER_CRON: &str = "0 */30 * * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("SIAP_API_BASE_URL")
                .unwrap_or_else(|_| "https://isb.example.go.id/api".to_string()),
            api_token: std::env::var("SIAP_API_TOKEN").ok(),
            data_dir: std::env::var("SIAP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            http_timeout_secs: std::env::var("SIAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("SIAP_USER_AGENT")
                .unwrap_or_else(|_| "siap-archiver/0.1".to_string()),
            scheduler_enabled: std::env::var("SIAP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

/// Outcome of merging one incoming batch against an existing key set.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub unique_records: Vec<DataRecord>,
    pub duplicate_count: usize,
}

/// Partitions `incoming` into unique-to-append vs duplicate-to-skip under
/// `key_spec`. First occurrence wins, so within-batch duplicates are caught
/// too; incoming order is preserved. Deterministic for identical inputs.
pub fn merge_batch(
    existing_keys: &mut HashSet<String>,
    key_spec: &KeySpec,
    incoming: Vec<DataRecord>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for record in incoming {
        let key = record_key(&record, key_spec);
        if existing_keys.insert(key) {
            outcome.unique_records.push(record);
        } else {
            outcome.duplicate_count += 1;
        }
    }
    outcome
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Page size requested from the remote API.
    pub batch_size: usize,
    /// Pages fetched per invocation; the caller re-invokes until complete.
    pub max_pages: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_pages: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum VerificationStatus {
    Verified,
    Mismatch { expected: usize, actual: usize },
}

/// Structured per-invocation result. Partial progress is always reported,
/// even when the invocation ends in an error.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub success: bool,
    pub new_records: usize,
    pub duplicates_skipped: usize,
    pub total_records: usize,
    pub storage_location: Option<String>,
    pub is_complete: bool,
    pub verification: Option<VerificationStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Rejected before any I/O: two concurrent runs against one sync unit
    /// would interleave whole-document writes and corrupt cursor/count pairs.
    #[error("sync already in progress for {unit}")]
    AlreadyInProgress { unit: SyncUnit },
}

/// Filter for status queries; both fields optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusFilter {
    pub dataset_id: Option<String>,
    pub period: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodStatus {
    pub period: String,
    pub state: SyncState,
    pub file_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub dataset_id: String,
    pub label: String,
    pub periods: Vec<PeriodStatus>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Drives one synchronization run per (dataset, period): resume decision,
/// bounded paging, batched commit, post-run verification.
pub struct SyncEngine {
    tables: TabularStore,
    state: SyncStateStore,
    source: Arc<dyn PageSource>,
    in_flight: Mutex<HashSet<SyncUnit>>,
    page_delay: Duration,
}

impl SyncEngine {
    pub fn new(tables: TabularStore, state: SyncStateStore, source: Arc<dyn PageSource>) -> Self {
        Self {
            tables,
            state,
            source,
            in_flight: Mutex::new(HashSet::new()),
            page_delay: PAGE_DELAY,
        }
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    pub fn state_store(&self) -> &SyncStateStore {
        &self.state
    }

    /// One bounded invocation of the state machine. Every outcome except the
    /// pre-I/O concurrency rejection comes back as a structured report.
    pub async fn sync_unit(
        &self,
        unit: &SyncUnit,
        opts: &SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight set lock poisoned");
            if !in_flight.insert(unit.clone()) {
                return Err(SyncError::AlreadyInProgress { unit: unit.clone() });
            }
        }

        let report = self.run_invocation(unit, opts).await;

        self.in_flight
            .lock()
            .expect("in-flight set lock poisoned")
            .remove(unit);
        Ok(report)
    }

    async fn run_invocation(&self, unit: &SyncUnit, opts: &SyncOptions) -> SyncReport {
        let key_spec = key_spec_for(&unit.dataset_id);
        let prior_state = self.state.get(&unit.dataset_id, &unit.period).await;
        let prior_info = self.tables.info(unit).await;

        // Resume decision: a stored cursor is only trusted while its backing
        // table is still on disk.
        let mut cursor: Option<String> = None;
        match &prior_state {
            Some(state) if prior_info.exists && state.last_cursor.is_some() => {
                cursor = state.last_cursor.clone();
                info!(unit = %unit, cursor = ?cursor, "resuming from stored cursor");
            }
            Some(state) if !prior_info.exists && state.total_records > 0 => {
                warn!(
                    unit = %unit,
                    claimed = state.total_records,
                    "state claims records but table is missing, starting fresh"
                );
            }
            _ => {}
        }

        // Paging loop, bounded per invocation. A later-page failure never
        // discards pages already fetched.
        let mut fetched: Vec<DataRecord> = Vec::new();
        let mut is_complete = false;
        let mut error: Option<String> = None;

        for page_index in 0..opts.max_pages {
            match self
                .source
                .fetch_page(unit, opts.batch_size, cursor.as_deref())
                .await
            {
                Ok(page) => {
                    if page.records.is_empty() {
                        is_complete = true;
                        break;
                    }
                    fetched.extend(page.records);
                    cursor = page.next_cursor;
                    if !page.has_more || cursor.is_none() {
                        is_complete = true;
                        break;
                    }
                    if page_index + 1 < opts.max_pages && !self.page_delay.is_zero() {
                        tokio::time::sleep(self.page_delay).await;
                    }
                }
                Err(err) => {
                    warn!(unit = %unit, error = %err, "page fetch failed, committing partial progress");
                    error = Some(err.to_string());
                    break;
                }
            }
        }
        // Budget exhaustion with pages still pending is a pause: not
        // complete, no error, resumable exactly like an interruption.

        let fetched_count = fetched.len();
        let mut table = self.tables.load(unit, &key_spec).await;
        let outcome = merge_batch(&mut table.existing_keys, &key_spec, fetched);
        let new_records = outcome.unique_records.len();
        let duplicates_skipped = outcome.duplicate_count;
        table.records.extend(outcome.unique_records);
        let total_records = table.records.len();

        // A run that fetched nothing and errored commits nothing: persisting
        // here would mint a terminal-looking state entry for a unit that
        // never saw a successful page.
        if fetched_count == 0 && error.is_some() {
            return SyncReport {
                success: false,
                new_records,
                duplicates_skipped,
                total_records,
                storage_location: prior_state
                    .as_ref()
                    .filter(|s| !s.storage_location.is_empty())
                    .map(|s| s.storage_location.clone()),
                is_complete: false,
                verification: None,
                error,
            };
        }

        // Commit once per invocation; state is updated only after the table
        // write lands, never before.
        let mut storage_location = prior_state
            .as_ref()
            .filter(|s| !s.storage_location.is_empty())
            .map(|s| s.storage_location.clone());
        if fetched_count > 0 || !prior_info.exists {
            match self.tables.persist(unit, &table.records, &key_spec).await {
                Ok(path) => storage_location = Some(path.display().to_string()),
                Err(err) => {
                    return SyncReport {
                        success: false,
                        new_records,
                        duplicates_skipped,
                        total_records,
                        storage_location,
                        is_complete: false,
                        verification: None,
                        error: Some(format!("persisting table: {err:#}")),
                    };
                }
            }
        }

        let state_patch = SyncStatePatch {
            last_cursor: Some(if is_complete { None } else { cursor }),
            total_records: Some(total_records as u64),
            storage_location: storage_location.clone(),
        };
        if let Err(err) = self
            .state
            .update(&unit.dataset_id, &unit.period, state_patch)
            .await
        {
            return SyncReport {
                success: false,
                new_records,
                duplicates_skipped,
                total_records,
                storage_location,
                is_complete: false,
                verification: None,
                error: Some(format!("updating sync state: {err:#}")),
            };
        }

        // Post-run verification against the file on disk, completion only.
        let verification = if is_complete && error.is_none() {
            let info = self.tables.info(unit).await;
            if info.record_count == total_records {
                Some(VerificationStatus::Verified)
            } else {
                warn!(
                    unit = %unit,
                    expected = total_records,
                    actual = info.record_count,
                    "post-sync record count mismatch"
                );
                Some(VerificationStatus::Mismatch {
                    expected: total_records,
                    actual: info.record_count,
                })
            }
        } else {
            None
        };

        SyncReport {
            success: error.is_none(),
            new_records,
            duplicates_skipped,
            total_records,
            storage_location,
            is_complete,
            verification,
            error,
        }
    }

    /// Re-invokes `sync_unit` until the unit completes or errors, folding the
    /// per-invocation counters into one aggregate report.
    pub async fn drive_to_completion(
        &self,
        unit: &SyncUnit,
        opts: &SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        let mut aggregate = self.sync_unit(unit, opts).await?;
        let mut invocations = 1;
        while !aggregate.is_complete
            && aggregate.error.is_none()
            && invocations < MAX_INVOCATIONS_PER_UNIT
        {
            let report = self.sync_unit(unit, opts).await?;
            aggregate.new_records += report.new_records;
            aggregate.duplicates_skipped += report.duplicates_skipped;
            aggregate.total_records = report.total_records;
            aggregate.storage_location = report.storage_location.or(aggregate.storage_location);
            aggregate.is_complete = report.is_complete;
            aggregate.success = report.success;
            aggregate.verification = report.verification;
            aggregate.error = report.error;
            invocations += 1;
        }
        Ok(aggregate)
    }

    /// Cartesian product of periods × datasets, each driven independently.
    /// Non-syncable datasets are skipped; a unit already in flight is
    /// reported in-place rather than aborting the rest of the range.
    pub async fn sync_range(
        &self,
        dataset_ids: &[String],
        periods: &[String],
        opts: &SyncOptions,
    ) -> Vec<(SyncUnit, SyncReport)> {
        let mut outcomes = Vec::new();
        for dataset_id in dataset_ids {
            if !is_syncable(dataset_id) {
                warn!(%dataset_id, "skipping non-syncable dataset");
                continue;
            }
            for period in periods {
                let unit = SyncUnit::new(dataset_id.clone(), period.clone());
                match self.drive_to_completion(&unit, opts).await {
                    Ok(report) => outcomes.push((unit, report)),
                    Err(err @ SyncError::AlreadyInProgress { .. }) => {
                        outcomes.push((
                            unit,
                            SyncReport {
                                success: false,
                                new_records: 0,
                                duplicates_skipped: 0,
                                total_records: 0,
                                storage_location: None,
                                is_complete: false,
                                verification: None,
                                error: Some(err.to_string()),
                            },
                        ));
                    }
                }
            }
        }
        outcomes
    }

    /// Scheduler entry point: runs the allow-listed datasets for the current
    /// year when the schedule is enabled and due, then marks the run.
    pub async fn run_due_sync(&self) -> Result<Option<Vec<(SyncUnit, SyncReport)>>> {
        let schedule = self.state.get_schedule().await;
        let now = Utc::now();
        if !schedule.enabled || !schedule.is_due(now) {
            return Ok(None);
        }

        let dataset_ids: Vec<String> = if schedule.dataset_allow_list.is_empty() {
            syncable_datasets().map(|info| info.id.to_string()).collect()
        } else {
            schedule.dataset_allow_list.clone()
        };
        let period = now.format("%Y").to_string();

        let outcomes = self
            .sync_range(&dataset_ids, &[period], &SyncOptions::default())
            .await;
        self.state
            .mark_run(Utc::now())
            .await
            .context("marking scheduled run")?;
        Ok(Some(outcomes))
    }

    /// Read-only status query. `verify` cross-checks every entry against the
    /// actual file: entries claiming records with no backing table are reset
    /// and omitted (self-healing); counts for present tables are overridden
    /// with the store's ground truth.
    pub async fn list_status(&self, filter: &StatusFilter, verify: bool) -> Result<Vec<DatasetStatus>> {
        let mut grouped: BTreeMap<String, Vec<PeriodStatus>> = BTreeMap::new();

        for (dataset_id, period, mut state) in self.state.entries().await {
            if filter.dataset_id.as_ref().is_some_and(|d| *d != dataset_id) {
                continue;
            }
            if filter.period.as_ref().is_some_and(|p| *p != period) {
                continue;
            }

            let file_exists = if verify {
                let info = self
                    .tables
                    .info(&SyncUnit::new(dataset_id.clone(), period.clone()))
                    .await;
                if state.total_records > 0 && !info.exists {
                    warn!(%dataset_id, %period, "stale sync state, resetting");
                    self.state.reset(&dataset_id, &period).await?;
                    continue;
                }
                if info.exists {
                    state.total_records = info.record_count as u64;
                }
                info.exists
            } else {
                // Latency-sensitive path: report persisted state as-is.
                !state.storage_location.is_empty()
            };

            grouped.entry(dataset_id).or_default().push(PeriodStatus {
                period,
                state,
                file_exists,
            });
        }

        Ok(grouped
            .into_iter()
            .map(|(dataset_id, mut periods)| {
                periods.sort_by(|a, b| a.period.cmp(&b.period));
                let last_synced_at = periods.iter().map(|p| p.state.last_sync_date).max();
                DatasetStatus {
                    label: dataset_label(&dataset_id).to_string(),
                    dataset_id,
                    periods,
                    last_synced_at,
                }
            })
            .collect())
    }
}

/// Builds the production engine from env config.
pub fn build_engine(config: &SyncConfig) -> Result<SyncEngine> {
    let fetcher = siap_storage::ApiFetcher::new(siap_storage::FetchClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    let source = siap_api::RemotePageSource::new(
        fetcher,
        config.api_base_url.clone(),
        config.api_token.clone(),
    );
    Ok(SyncEngine::new(
        TabularStore::new(&config.data_dir),
        SyncStateStore::new(&config.data_dir),
        Arc::new(source),
    ))
}

/// When enabled, a periodic job checks due-ness and kicks a scheduled sync.
pub async fn maybe_build_scheduler(
    engine: Arc<SyncEngine>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(SCHEDULER_CRON, move |_uuid, _lock| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.run_due_sync().await {
                Ok(Some(outcomes)) => {
                    info!(units = outcomes.len(), "scheduled sync finished");
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {SCHEDULER_CRON}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
