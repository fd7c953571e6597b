//! Durable stores + resilient HTTP fetch for SIAP.
//!
//! Two on-disk resources live here: one table document per sync unit
//! (full-rewrite persistence) and a single process-wide sync-state document.
//! Both are written via atomic temp-file rename so a completed write is
//! always self-consistent.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use siap_core::{
    record_key, DataRecord, KeySpec, ScheduleCadence, ScheduleConfig, SyncState, SyncUnit,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "siap-storage";

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("table path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Side metadata persisted next to the records, capturing the key spec that
/// was actually used at the time of the last write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMetadata {
    pub dataset_id: String,
    pub period: String,
    pub key_fields: KeySpec,
    pub last_updated: DateTime<Utc>,
    pub row_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct TableDocument {
    metadata: TableMetadata,
    records: Vec<DataRecord>,
}

/// A loaded table plus the key set needed for merging a new batch.
#[derive(Debug, Default)]
pub struct LoadedTable {
    pub records: Vec<DataRecord>,
    pub existing_keys: HashSet<String>,
    pub metadata: Option<TableMetadata>,
}

#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub exists: bool,
    pub size_bytes: u64,
    pub record_count: usize,
}

/// One JSON table document per sync unit under `<root>/tables/`.
///
/// Persistence is full-rewrite: every successful sync rewrites the whole
/// record set. The spreadsheet-style table format has no cheap partial
/// append, and a full rewrite keeps the file self-consistent.
#[derive(Debug, Clone)]
pub struct TabularStore {
    root: PathBuf,
}

impl TabularStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, unit: &SyncUnit) -> PathBuf {
        let dataset_dir = unit.dataset_id.replace('/', "_");
        self.root
            .join("tables")
            .join(dataset_dir)
            .join(format!("{}.json", unit.period))
    }

    /// Loads the table for a unit, recomputing the key set under `key_spec`.
    /// A missing file is an empty table; an unreadable or unparseable file is
    /// treated as empty with a warning (prior dedup history is lost for the
    /// unit, the sync restarts fresh).
    pub async fn load(&self, unit: &SyncUnit, key_spec: &KeySpec) -> LoadedTable {
        let path = self.table_path(unit);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return LoadedTable::default();
            }
            Err(err) => {
                warn!(unit = %unit, error = %err, "unreadable table treated as empty");
                return LoadedTable::default();
            }
        };

        let document: TableDocument = match serde_json::from_slice(&raw) {
            Ok(document) => document,
            Err(err) => {
                warn!(unit = %unit, error = %err, "corrupt table treated as empty");
                return LoadedTable::default();
            }
        };

        let existing_keys = document
            .records
            .iter()
            .map(|record| record_key(record, key_spec))
            .collect();
        LoadedTable {
            records: document.records,
            existing_keys,
            metadata: Some(document.metadata),
        }
    }

    /// Full rewrite of the table: all records (existing + merged) plus the
    /// metadata record. Returns the storage location.
    pub async fn persist(
        &self,
        unit: &SyncUnit,
        records: &[DataRecord],
        key_fields: &KeySpec,
    ) -> anyhow::Result<PathBuf> {
        let path = self.table_path(unit);
        let document = TableDocument {
            metadata: TableMetadata {
                dataset_id: unit.dataset_id.clone(),
                period: unit.period.clone(),
                key_fields: key_fields.clone(),
                last_updated: Utc::now(),
                row_count: records.len(),
            },
            records: records.to_vec(),
        };
        let bytes = serde_json::to_vec(&document)
            .with_context(|| format!("serializing table for {unit}"))?;
        write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Ground truth for verification: the record count is derived by
    /// reloading the file, never trusted from sync state.
    pub async fn info(&self, unit: &SyncUnit) -> TableInfo {
        let path = self.table_path(unit);
        let size_bytes = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return TableInfo::default(),
        };
        let record_count = match fs::read(&path)
            .await
            .ok()
            .and_then(|raw| serde_json::from_slice::<TableDocument>(&raw).ok())
        {
            Some(document) => document.records.len(),
            None => 0,
        };
        TableInfo {
            exists: true,
            size_bytes,
            record_count,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default)]
    sync_state: BTreeMap<String, BTreeMap<String, SyncState>>,
    #[serde(default)]
    schedule: ScheduleConfig,
}

/// Merge-patch for one sync-state entry. `last_cursor` is double-optional so
/// a patch can distinguish "leave as is" from "set to the terminal None".
#[derive(Debug, Clone, Default)]
pub struct SyncStatePatch {
    pub last_cursor: Option<Option<String>>,
    pub total_records: Option<u64>,
    pub storage_location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulePatch {
    pub enabled: Option<bool>,
    pub cadence: Option<ScheduleCadence>,
    pub dataset_allow_list: Option<Vec<String>>,
}

/// Single process-wide state document at `<root>/sync_state.json`.
///
/// Every operation is a whole-document read-modify-write serialized by an
/// internal mutex; two concurrent writers through the same store cannot lose
/// updates, but two processes (or two stores over one file) can. Callers
/// keep one store per data directory.
#[derive(Debug)]
pub struct SyncStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SyncStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: root.into().join("sync_state.json"),
            lock: Mutex::new(()),
        }
    }

    async fn read_document(&self) -> StateDocument {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return StateDocument::default(),
        };
        match serde_json::from_slice(&raw) {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "corrupt state document reset to defaults");
                StateDocument::default()
            }
        }
    }

    async fn write_document(&self, document: &StateDocument) -> anyhow::Result<()> {
        let bytes =
            serde_json::to_vec_pretty(document).context("serializing sync state document")?;
        write_atomic(&self.path, &bytes).await
    }

    pub async fn get(&self, dataset_id: &str, period: &str) -> Option<SyncState> {
        let _guard = self.lock.lock().await;
        self.read_document()
            .await
            .sync_state
            .get(dataset_id)
            .and_then(|periods| periods.get(period))
            .cloned()
    }

    /// All persisted `(dataset, period, state)` entries, for the reconciler.
    pub async fn entries(&self) -> Vec<(String, String, SyncState)> {
        let _guard = self.lock.lock().await;
        let document = self.read_document().await;
        document
            .sync_state
            .into_iter()
            .flat_map(|(dataset_id, periods)| {
                periods
                    .into_iter()
                    .map(move |(period, state)| (dataset_id.clone(), period, state))
            })
            .collect()
    }

    /// Merge-patches one entry, creating it with defaults when absent.
    /// `last_sync_date` is always refreshed to now.
    pub async fn update(
        &self,
        dataset_id: &str,
        period: &str,
        patch: SyncStatePatch,
    ) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await;
        let state = document
            .sync_state
            .entry(dataset_id.to_string())
            .or_default()
            .entry(period.to_string())
            .or_default();

        if let Some(last_cursor) = patch.last_cursor {
            state.last_cursor = last_cursor;
        }
        if let Some(total_records) = patch.total_records {
            state.total_records = total_records;
        }
        if let Some(storage_location) = patch.storage_location {
            state.storage_location = storage_location;
        }
        state.last_sync_date = Utc::now();

        self.write_document(&document).await
    }

    /// Deletes one entry entirely (reconciler self-heal path).
    pub async fn reset(&self, dataset_id: &str, period: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await;
        if let Some(periods) = document.sync_state.get_mut(dataset_id) {
            periods.remove(period);
            if periods.is_empty() {
                document.sync_state.remove(dataset_id);
            }
        }
        self.write_document(&document).await
    }

    pub async fn get_schedule(&self) -> ScheduleConfig {
        let _guard = self.lock.lock().await;
        self.read_document().await.schedule
    }

    pub async fn update_schedule(&self, patch: SchedulePatch) -> anyhow::Result<ScheduleConfig> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await;
        if let Some(enabled) = patch.enabled {
            document.schedule.enabled = enabled;
        }
        if let Some(cadence) = patch.cadence {
            document.schedule.cadence = cadence;
        }
        if let Some(dataset_allow_list) = patch.dataset_allow_list {
            document.schedule.dataset_allow_list = dataset_allow_list;
        }
        self.write_document(&document).await?;
        Ok(document.schedule)
    }

    pub async fn mark_run(&self, now: DateTime<Utc>) -> anyhow::Result<ScheduleConfig> {
        let _guard = self.lock.lock().await;
        let mut document = self.read_document().await;
        document.schedule.last_run = Some(now);
        self.write_document(&document).await?;
        Ok(document.schedule)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 429 and the retriable 5xx family retry; everything else (2xx success and
/// 400/401/404-style client errors included) terminates immediately and is
/// handed back to the caller for inspection.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 | 503 | 504 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl BackoffPolicy {
    /// Exponential, capped, no jitter. A single batch caller does not need
    /// jitter against this API.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempts: {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempts")]
    RetriableStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
}

/// One-page HTTP client with bounded retry. Terminal statuses come back as
/// `Ok(FetchedResponse)` even when non-2xx; only exhausted retries and
/// non-retriable transport failures are errors.
#[derive(Debug)]
pub struct ApiFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ApiFetcher {
    pub fn new(config: FetchClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        // Explicit loop with an attempt counter; the bound is trivially
        // testable and the stack stays flat.
        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if classify_status(status) == RetryDisposition::Retryable {
                        if attempt < self.backoff.max_retries {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::RetriableStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts: attempt + 1,
                        });
                    }

                    match resp.bytes().await {
                        Ok(body) => {
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body: body.to_vec(),
                            });
                        }
                        Err(err) => {
                            if classify_transport_error(&err) == RetryDisposition::Retryable
                                && attempt < self.backoff.max_retries
                            {
                                last_request_error = Some(err);
                                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                                continue;
                            }
                            return Err(FetchError::Request {
                                attempts: attempt + 1,
                                source: err,
                            });
                        }
                    }
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }

        Err(FetchError::Request {
            attempts: self.backoff.max_retries + 1,
            source: last_request_error.expect("retry loop should capture a request error"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use siap_core::key_spec_for;
    use tempfile::tempdir;

    fn record(kode_rup: &str, nama: &str) -> DataRecord {
        let mut map = DataRecord::new();
        map.insert("kode_rup".into(), json!(kode_rup));
        map.insert("nama_paket".into(), json!(nama));
        map
    }

    #[tokio::test]
    async fn missing_table_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = TabularStore::new(dir.path());
        let unit = SyncUnit::new("RUP-PaketPenyedia-Terumumkan", "2024");
        let loaded = store.load(&unit, &key_spec_for(&unit.dataset_id)).await;
        assert!(loaded.records.is_empty());
        assert!(loaded.existing_keys.is_empty());
        assert!(loaded.metadata.is_none());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_and_info_counts() {
        let dir = tempdir().expect("tempdir");
        let store = TabularStore::new(dir.path());
        let unit = SyncUnit::new("RUP-PaketPenyedia-Terumumkan", "2024");
        let spec = key_spec_for(&unit.dataset_id);

        let records = vec![record("RUP-1", "Jalan Desa"), record("RUP-2", "Jembatan")];
        let path = store.persist(&unit, &records, &spec).await.expect("persist");
        assert!(path.exists());

        let loaded = store.load(&unit, &spec).await;
        assert_eq!(loaded.records, records);
        assert!(loaded.existing_keys.contains("RUP-1"));
        assert!(loaded.existing_keys.contains("RUP-2"));
        let metadata = loaded.metadata.expect("metadata present");
        assert_eq!(metadata.row_count, 2);
        assert_eq!(metadata.key_fields, spec);

        let info = store.info(&unit).await;
        assert!(info.exists);
        assert_eq!(info.record_count, 2);
        assert!(info.size_bytes > 0);
    }

    #[tokio::test]
    async fn full_rewrite_replaces_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let store = TabularStore::new(dir.path());
        let unit = SyncUnit::new("RUP-PaketPenyedia-Terumumkan", "2024");
        let spec = key_spec_for(&unit.dataset_id);

        store
            .persist(&unit, &[record("RUP-1", "a")], &spec)
            .await
            .expect("first persist");
        let all = vec![record("RUP-1", "a"), record("RUP-2", "b"), record("RUP-3", "c")];
        store.persist(&unit, &all, &spec).await.expect("rewrite");

        assert_eq!(store.info(&unit).await.record_count, 3);
    }

    #[tokio::test]
    async fn corrupt_table_treated_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = TabularStore::new(dir.path());
        let unit = SyncUnit::new("RUP-PaketPenyedia-Terumumkan", "2024");
        let path = store.table_path(&unit);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not valid json").unwrap();

        let loaded = store.load(&unit, &key_spec_for(&unit.dataset_id)).await;
        assert!(loaded.records.is_empty());
    }

    #[tokio::test]
    async fn state_update_creates_entry_with_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = SyncStateStore::new(dir.path());

        assert!(store.get("SPSE-TenderPengumuman", "2024").await.is_none());

        store
            .update(
                "SPSE-TenderPengumuman",
                "2024",
                SyncStatePatch {
                    total_records: Some(120),
                    ..Default::default()
                },
            )
            .await
            .expect("update");

        let state = store
            .get("SPSE-TenderPengumuman", "2024")
            .await
            .expect("entry created");
        assert_eq!(state.total_records, 120);
        assert_eq!(state.last_cursor, None);
    }

    #[tokio::test]
    async fn state_patch_can_set_cursor_to_terminal_none() {
        let dir = tempdir().expect("tempdir");
        let store = SyncStateStore::new(dir.path());

        store
            .update(
                "SPSE-TenderPengumuman",
                "2024",
                SyncStatePatch {
                    last_cursor: Some(Some("page-3".into())),
                    ..Default::default()
                },
            )
            .await
            .expect("set cursor");
        assert_eq!(
            store.get("SPSE-TenderPengumuman", "2024").await.unwrap().last_cursor,
            Some("page-3".to_string())
        );

        store
            .update(
                "SPSE-TenderPengumuman",
                "2024",
                SyncStatePatch {
                    last_cursor: Some(None),
                    ..Default::default()
                },
            )
            .await
            .expect("clear cursor");
        assert_eq!(
            store.get("SPSE-TenderPengumuman", "2024").await.unwrap().last_cursor,
            None
        );
    }

    #[tokio::test]
    async fn reset_removes_entry_entirely() {
        let dir = tempdir().expect("tempdir");
        let store = SyncStateStore::new(dir.path());
        store
            .update("SPSE-TenderPengumuman", "2024", SyncStatePatch::default())
            .await
            .expect("create");
        store
            .reset("SPSE-TenderPengumuman", "2024")
            .await
            .expect("reset");
        assert!(store.get("SPSE-TenderPengumuman", "2024").await.is_none());
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn schedule_patch_and_mark_run() {
        let dir = tempdir().expect("tempdir");
        let store = SyncStateStore::new(dir.path());

        let schedule = store
            .update_schedule(SchedulePatch {
                enabled: Some(true),
                cadence: Some(ScheduleCadence::Weekly),
                dataset_allow_list: Some(vec!["SPSE-TenderPengumuman".into()]),
            })
            .await
            .expect("patch");
        assert!(schedule.enabled);
        assert_eq!(schedule.cadence, ScheduleCadence::Weekly);
        assert_eq!(schedule.last_run, None);

        let now = Utc::now();
        let schedule = store.mark_run(now).await.expect("mark run");
        assert_eq!(schedule.last_run, Some(now));
        // Other fields survive the mark.
        assert!(schedule.enabled);
    }

    #[test]
    fn status_classification_table() {
        for status in [429u16, 500, 502, 503, 504] {
            assert_eq!(
                classify_status(StatusCode::from_u16(status).unwrap()),
                RetryDisposition::Retryable
            );
        }
        for status in [200u16, 204, 400, 401, 404, 403, 301] {
            assert_eq!(
                classify_status(StatusCode::from_u16(status).unwrap()),
                RetryDisposition::NonRetryable
            );
        }
    }

    #[test]
    fn backoff_doubles_and_caps_at_ten_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_millis(10_000));
    }
}
