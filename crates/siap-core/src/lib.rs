//! Core domain model for SIAP: open-schema records, sync units, key
//! resolution and schedule state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "siap-core";

/// A single remote record. The schema is defined by the remote dataset, not
/// by us, so records stay an ordered field-name -> value mapping end to end.
pub type DataRecord = serde_json::Map<String, JsonValue>;

/// The unit of persistence, cursoring and deduplication: one dataset in one
/// period (year). Records are never deduplicated across sync units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncUnit {
    pub dataset_id: String,
    pub period: String,
}

impl SyncUnit {
    pub fn new(dataset_id: impl Into<String>, period: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            period: period.into(),
        }
    }
}

impl std::fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dataset_id, self.period)
    }
}

/// Deduplication key spec for one dataset: an ordered list of key components,
/// each component an ordered fallback chain of candidate field names.
pub type KeySpec = Vec<Vec<String>>;

/// Default key component when a dataset has no explicit mapping.
pub const DEFAULT_KEY_FIELD: &str = "kode_rup";

/// Static key-field table, keyed by the trailing path segment of the dataset
/// id. Per component, the first candidate with a non-empty value wins.
const KEY_FIELD_TABLE: &[(&str, &[&[&str]])] = &[
    ("RUP-PaketPenyedia-Terumumkan", &[&["kode_rup", "kd_rup"]]),
    ("RUP-PaketSwakelola-Terumumkan", &[&["kode_rup", "kd_rup"]]),
    ("RUP-MasterSatker", &[&["kd_satker", "kd_satker_str"]]),
    ("RUP-StrukturAnggaranPD", &[&["kd_satker", "kd_skpd"], &["tahun_anggaran"]]),
    ("SPSE-TenderPengumuman", &[&["kd_tender", "kd_lelang"]]),
    ("SPSE-TenderSelesai", &[&["kd_tender", "kd_lelang"]]),
    ("SPSE-TenderSelesaiNilai", &[&["kd_tender", "kd_lelang"]]),
    ("SPSE-NonTenderPengumuman", &[&["kd_nontender", "kd_pct"]]),
    ("SPSE-NonTenderSelesai", &[&["kd_nontender", "kd_pct"]]),
    ("SPSE-PesertaTender", &[&["kd_tender"], &["kd_penyedia", "kd_peserta"]]),
    ("SPSE-TenderEkontrak-SPPBJ", &[&["kd_tender"], &["no_sppbj"]]),
    ("SPSE-TenderEkontrak-Kontrak", &[&["kd_tender"], &["no_kontrak"]]),
];

/// Resolves the dedup key spec for a dataset. Matches on the trailing path
/// segment; unmapped datasets get the single-component `kode_rup` default.
/// Resolution always succeeds.
pub fn key_spec_for(dataset_id: &str) -> KeySpec {
    let segment = dataset_id.rsplit('/').next().unwrap_or(dataset_id);
    KEY_FIELD_TABLE
        .iter()
        .find(|(name, _)| *name == segment)
        .map(|(_, components)| {
            components
                .iter()
                .map(|chain| chain.iter().map(|s| s.to_string()).collect())
                .collect()
        })
        .unwrap_or_else(|| vec![vec![DEFAULT_KEY_FIELD.to_string()]])
}

/// Computes the dedup key for one record: the pipe-joined first non-empty
/// candidate value per component. Records where every component comes up
/// empty fall back to a content hash of the whole record, so unkeyable rows
/// are only ever duplicates of byte-identical rows.
pub fn record_key(record: &DataRecord, spec: &KeySpec) -> String {
    let parts: Vec<String> = spec
        .iter()
        .map(|chain| {
            chain
                .iter()
                .find_map(|field| record.get(field).and_then(scalar_to_string))
                .unwrap_or_default()
        })
        .collect();

    if parts.iter().all(|p| p.is_empty()) {
        return format!("hash:{}", content_hash(record));
    }
    parts.join("|")
}

/// Hex sha256 of the record's JSON serialization.
pub fn content_hash(record: &DataRecord) -> String {
    let bytes = serde_json::to_vec(record).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Persisted per-unit sync progress. `last_cursor = None` is the terminal
/// marker: the unit has been synced through to the end of the remote data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_cursor: Option<String>,
    pub last_sync_date: DateTime<Utc>,
    pub total_records: u64,
    pub storage_location: String,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_cursor: None,
            last_sync_date: Utc::now(),
            total_records: 0,
            storage_location: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleCadence {
    Daily,
    Weekly,
}

/// Process-wide automatic-sync configuration, mutated only through explicit
/// update calls on the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub cadence: ScheduleCadence,
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dataset_allow_list: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cadence: ScheduleCadence::Daily,
            last_run: None,
            dataset_allow_list: Vec::new(),
        }
    }
}

impl ScheduleConfig {
    /// Whether a scheduled run is due at `now`. A schedule that never ran is
    /// due; otherwise due once 24h (daily) or 168h (weekly) have elapsed.
    /// The `enabled` flag is checked by the scheduler, not here.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Some(last_run) = self.last_run else {
            return true;
        };
        let threshold = match self.cadence {
            ScheduleCadence::Daily => Duration::hours(24),
            ScheduleCadence::Weekly => Duration::hours(168),
        };
        now.signed_duration_since(last_run) >= threshold
    }
}
