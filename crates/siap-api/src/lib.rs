//! Remote-source specifics: the dataset catalog, page-request building and
//! normalization of the two response shapes the endpoint family produces.
//!
//! Everything past this boundary sees a single [`Page`] type; the page loop
//! never learns whether the remote answered with a bare array or a cursor
//! envelope.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use siap_core::{DataRecord, SyncUnit};
use siap_storage::{ApiFetcher, FetchError};
use thiserror::Error;

pub const CRATE_NAME: &str = "siap-api";

/// Source generation of a dataset. Current feeds answer with a cursor
/// envelope; archival feeds answer with a bare array (one terminal page).
/// Merge logic is identical either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceGeneration {
    Current,
    Archival,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DatasetInfo {
    pub id: &'static str,
    pub label: &'static str,
    pub generation: SourceGeneration,
    pub requires_extra_params: bool,
}

/// Static catalog of known feeds. Datasets flagged `requires_extra_params`
/// need per-request parameters the archiver does not carry and are excluded
/// from the syncable set entirely.
pub const CATALOG: &[DatasetInfo] = &[
    DatasetInfo {
        id: "RUP-PaketPenyedia-Terumumkan",
        label: "RUP Paket Penyedia Terumumkan",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "RUP-PaketSwakelola-Terumumkan",
        label: "RUP Paket Swakelola Terumumkan",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "RUP-MasterSatker",
        label: "RUP Master Satuan Kerja",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "RUP-StrukturAnggaranPD",
        label: "RUP Struktur Anggaran PD",
        generation: SourceGeneration::Current,
        requires_extra_params: true,
    },
    DatasetInfo {
        id: "SPSE-TenderPengumuman",
        label: "SPSE Pengumuman Tender",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "SPSE-TenderSelesai",
        label: "SPSE Tender Selesai",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "SPSE-TenderSelesaiNilai",
        label: "SPSE Nilai Tender Selesai",
        generation: SourceGeneration::Archival,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "SPSE-NonTenderPengumuman",
        label: "SPSE Pengumuman Non-Tender",
        generation: SourceGeneration::Archival,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "SPSE-NonTenderSelesai",
        label: "SPSE Non-Tender Selesai",
        generation: SourceGeneration::Archival,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "SPSE-PesertaTender",
        label: "SPSE Peserta Tender",
        generation: SourceGeneration::Current,
        requires_extra_params: true,
    },
    DatasetInfo {
        id: "SPSE-TenderEkontrak-SPPBJ",
        label: "SPSE e-Kontrak SPPBJ",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
    DatasetInfo {
        id: "SPSE-TenderEkontrak-Kontrak",
        label: "SPSE e-Kontrak Kontrak",
        generation: SourceGeneration::Current,
        requires_extra_params: false,
    },
];

pub fn dataset_info(dataset_id: &str) -> Option<&'static DatasetInfo> {
    let segment = dataset_id.rsplit('/').next().unwrap_or(dataset_id);
    CATALOG.iter().find(|info| info.id == segment)
}

pub fn dataset_label(dataset_id: &str) -> &str {
    dataset_info(dataset_id).map(|info| info.label).unwrap_or(dataset_id)
}

pub fn syncable_datasets() -> impl Iterator<Item = &'static DatasetInfo> {
    CATALOG.iter().filter(|info| !info.requires_extra_params)
}

pub fn is_syncable(dataset_id: &str) -> bool {
    dataset_info(dataset_id).is_some_and(|info| !info.requires_extra_params)
}

/// One normalized page of remote data, regardless of response shape.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<DataRecord>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum PageError {
    /// Retries exhausted or non-retriable transport failure; the run is
    /// interruptible and resumable from the stored cursor.
    #[error("transient fetch failure: {0}")]
    Transient(#[from] FetchError),
    /// Non-2xx terminal status (400/401/404 family); never retried.
    #[error("terminal http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed page payload: {0}")]
    Malformed(String),
}

impl PageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PageError::Transient(_))
    }
}

/// Builds the page request URL: `{base}/{dataset}?limit=&period=[&cursor=]`.
/// Cursors from this endpoint family are opaque URL-safe tokens.
pub fn page_url(base_url: &str, unit: &SyncUnit, limit: usize, cursor: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let mut url = format!(
        "{}/{}?limit={}&period={}",
        base, unit.dataset_id, limit, unit.period
    );
    if let Some(cursor) = cursor {
        url.push_str("&cursor=");
        url.push_str(cursor);
    }
    url
}

/// Normalizes a raw page body. A bare array is all data with no more pages;
/// an envelope carries `data` plus optional `cursor` / `has_more`. When the
/// envelope omits `has_more`, a present cursor implies more pages.
pub fn normalize_page(body: &[u8]) -> Result<Page, PageError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|err| PageError::Malformed(format!("invalid json: {err}")))?;

    match value {
        JsonValue::Array(items) => Ok(Page {
            records: collect_records(items)?,
            next_cursor: None,
            has_more: false,
        }),
        JsonValue::Object(mut envelope) => {
            let data = match envelope.remove("data") {
                Some(JsonValue::Array(items)) => items,
                Some(_) => {
                    return Err(PageError::Malformed("envelope `data` is not an array".into()))
                }
                None => return Err(PageError::Malformed("envelope missing `data`".into())),
            };
            let next_cursor = match envelope.get("cursor") {
                Some(JsonValue::String(cursor)) if !cursor.is_empty() => Some(cursor.clone()),
                _ => None,
            };
            let has_more = match envelope.get("has_more") {
                Some(JsonValue::Bool(flag)) => *flag,
                _ => next_cursor.is_some(),
            };
            Ok(Page {
                records: collect_records(data)?,
                next_cursor,
                has_more,
            })
        }
        _ => Err(PageError::Malformed(
            "payload is neither an array nor an envelope".into(),
        )),
    }
}

fn collect_records(items: Vec<JsonValue>) -> Result<Vec<DataRecord>, PageError> {
    items
        .into_iter()
        .map(|item| match item {
            JsonValue::Object(map) => Ok(map),
            other => Err(PageError::Malformed(format!(
                "record is not an object: {other}"
            ))),
        })
        .collect()
}

/// Seam between the orchestrator and the remote API. Tests drive the sync
/// engine with scripted in-memory sources through this trait.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        unit: &SyncUnit,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, PageError>;
}

/// Production source: resilient fetch against the remote API with a bearer
/// credential supplied at process start.
pub struct RemotePageSource {
    fetcher: ApiFetcher,
    base_url: String,
    bearer_token: Option<String>,
}

impl RemotePageSource {
    pub fn new(fetcher: ApiFetcher, base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            bearer_token,
        }
    }
}

#[async_trait]
impl PageSource for RemotePageSource {
    async fn fetch_page(
        &self,
        unit: &SyncUnit,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page, PageError> {
        let url = page_url(&self.base_url, unit, limit, cursor);
        let response = self.fetcher.fetch(&url, self.bearer_token.as_deref()).await?;

        if !response.status.is_success() {
            return Err(PageError::Status {
                status: response.status.as_u16(),
                url: response.final_url,
            });
        }
        normalize_page(&response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_array_is_one_terminal_page() {
        let body = br#"[{"kode_rup":"1"},{"kode_rup":"2"}]"#;
        let page = normalize_page(body).expect("normalize");
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor, None);
        assert!(!page.has_more);
    }

    #[test]
    fn envelope_carries_cursor_and_has_more() {
        let body = br#"{"data":[{"kd_tender":"T-1"}],"cursor":"abc","has_more":true}"#;
        let page = normalize_page(body).expect("normalize");
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
        assert!(page.has_more);
    }

    #[test]
    fn envelope_without_has_more_infers_from_cursor() {
        let with_cursor = normalize_page(br#"{"data":[],"cursor":"abc"}"#).expect("normalize");
        assert!(with_cursor.has_more);

        let without_cursor = normalize_page(br#"{"data":[{"kode_rup":"1"}]}"#).expect("normalize");
        assert!(!without_cursor.has_more);
        assert_eq!(without_cursor.next_cursor, None);
    }

    #[test]
    fn empty_cursor_string_counts_as_absent() {
        let page = normalize_page(br#"{"data":[],"cursor":""}"#).expect("normalize");
        assert_eq!(page.next_cursor, None);
        assert!(!page.has_more);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(normalize_page(b"not json").is_err());
        assert!(normalize_page(br#""just a string""#).is_err());
        assert!(normalize_page(br#"{"rows":[]}"#).is_err());
        assert!(normalize_page(br#"{"data":[1,2]}"#).is_err());
    }

    #[test]
    fn page_url_includes_cursor_only_when_present() {
        let unit = SyncUnit::new("SPSE-TenderPengumuman", "2024");
        assert_eq!(
            page_url("https://api.example.go.id/isb/", &unit, 100, None),
            "https://api.example.go.id/isb/SPSE-TenderPengumuman?limit=100&period=2024"
        );
        assert_eq!(
            page_url("https://api.example.go.id/isb", &unit, 50, Some("abc")),
            "https://api.example.go.id/isb/SPSE-TenderPengumuman?limit=50&period=2024&cursor=abc"
        );
    }

    #[test]
    fn syncable_set_excludes_extra_param_datasets() {
        assert!(is_syncable("SPSE-TenderPengumuman"));
        assert!(!is_syncable("SPSE-PesertaTender"));
        assert!(!is_syncable("unknown-dataset"));
        assert!(syncable_datasets().all(|info| !info.requires_extra_params));
    }

    #[test]
    fn dataset_lookup_uses_trailing_segment() {
        assert_eq!(
            dataset_label("isb/spse/SPSE-TenderPengumuman"),
            "SPSE Pengumuman Tender"
        );
        assert_eq!(dataset_label("no-such-feed"), "no-such-feed");
    }
}
