use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use memory_worker_core::{ObservationBatch, ObservationSink, SinkError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

static RECORD_COUNTER: AtomicU64 = AtomicU64::new(1);

const DEFAULT_QUERY_LIMIT: usize = 50;
const MAX_QUERY_LIMIT: usize = 500;
const PREVIEW_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Observation,
    Summary,
}

impl RecordKind {
    fn file_name(self) -> &'static str {
        match self {
            RecordKind::Observation => "observations.jsonl",
            RecordKind::Summary => "summaries.jsonl",
        }
    }

    fn id_prefix(self) -> &'static str {
        match self {
            RecordKind::Observation => "obs",
            RecordKind::Summary => "sum",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub kind: RecordKind,
    pub timestamp_ms: u64,
    pub timestamp_iso: String,
    pub session_id: String,
    pub project: String,
    pub prompt_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<i64>,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StoreQuery {
    pub session_id: String,
    #[serde(default)]
    pub kinds: Vec<RecordKind>,
    pub observation_type: Option<String>,
    pub contains: Option<String>,
    pub since_ms: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreQueryResponse {
    pub records: Vec<StoredRecord>,
    pub timeline: Vec<TimelinePoint>,
    pub total: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelinePoint {
    pub id: String,
    pub timestamp_ms: u64,
    pub timestamp_iso: String,
    pub kind: RecordKind,
    pub label: String,
    pub preview: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store request: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only JSONL files, one directory per session.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    root_dir: PathBuf,
}

impl ObservationStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn default_root_dir() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".memory-worker")
            .join("sessions")
    }

    pub fn root_dir(&self) -> &Path {
        self.root_dir.as_path()
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let session = sanitize_component(session_id);
        if session.is_empty() {
            return Err(StoreError::Invalid(
                "session_id cannot be empty".to_string(),
            ));
        }
        // Must resolve to exactly one directory below the root.
        let mut components = Path::new(&session).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root_dir.join(&session)),
            _ => Err(StoreError::Invalid(format!(
                "session_id is not a valid directory name: {session_id}"
            ))),
        }
    }

    /// Writes every observation and the summary of one batch. Returns the
    /// number of records written.
    pub fn append_batch(&self, batch: &ObservationBatch) -> Result<usize, StoreError> {
        let session_dir = self.session_dir(&batch.session_id)?;
        fs::create_dir_all(&session_dir)?;

        let mut written = 0;
        if !batch.observations.is_empty() {
            let records = batch
                .observations
                .iter()
                .map(|observation| -> Result<StoredRecord, StoreError> {
                    let payload = serde_json::to_value(observation)?;
                    Ok(self.new_record(batch, RecordKind::Observation, payload))
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            append_records(&session_dir.join(RecordKind::Observation.file_name()), &records)?;
            written += records.len();
        }
        if let Some(summary) = batch.summary.as_ref() {
            let record = self.new_record(batch, RecordKind::Summary, serde_json::to_value(summary)?);
            append_records(&session_dir.join(RecordKind::Summary.file_name()), &[record])?;
            written += 1;
        }

        debug!(
            session_id = batch.session_id.as_str(),
            prompt_number = batch.prompt_number,
            written,
            "appended memory records"
        );
        Ok(written)
    }

    pub fn query(&self, request: &StoreQuery) -> Result<StoreQueryResponse, StoreError> {
        let session_dir = self.session_dir(&request.session_id)?;
        let mut records = Vec::new();
        for kind in [RecordKind::Observation, RecordKind::Summary] {
            if request.kinds.is_empty() || request.kinds.contains(&kind) {
                records.extend(read_records(&session_dir.join(kind.file_name()))?);
            }
        }
        let filtered = filter_records(records, request);
        let total = filtered.len();
        let limit = request
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        let truncated = total > limit;
        let records = if truncated {
            filtered[total - limit..].to_vec()
        } else {
            filtered
        };

        Ok(StoreQueryResponse {
            timeline: build_timeline(&records),
            records,
            total,
            truncated,
        })
    }

    fn new_record(&self, batch: &ObservationBatch, kind: RecordKind, payload: Value) -> StoredRecord {
        let (timestamp_ms, timestamp_iso) = now_timestamp();
        StoredRecord {
            id: format!(
                "{}-{}-{}",
                kind.id_prefix(),
                timestamp_ms,
                RECORD_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
            kind,
            timestamp_ms,
            timestamp_iso,
            session_id: batch.session_id.clone(),
            project: batch.project.clone(),
            prompt_number: batch.prompt_number,
            source_message_id: batch.source_message_id,
            provider: batch.provider.clone(),
            tokens_used: batch.tokens_used,
            payload,
        }
    }
}

#[async_trait]
impl ObservationSink for ObservationStore {
    async fn store(&self, batch: ObservationBatch) -> Result<(), SinkError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.append_batch(&batch))
            .await
            .map_err(|error| SinkError::new(error.to_string()))?
            .map(|_| ())
            .map_err(|error| SinkError::new(error.to_string()))
    }
}

fn append_records(path: &Path, records: &[StoredRecord]) -> Result<(), StoreError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for record in records {
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

fn read_records(path: &Path) -> Result<Vec<StoredRecord>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let raw = line?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        records.push(serde_json::from_str::<StoredRecord>(trimmed)?);
    }
    Ok(records)
}

fn filter_records(records: Vec<StoredRecord>, request: &StoreQuery) -> Vec<StoredRecord> {
    let contains = request
        .contains
        .as_ref()
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty());
    let observation_type = request
        .observation_type
        .as_deref()
        .map(str::trim)
        .filter(|item| !item.is_empty());

    let mut filtered = records
        .into_iter()
        .filter(|record| {
            request
                .since_ms
                .map(|cutoff| record.timestamp_ms >= cutoff)
                .unwrap_or(true)
                && observation_type
                    .map(|wanted| record_type(record) == Some(wanted))
                    .unwrap_or(true)
                && contains
                    .as_ref()
                    .map(|needle| record.payload.to_string().to_lowercase().contains(needle))
                    .unwrap_or(true)
        })
        .collect::<Vec<_>>();
    filtered.sort_by_key(|record| record.timestamp_ms);
    filtered
}

fn record_type(record: &StoredRecord) -> Option<&str> {
    match record.kind {
        RecordKind::Observation => record.payload.get("type").and_then(Value::as_str),
        RecordKind::Summary => None,
    }
}

fn build_timeline(records: &[StoredRecord]) -> Vec<TimelinePoint> {
    records
        .iter()
        .map(|record| {
            let label = match record.kind {
                RecordKind::Observation => record_type(record).unwrap_or("observation"),
                RecordKind::Summary => "summary",
            };
            let headline = ["title", "request", "completed"]
                .iter()
                .find_map(|field| record.payload.get(*field).and_then(Value::as_str))
                .map(ToString::to_string)
                .unwrap_or_else(|| record.payload.to_string());
            TimelinePoint {
                id: record.id.clone(),
                timestamp_ms: record.timestamp_ms,
                timestamp_iso: record.timestamp_iso.clone(),
                kind: record.kind,
                label: label.to_string(),
                preview: build_preview(&headline, PREVIEW_CHARS),
            }
        })
        .collect()
}

fn build_preview(input: &str, max_chars: usize) -> String {
    let normalized = input.replace('\n', " ").trim().to_string();
    if normalized.chars().count() <= max_chars {
        return normalized;
    }
    let mut out = normalized.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

fn sanitize_component(raw: &str) -> String {
    raw.trim()
        .replace('\\', "_")
        .replace('/', "_")
        .replace(':', "_")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_timestamp() -> (u64, String) {
    let ms = now_millis();
    let iso = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| format!("{ms}"));
    (ms, iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_worker_protocol::{ParsedObservation, ParsedSummary};

    fn observation(observation_type: &str, title: &str) -> ParsedObservation {
        ParsedObservation {
            observation_type: observation_type.to_string(),
            title: Some(title.to_string()),
            narrative: Some(format!("{title} in detail")),
            files_modified: vec!["src/lib.rs".to_string()],
            ..ParsedObservation::default()
        }
    }

    fn batch(session_id: &str) -> ObservationBatch {
        ObservationBatch {
            session_id: session_id.to_string(),
            project: "demo".to_string(),
            prompt_number: 2,
            source_message_id: Some(17),
            provider: "openai".to_string(),
            tokens_used: Some(120),
            observations: vec![
                observation("bugfix", "Fixed retry loop"),
                observation("discovery", "Found SSE quirk"),
            ],
            summary: Some(ParsedSummary {
                request: Some("Harden provider calls".to_string()),
                ..ParsedSummary::default()
            }),
        }
    }

    #[test]
    fn append_and_query_round_trip_per_session() {
        let root = tempfile::tempdir().expect("temp dir");
        let store = ObservationStore::new(root.path()).expect("create store");

        assert_eq!(store.append_batch(&batch("s1")).expect("append"), 3);
        store.append_batch(&batch("other")).expect("append other");

        let result = store
            .query(&StoreQuery {
                session_id: "s1".to_string(),
                ..StoreQuery::default()
            })
            .expect("query");
        assert_eq!(result.total, 3);
        assert!(!result.truncated);
        assert!(result.records.iter().all(|record| record.session_id == "s1"));
        assert!(result
            .records
            .iter()
            .all(|record| record.source_message_id == Some(17) && record.tokens_used == Some(120)));
        assert!(result.records[0].timestamp_iso.contains('T'));

        let observations = std::fs::read_to_string(root.path().join("s1").join("observations.jsonl"))
            .expect("read observations");
        assert_eq!(observations.lines().count(), 2);
        assert!(observations.contains("\"type\":\"bugfix\""));
    }

    #[test]
    fn query_filters_by_kind_type_text_and_limit() {
        let root = tempfile::tempdir().expect("temp dir");
        let store = ObservationStore::new(root.path()).expect("create store");
        store.append_batch(&batch("s2")).expect("append");
        store.append_batch(&batch("s2")).expect("append again");

        let summaries = store
            .query(&StoreQuery {
                session_id: "s2".to_string(),
                kinds: vec![RecordKind::Summary],
                ..StoreQuery::default()
            })
            .expect("query summaries");
        assert_eq!(summaries.total, 2);
        assert_eq!(summaries.timeline[0].label, "summary");
        assert_eq!(summaries.timeline[0].preview, "Harden provider calls");

        let bugfixes = store
            .query(&StoreQuery {
                session_id: "s2".to_string(),
                observation_type: Some("bugfix".to_string()),
                ..StoreQuery::default()
            })
            .expect("query bugfixes");
        assert_eq!(bugfixes.total, 2);
        assert!(bugfixes.timeline.iter().all(|point| point.label == "bugfix"));

        let sse = store
            .query(&StoreQuery {
                session_id: "s2".to_string(),
                contains: Some("sse QUIRK".to_string()),
                limit: Some(1),
                ..StoreQuery::default()
            })
            .expect("query text");
        assert_eq!(sse.total, 2);
        assert!(sse.truncated);
        assert_eq!(sse.records.len(), 1);
        assert_eq!(sse.timeline[0].preview, "Found SSE quirk");
    }

    #[test]
    fn missing_session_is_empty_and_blank_session_is_rejected() {
        let root = tempfile::tempdir().expect("temp dir");
        let store = ObservationStore::new(root.path()).expect("create store");

        let empty = store
            .query(&StoreQuery {
                session_id: "never-written".to_string(),
                ..StoreQuery::default()
            })
            .expect("query");
        assert_eq!(empty.total, 0);

        let error = store
            .append_batch(&batch("  "))
            .expect_err("blank session");
        assert!(matches!(error, StoreError::Invalid(_)));
    }

    #[test]
    fn session_ids_cannot_escape_the_root() {
        let root = tempfile::tempdir().expect("temp dir");
        let store = ObservationStore::new(root.path()).expect("create store");
        store.append_batch(&batch("../escape")).expect("append");
        assert!(root.path().join(".._escape").join("summaries.jsonl").exists());
    }

    #[test]
    fn dot_session_ids_are_rejected() {
        let parent = tempfile::tempdir().expect("temp dir");
        let root = parent.path().join("root");
        let store = ObservationStore::new(root.clone()).expect("create store");
        for session_id in ["..", ".", " .. "] {
            let error = store
                .append_batch(&batch(session_id))
                .expect_err("dot session id");
            assert!(matches!(error, StoreError::Invalid(_)));
            let error = store
                .query(&StoreQuery {
                    session_id: session_id.to_string(),
                    ..StoreQuery::default()
                })
                .expect_err("dot session query");
            assert!(matches!(error, StoreError::Invalid(_)));
        }
        assert!(!parent.path().join("summaries.jsonl").exists());
        assert!(!parent.path().join("observations.jsonl").exists());
        assert!(!root.join("summaries.jsonl").exists());
    }

    #[tokio::test]
    async fn sink_trait_appends_in_background() {
        let root = tempfile::tempdir().expect("temp dir");
        let store = ObservationStore::new(root.path()).expect("create store");
        store.store(batch("s3")).await.expect("sink store");

        let result = store
            .query(&StoreQuery {
                session_id: "s3".to_string(),
                kinds: vec![RecordKind::Observation],
                ..StoreQuery::default()
            })
            .expect("query");
        assert_eq!(result.records.len(), 2);
    }
}
