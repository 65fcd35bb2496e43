//! Log record model and intake enrichment rules

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix appended to messages cut at the message cap.
pub const TRUNCATION_SUFFIX: &str = "...(truncated)";

/// A single log record as it flows through the pipeline.
///
/// `project_id` is always assigned by the server from the authenticated
/// credentials; any value a client supplies is discarded at intake.
/// `segment_id` is stamped by the WAL when the record is durably framed and
/// never leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
    pub service: String,
    pub project_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(skip)]
    pub segment_id: u64,
}

/// Client-supplied record shape accepted by `POST /logs`.
///
/// Everything is optional; enrichment fills the gaps. A `project_id` field in
/// the body is not even deserialized.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRecord {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

/// Bounds applied to client-supplied fields at intake.
#[derive(Debug, Clone, Copy)]
pub struct RecordLimits {
    /// Maximum message length in codepoints before truncation.
    pub max_message_chars: usize,
    /// Maximum level length in codepoints.
    pub max_level_chars: usize,
    /// Maximum service length in codepoints.
    pub max_service_chars: usize,
    /// Largest tolerated clock skew for client timestamps in the future.
    pub max_future_skew_secs: i64,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            max_message_chars: 10_000,
            max_level_chars: 50,
            max_service_chars: 100,
            max_future_skew_secs: 3_600,
        }
    }
}

/// Intake validation errors, surfaced to the client as 400.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("timestamp is more than {0}s in the future")]
    TimestampTooFarAhead(i64),
}

impl IngestRecord {
    /// Normalize a client record into a pipeline record.
    ///
    /// Assigns the authenticated project id, defaults absent or zero
    /// timestamps to the arrival time, rejects timestamps beyond the skew
    /// bound, and enforces the field caps. Past timestamps are accepted
    /// verbatim.
    pub fn enrich(
        self,
        project_id: i32,
        arrival: DateTime<Utc>,
        limits: &RecordLimits,
    ) -> Result<LogRecord, RecordError> {
        let timestamp = match self.timestamp {
            Some(ts) if ts <= DateTime::<Utc>::UNIX_EPOCH => arrival,
            Some(ts) => {
                if ts > arrival + Duration::seconds(limits.max_future_skew_secs) {
                    return Err(RecordError::TimestampTooFarAhead(
                        limits.max_future_skew_secs,
                    ));
                }
                ts
            }
            None => arrival,
        };

        Ok(LogRecord {
            timestamp,
            level: clip(self.level, limits.max_level_chars),
            message: truncate_message(self.message, limits.max_message_chars),
            service: clip(self.service, limits.max_service_chars),
            project_id,
            data: self.data,
            segment_id: 0,
        })
    }
}

/// Cut `message` at `cap` codepoints, marking the cut.
fn truncate_message(message: String, cap: usize) -> String {
    match message.char_indices().nth(cap) {
        Some((idx, _)) => {
            let mut cut = message;
            cut.truncate(idx);
            cut.push_str(TRUNCATION_SUFFIX);
            cut
        }
        None => message,
    }
}

/// Cut a short field at `cap` codepoints without a marker.
fn clip(field: String, cap: usize) -> String {
    match field.char_indices().nth(cap) {
        Some((idx, _)) => {
            let mut cut = field;
            cut.truncate(idx);
            cut
        }
        None => field,
    }
}
