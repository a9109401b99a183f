//! Database row models.

use serde::{Deserialize, Serialize};
use tunerec_protocol::ChannelType;

/// A recorded program row.
///
/// Inserted at capture start with `recording = true`; the metadata and
/// filesize are refreshed when the session finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedProgram {
    pub id: i64,
    pub program_id: i64,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub start_at: i64,
    pub end_at: i64,
    pub name: String,
    pub description: Option<String>,
    pub extended: Option<String>,
    pub genre1: Option<i32>,
    pub genre2: Option<i32>,
    /// Originating rule, `None` for manual reservations.
    pub rule_id: Option<i64>,
    /// Path of the captured TS file.
    pub rec_path: String,
    pub filesize: Option<i64>,
    pub recording: bool,
}

/// Fields known when a capture session starts.
#[derive(Debug, Clone)]
pub struct NewRecorded {
    pub program_id: i64,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub start_at: i64,
    pub end_at: i64,
    pub name: String,
    pub description: Option<String>,
    pub extended: Option<String>,
    pub genre1: Option<i32>,
    pub genre2: Option<i32>,
    pub rule_id: Option<i64>,
    pub rec_path: String,
}

/// An output file produced by the encode pipeline, registered against a
/// recorded program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedFile {
    pub id: i64,
    pub recorded_id: i64,
    /// Human-readable label, e.g. the transcode mode name.
    pub name: String,
    pub path: String,
}
