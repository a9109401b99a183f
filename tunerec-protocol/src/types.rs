//! Shared domain types for the tunerec control channel.

use serde::{Deserialize, Serialize};

/// Protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Broadcast channel type classification.
///
/// A physical tuner device advertises the set of types it can receive;
/// a program belongs to exactly one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelType {
    /// Digital terrestrial television (地上波デジタル)
    Gr,
    /// BS satellite (BS衛星)
    Bs,
    /// 110度CS satellite
    Cs,
    /// 124/128度CS (スカパー!プレミアムサービス)
    Sky,
}

impl ChannelType {
    /// Display name used in recorded-file naming (`%TYPE%`).
    pub fn name(&self) -> &'static str {
        match self {
            ChannelType::Gr => "GR",
            ChannelType::Bs => "BS",
            ChannelType::Cs => "CS",
            ChannelType::Sky => "SKY",
        }
    }

    /// Parse the display name back into a type.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "GR" => Some(ChannelType::Gr),
            "BS" => Some(ChannelType::Bs),
            "CS" => Some(ChannelType::Cs),
            "SKY" => Some(ChannelType::Sky),
            _ => None,
        }
    }
}

/// An immutable EPG fact. Owned by the EPG store; the core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// EPG-wide unique program id.
    pub id: i64,
    /// Logical channel (service) the program airs on.
    pub channel_id: i64,
    /// Physical multiplex identifier. Two programs with equal `channel`
    /// travel on the same tuned carrier.
    pub channel: String,
    /// Service id within the multiplex.
    pub service_id: i64,
    pub channel_type: ChannelType,
    /// Start time, ms since Unix epoch.
    pub start_at: i64,
    /// End time, ms since Unix epoch (exclusive).
    pub end_at: i64,
    pub name: String,
    pub description: Option<String>,
    pub extended: Option<String>,
    /// ARIB genre (large classification), if known.
    pub genre1: Option<i32>,
    pub genre2: Option<i32>,
    /// Free-to-air flag.
    pub is_free: bool,
    /// Channel display name (used in recorded-file naming).
    pub channel_name: String,
}

impl Program {
    /// Duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.end_at - self.start_at
    }

    /// True when the whole program window is already in the past.
    pub fn is_elapsed(&self, now_ms: i64) -> bool {
        self.start_at < now_ms && self.end_at < now_ms
    }
}

/// Output options attached to a reservation by a rule or a manual add.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordOption {
    /// Output directory override (relative to the configured recorded root).
    pub directory: Option<String>,
    /// File-name template override.
    pub recorded_format: Option<String>,
    /// Transcode mode indices to run after recording, in order.
    pub encode_modes: Vec<usize>,
    /// Output directory override for transcoded files.
    pub encode_directory: Option<String>,
    /// Delete the captured source once the chained encodes finish.
    pub del_ts: bool,
}

/// EPG search predicate of a recording rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSearchOption {
    /// Keyword matched against the enabled text fields.
    pub keyword: Option<String>,
    /// Case-sensitive keyword matching.
    pub key_cs: bool,
    /// Interpret `keyword` as a regular expression.
    pub key_regexp: bool,
    /// Match against the program title.
    pub title: bool,
    /// Match against the short description.
    pub description: bool,
    /// Match against the extended description.
    pub extended: bool,
    /// Restrict to these channel types (empty = any).
    pub channel_types: Vec<ChannelType>,
    /// Restrict to these station (channel) ids (empty = any).
    pub station_ids: Vec<i64>,
    /// Inclusive ARIB genre range, large classification.
    pub genre_min: Option<i32>,
    pub genre_max: Option<i32>,
    /// Time-of-day window start hour (0-23, local time).
    pub start_hour: Option<u32>,
    /// Window length in hours (1-23, wraps past midnight).
    pub hour_range: Option<u32>,
    /// Day-of-week bitmask, bit 0 = Sunday ... bit 6 = Saturday.
    /// 0 means every day.
    pub week_of_day: u8,
    /// Only free-to-air programs.
    pub is_free: bool,
    /// Minimum program duration in seconds.
    pub duration_min: Option<i64>,
    /// Maximum program duration in seconds.
    pub duration_max: Option<i64>,
}

/// A rule-based recording declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub search: RuleSearchOption,
    #[serde(default)]
    pub option: RecordOption,
    pub enabled: bool,
}

/// One entry of the reservation set, as reported over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveEntry {
    pub program: Program,
    /// Absent for manual reservations.
    pub rule_id: Option<i64>,
    pub is_skip: bool,
    pub is_conflict: bool,
}

/// An encode job handed from the recorder role to the encoder role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeJobSpec {
    pub recorded_id: i64,
    /// Source file to transcode.
    pub source: String,
    /// Output directory override.
    pub directory: Option<String>,
    /// Index into the configured transcode command list.
    pub mode: usize,
    /// Delete the source file after this job completes.
    pub del_ts: bool,
    /// Source duration in seconds (sizes the watchdog timeout).
    pub duration_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_elapsed() {
        let mut p = Program {
            id: 1,
            channel_id: 10,
            channel: "T27".to_string(),
            service_id: 1024,
            channel_type: ChannelType::Gr,
            start_at: 1_000,
            end_at: 2_000,
            name: "news".to_string(),
            description: None,
            extended: None,
            genre1: None,
            genre2: None,
            is_free: true,
            channel_name: "Ch1".to_string(),
        };

        assert!(p.is_elapsed(3_000));
        // Still on air: started but not ended.
        assert!(!p.is_elapsed(1_500));
        assert!(!p.is_elapsed(500));
        p.end_at = 4_000;
        assert!(!p.is_elapsed(3_000));
    }

    #[test]
    fn test_channel_type_serde() {
        let json = serde_json::to_string(&ChannelType::Gr).unwrap();
        assert_eq!(json, "\"GR\"");
        let back: ChannelType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ChannelType::Gr);
    }
}
