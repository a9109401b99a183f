//! EPG access contract and rule predicate matching.
//!
//! The EPG itself is an external collaborator; this module defines the
//! read-only contract the core needs (lookup by id, rule search) and the
//! predicate logic a store implementation applies when searching.

use async_trait::async_trait;
use chrono::{Datelike, Local, TimeZone, Timelike};
use log::warn;
use thiserror::Error;

use tunerec_protocol::{Program, RuleSearchOption};

/// EPG access errors.
#[derive(Debug, Error)]
pub enum EpgError {
    #[error("EPG store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid rule pattern: {0}")]
    InvalidPattern(String),
}

/// Read-only program guide access.
#[async_trait]
pub trait EpgStore: Send + Sync {
    /// Look up a program by id. Returns `None` when the EPG no longer
    /// carries it (expired or corrected away).
    async fn find_program(&self, program_id: i64) -> Result<Option<Program>, EpgError>;

    /// Search programs matching a rule predicate, ordered by start time.
    async fn search(&self, option: &RuleSearchOption) -> Result<Vec<Program>, EpgError>;
}

/// Check a search predicate for constructs that can never match, before
/// it is persisted as a rule.
pub fn validate(option: &RuleSearchOption) -> Result<(), EpgError> {
    if option.key_regexp {
        if let Some(keyword) = option.keyword.as_deref() {
            if let Err(e) = regex::Regex::new(keyword) {
                return Err(EpgError::InvalidPattern(e.to_string()));
            }
        }
    }
    Ok(())
}

/// Evaluate a rule search predicate against one program.
///
/// This is the reference matching logic; a database-backed store may push
/// parts of it into SQL but must agree with this function.
pub fn matches(option: &RuleSearchOption, program: &Program) -> bool {
    if !option.channel_types.is_empty() && !option.channel_types.contains(&program.channel_type) {
        return false;
    }

    if !option.station_ids.is_empty() && !option.station_ids.contains(&program.channel_id) {
        return false;
    }

    if option.is_free && !program.is_free {
        return false;
    }

    if let Some(g) = program.genre1 {
        if let Some(min) = option.genre_min {
            if g < min {
                return false;
            }
        }
        if let Some(max) = option.genre_max {
            if g > max {
                return false;
            }
        }
    } else if option.genre_min.is_some() || option.genre_max.is_some() {
        // Genre filter set but the program carries no genre.
        return false;
    }

    let duration_secs = program.duration_ms() / 1000;
    if let Some(min) = option.duration_min {
        if duration_secs < min {
            return false;
        }
    }
    if let Some(max) = option.duration_max {
        if duration_secs > max {
            return false;
        }
    }

    if !matches_time_window(option, program.start_at) {
        return false;
    }

    matches_keyword(option, program)
}

/// Day-of-week bitmask and time-of-day window, evaluated in local time.
fn matches_time_window(option: &RuleSearchOption, start_at_ms: i64) -> bool {
    let Some(start) = Local.timestamp_millis_opt(start_at_ms).single() else {
        return false;
    };

    if option.week_of_day != 0 {
        // bit 0 = Sunday ... bit 6 = Saturday
        let bit = start.weekday().num_days_from_sunday();
        if option.week_of_day & (1 << bit) == 0 {
            return false;
        }
    }

    if let Some(window_start) = option.start_hour {
        let range = option.hour_range.unwrap_or(1).clamp(1, 24);
        let hour = start.hour();
        let end = window_start + range;
        let in_window = if end <= 24 {
            hour >= window_start && hour < end
        } else {
            // Wraps past midnight, e.g. 23:00 for 3 hours = 23,0,1.
            hour >= window_start || hour < end - 24
        };
        if !in_window {
            return false;
        }
    }

    true
}

fn matches_keyword(option: &RuleSearchOption, program: &Program) -> bool {
    let Some(keyword) = option.keyword.as_deref() else {
        return true;
    };
    if keyword.is_empty() {
        return true;
    }

    let mut fields: Vec<&str> = Vec::with_capacity(3);
    if option.title {
        fields.push(program.name.as_str());
    }
    if option.description {
        if let Some(d) = program.description.as_deref() {
            fields.push(d);
        }
    }
    if option.extended {
        if let Some(e) = program.extended.as_deref() {
            fields.push(e);
        }
    }
    // A keyword with no enabled text field can never match.
    if fields.is_empty() {
        return false;
    }

    if option.key_regexp {
        let pattern = if option.key_cs {
            keyword.to_string()
        } else {
            format!("(?i){}", keyword)
        };
        match regex::Regex::new(&pattern) {
            Ok(re) => fields.iter().any(|f| re.is_match(f)),
            Err(e) => {
                warn!("Invalid rule regexp '{}': {}", keyword, e);
                false
            }
        }
    } else if option.key_cs {
        fields.iter().any(|f| f.contains(keyword))
    } else {
        let needle = keyword.to_lowercase();
        fields.iter().any(|f| f.to_lowercase().contains(&needle))
    }
}
