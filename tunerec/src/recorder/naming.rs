//! Recorded-file naming.
//!
//! Resolves the configured template against a program's local start time
//! and identifiers, sanitizes the result for the filesystem, and picks a
//! collision-free path on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};

use tunerec_protocol::Program;

/// Default file-name template.
pub const DEFAULT_FORMAT: &str = "%YEAR%%MONTH%%DAY%%HOUR%%MIN%%SEC%_%CHNAME%_%TITLE%";

const DOW_NAMES: [&str; 7] = ["日", "月", "火", "水", "木", "金", "土"];

/// Substitute template placeholders from the program's local start time
/// and identifiers, then sanitize for the filesystem.
pub fn format_name(template: &str, program: &Program) -> String {
    let start: DateTime<Local> = Local
        .timestamp_millis_opt(program.start_at)
        .earliest()
        .unwrap_or_else(Local::now);

    let name = template
        .replace("%SHORTYEAR%", &format!("{:02}", start.year() % 100))
        .replace("%YEAR%", &format!("{:04}", start.year()))
        .replace("%MONTH%", &format!("{:02}", start.month()))
        .replace("%DAY%", &format!("{:02}", start.day()))
        .replace("%HOUR%", &format!("{:02}", start.hour()))
        .replace("%MIN%", &format!("{:02}", start.minute()))
        .replace("%SEC%", &format!("{:02}", start.second()))
        .replace(
            "%DOW%",
            DOW_NAMES[start.weekday().num_days_from_sunday() as usize],
        )
        .replace("%TYPE%", program.channel_type.name())
        .replace("%CHID%", &program.channel_id.to_string())
        .replace("%CHNAME%", &program.channel_name)
        .replace("%CH%", &program.channel)
        .replace("%SID%", &program.service_id.to_string())
        .replace("%ID%", &program.id.to_string())
        .replace("%TITLE%", &program.name);

    sanitize(&name)
}

/// Replace forward slashes with the full-width slash and strip characters
/// the common filesystems reject.
fn sanitize(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            '/' => Some('／'),
            '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => None,
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect()
}

/// Pick a path under `dir` for `name` + `extension` that does not collide
/// with an existing file, appending `(n)` before the extension until the
/// name is unique.
pub fn unique_path(dir: &Path, name: &str, extension: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{}{}", name, extension));
    let mut n = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{}({}){}", name, n, extension));
        n += 1;
    }
    candidate
}
