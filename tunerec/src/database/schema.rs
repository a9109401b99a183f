//! Database schema definitions.

/// SQL schema for the recording database.
pub const SCHEMA_SQL: &str = r#"
-- Recorded programs table
-- A row is inserted the moment a capture session starts (recording = 1)
-- and updated with refreshed metadata when the session ends.
CREATE TABLE IF NOT EXISTS recorded (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    program_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    channel_type TEXT NOT NULL,          -- GR/BS/CS/SKY
    start_at INTEGER NOT NULL,           -- ms epoch
    end_at INTEGER NOT NULL,             -- ms epoch
    name TEXT NOT NULL,
    description TEXT,
    extended TEXT,
    genre1 INTEGER,
    genre2 INTEGER,
    rule_id INTEGER,                     -- NULL for manual reservations
    -- Capture output
    rec_path TEXT NOT NULL,              -- captured TS file
    filesize INTEGER,                    -- bytes, filled on finish
    -- State
    recording INTEGER NOT NULL DEFAULT 1,
    -- Metadata
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Additional output files produced by the encode pipeline
CREATE TABLE IF NOT EXISTS encoded (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    FOREIGN KEY(recorded_id) REFERENCES recorded(id) ON DELETE CASCADE
);

-- Recording rules
-- The search predicate and output options are stored as JSON documents;
-- they are opaque to SQL and always evaluated in code.
CREATE TABLE IF NOT EXISTS rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    search TEXT NOT NULL,                -- RuleSearchOption JSON
    option TEXT NOT NULL,                -- RecordOption JSON
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- EPG snapshot backing the program store contract
CREATE TABLE IF NOT EXISTS programs (
    id INTEGER PRIMARY KEY,
    channel_id INTEGER NOT NULL,
    channel TEXT NOT NULL,               -- physical multiplex identifier
    service_id INTEGER NOT NULL,
    channel_type TEXT NOT NULL,
    start_at INTEGER NOT NULL,
    end_at INTEGER NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    extended TEXT,
    genre1 INTEGER,
    genre2 INTEGER,
    is_free INTEGER NOT NULL DEFAULT 1,
    channel_name TEXT NOT NULL,
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Indexes for efficient queries
CREATE INDEX IF NOT EXISTS idx_recorded_program ON recorded(program_id);
CREATE INDEX IF NOT EXISTS idx_recorded_recording ON recorded(recording);
CREATE INDEX IF NOT EXISTS idx_encoded_recorded ON encoded(recorded_id);
CREATE INDEX IF NOT EXISTS idx_rules_enabled ON rules(enabled);
CREATE INDEX IF NOT EXISTS idx_programs_start ON programs(start_at);
CREATE INDEX IF NOT EXISTS idx_programs_channel ON programs(channel_id);

-- Trigger to update updated_at on recorded
CREATE TRIGGER IF NOT EXISTS recorded_updated_at
AFTER UPDATE ON recorded
BEGIN
    UPDATE recorded SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;

-- Trigger to update updated_at on rules
CREATE TRIGGER IF NOT EXISTS rules_updated_at
AFTER UPDATE ON rules
BEGIN
    UPDATE rules SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;
"#;
