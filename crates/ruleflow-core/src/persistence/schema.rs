//! The seven tables named in §6, plus the two seed rows of the role table.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wom_execution (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wom_rule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_name TEXT NOT NULL,
    tool_identifier TEXT NOT NULL,
    execution_id INTEGER NOT NULL REFERENCES wom_execution(id),
    started_at TEXT,
    finished_at TEXT,
    duration_ms INTEGER,
    status TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wom_file_iio (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id INTEGER NOT NULL REFERENCES wom_rule(id),
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    role TEXT NOT NULL,
    mtime_epoch_millis INTEGER,
    size INTEGER,
    used_at INTEGER
);

CREATE TABLE IF NOT EXISTS wom_table_iio (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id INTEGER NOT NULL REFERENCES wom_rule(id),
    logical_name TEXT NOT NULL,
    physical_tablename TEXT NOT NULL,
    model_identifier TEXT NOT NULL,
    role TEXT NOT NULL,
    used_at INTEGER
);

CREATE TABLE IF NOT EXISTS wom_type_input_or_output (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    is_input INTEGER NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS wom_option (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id INTEGER NOT NULL REFERENCES wom_rule(id),
    name TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wom_modification_table (
    physical_tablename TEXT PRIMARY KEY,
    modified_at INTEGER NOT NULL
);

INSERT OR IGNORE INTO wom_type_input_or_output (is_input) VALUES (1);
INSERT OR IGNORE INTO wom_type_input_or_output (is_input) VALUES (0);
"#;
