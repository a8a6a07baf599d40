//! SQLite schema definition

/// SQL schema for the catalog database
pub const SCHEMA_SQL: &str = r#"
-- Objects: knowledge bases, models, agents and views, stored as their CREATE statement
CREATE TABLE IF NOT EXISTS objects (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    definition_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Jobs: stored statements plus schedule
CREATE TABLE IF NOT EXISTS jobs (
    name TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    next_run_at TEXT NOT NULL,
    last_run_at TEXT,
    run_count INTEGER NOT NULL DEFAULT 0
);

-- Job runs: history, one row per attempted run
CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL REFERENCES jobs(name),
    started_at TEXT NOT NULL,
    completed_at TEXT,
    status TEXT NOT NULL,
    rows_processed INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    watermarks_json TEXT
);

-- Watermarks: last processed value per job and LAST column
CREATE TABLE IF NOT EXISTS watermarks (
    job_name TEXT NOT NULL REFERENCES jobs(name),
    column_key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (job_name, column_key)
);

CREATE INDEX IF NOT EXISTS idx_objects_kind ON objects(kind);
CREATE INDEX IF NOT EXISTS idx_runs_job ON job_runs(job_name, started_at);
"#;
