/// SQL DDL for the postcrew database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    tone TEXT NOT NULL,
    structure_prompt TEXT NOT NULL,
    example_post TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    topic TEXT NOT NULL,
    tone TEXT NOT NULL,
    target_audience TEXT NOT NULL,
    word_count_min INTEGER NOT NULL,
    word_count_max INTEGER NOT NULL,
    language TEXT NOT NULL,
    include_hashtags INTEGER NOT NULL,
    include_cta INTEGER NOT NULL,
    include_emoji INTEGER NOT NULL,
    template_id TEXT REFERENCES templates(id),
    status TEXT NOT NULL DEFAULT 'draft',
    final_post TEXT,
    groundedness_score INTEGER,
    current_report_id TEXT,
    is_favorite INTEGER NOT NULL DEFAULT 0,
    published_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_runs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_revisions INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS agent_steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES agent_runs(id),
    agent_name TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    input TEXT NOT NULL,
    output TEXT NOT NULL,
    decision TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    tokens_used INTEGER,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, step_number)
);

CREATE TABLE IF NOT EXISTS research_findings (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    run_id TEXT NOT NULL REFERENCES agent_runs(id),
    query TEXT NOT NULL,
    summary TEXT NOT NULL,
    sources TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS post_drafts (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    run_id TEXT NOT NULL REFERENCES agent_runs(id),
    version INTEGER NOT NULL,
    content TEXT NOT NULL,
    word_count INTEGER NOT NULL,
    critique_notes TEXT,
    is_approved INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, version)
);

CREATE TABLE IF NOT EXISTS groundedness_reports (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    run_id TEXT NOT NULL REFERENCES agent_runs(id),
    supported TEXT NOT NULL,
    unsupported TEXT NOT NULL,
    score INTEGER NOT NULL CHECK (score BETWEEN 0 AND 5),
    notes TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_one_running
    ON agent_runs(project_id) WHERE status = 'running';
CREATE INDEX IF NOT EXISTS idx_runs_project ON agent_runs(project_id);
CREATE INDEX IF NOT EXISTS idx_steps_run ON agent_steps(run_id, step_number);
CREATE INDEX IF NOT EXISTS idx_findings_project ON research_findings(project_id);
CREATE INDEX IF NOT EXISTS idx_findings_run ON research_findings(run_id);
CREATE INDEX IF NOT EXISTS idx_drafts_run ON post_drafts(run_id, version);
CREATE INDEX IF NOT EXISTS idx_reports_project ON groundedness_reports(project_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
