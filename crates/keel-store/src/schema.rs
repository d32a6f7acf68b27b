//! DDL for both backends. Timestamps are RFC 3339 text in SQLite and
//! `TIMESTAMPTZ` in PostgreSQL; metadata/content are JSON text / `JSONB`.

pub const SCHEMA_VERSION: u32 = 1;

pub const SQLITE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

pub const SQLITE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner_key TEXT NOT NULL,
    model TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    parent_session_id TEXT,
    total_turns INTEGER NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0.0,
    message_count INTEGER NOT NULL DEFAULT 0,
    working_directory TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    sequence INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (session_id, sequence)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    sequence INTEGER NOT NULL,
    label TEXT NOT NULL,
    total_turns INTEGER NOT NULL,
    total_cost REAL NOT NULL,
    message_sequence INTEGER NOT NULL,
    state_snapshot TEXT,
    created_at TEXT NOT NULL,
    invalidated_at TEXT,
    UNIQUE (session_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_sessions_owner_created ON sessions(owner_key, created_at);
CREATE INDEX IF NOT EXISTS idx_sessions_owner_status ON sessions(owner_key, status);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// PostgreSQL DDL, one statement per entry (prepared statements cannot hold
/// several commands).
pub const POSTGRES_STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        owner_key TEXT NOT NULL,
        model TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        parent_session_id TEXT,
        total_turns INTEGER NOT NULL DEFAULT 0,
        total_cost DOUBLE PRECISION NOT NULL DEFAULT 0,
        message_count INTEGER NOT NULL DEFAULT 0,
        working_directory TEXT,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        version BIGINT NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        sequence INTEGER NOT NULL,
        role TEXT NOT NULL,
        content JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (session_id, sequence)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS checkpoints (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        sequence INTEGER NOT NULL,
        label TEXT NOT NULL,
        total_turns INTEGER NOT NULL,
        total_cost DOUBLE PRECISION NOT NULL,
        message_sequence INTEGER NOT NULL,
        state_snapshot TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        invalidated_at TIMESTAMPTZ,
        UNIQUE (session_id, sequence)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_owner_created ON sessions(owner_key, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_owner_status ON sessions(owner_key, status)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id)",
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
];

pub const SESSION_COLUMNS: &str = "id, owner_key, model, status, parent_session_id, total_turns, total_cost, \
     message_count, working_directory, metadata, version, created_at, updated_at";

pub const MESSAGE_COLUMNS: &str = "id, session_id, sequence, role, content, created_at";

pub const CHECKPOINT_COLUMNS: &str = "id, session_id, sequence, label, total_turns, total_cost, \
     message_sequence, state_snapshot, created_at, invalidated_at";
