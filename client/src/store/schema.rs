//! Local database schema, applied idempotently at open.

/// Entity snapshots. Payload and retained base payload are encrypted blobs.
pub const CREATE_ENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    id TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    dirty INTEGER NOT NULL,
    deleted INTEGER NOT NULL,
    payload BLOB NOT NULL,
    base_version INTEGER,
    base_payload BLOB,
    PRIMARY KEY (entity_type, id)
)
"#;

/// Durable mutation queue. `seq` preserves enqueue order across restarts.
pub const CREATE_MUTATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload BLOB,
    base_version INTEGER NOT NULL,
    client_timestamp INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    not_before INTEGER
)
"#;

pub const CREATE_MUTATIONS_LANE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_mutations_lane
    ON mutations (entity_type, entity_id, seq)
"#;

/// Single-row table holding the pull cursor.
pub const CREATE_CURSOR: &str = r#"
CREATE TABLE IF NOT EXISTS sync_cursor (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    token TEXT NOT NULL
)
"#;

/// Conflict audit trail. Client and server snapshots are encrypted blobs.
pub const CREATE_CONFLICTS: &str = r#"
CREATE TABLE IF NOT EXISTS conflicts (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    client_version INTEGER NOT NULL,
    server_version INTEGER NOT NULL,
    client_data BLOB,
    server_data BLOB,
    detected_at INTEGER NOT NULL,
    strategy TEXT,
    resolved INTEGER NOT NULL
)
"#;

/// All statements, in application order.
pub const ALL: &[&str] = &[
    CREATE_ENTITIES,
    CREATE_MUTATIONS,
    CREATE_MUTATIONS_LANE_INDEX,
    CREATE_CURSOR,
    CREATE_CONFLICTS,
];
