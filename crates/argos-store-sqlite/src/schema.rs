//! SQL schema for the Argos SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

-- Events are strictly append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS events (
    event_id       TEXT PRIMARY KEY,
    stream_id      TEXT NOT NULL,   -- 'kind/id'
    version        INTEGER NOT NULL,
    event_type     TEXT NOT NULL,   -- discriminant of EventPayload variant
    payload_json   TEXT NOT NULL,   -- JSON payload (inner data only)
    recorded_at    TEXT NOT NULL,   -- ISO 8601 UTC; fixed by the proposer
    correlation_id TEXT NOT NULL,
    causation_id   TEXT,
    actor          TEXT,
    UNIQUE (stream_id, version)
);

-- At most one snapshot per stream; replaced wholesale.
CREATE TABLE IF NOT EXISTS snapshots (
    stream_id  TEXT PRIMARY KEY,
    version    INTEGER NOT NULL,
    state_json TEXT NOT NULL,
    taken_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS raft_state (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    current_term INTEGER NOT NULL,
    voted_for    INTEGER
);

CREATE TABLE IF NOT EXISTS raft_log (
    log_index    INTEGER PRIMARY KEY,
    term         INTEGER NOT NULL,
    payload_json TEXT NOT NULL,   -- JSON-encoded EntryPayload
    checksum     TEXT NOT NULL    -- hex sha-256 of index, term and payload
);

CREATE INDEX IF NOT EXISTS events_stream_idx ON events(stream_id, version);
CREATE INDEX IF NOT EXISTS events_type_idx   ON events(event_type);

PRAGMA user_version = 1;
";
