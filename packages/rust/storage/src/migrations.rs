//! SQL migration definitions for the lexiforge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: records, changes, change_cursor",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Keyed JSON documents, one logical table per `tbl`
CREATE TABLE IF NOT EXISTS records (
    tbl         TEXT NOT NULL,
    pk          TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (tbl, pk)
);

-- Captured writes, in commit order
CREATE TABLE IF NOT EXISTS changes (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    tbl         TEXT NOT NULL,
    event_name  TEXT NOT NULL,
    keys        TEXT NOT NULL,
    old_image   TEXT,
    new_image   TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_changes_tbl ON changes(tbl, seq);

-- Highest acknowledged change per consumer
CREATE TABLE IF NOT EXISTS change_cursor (
    consumer    TEXT PRIMARY KEY,
    seq         INTEGER NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
