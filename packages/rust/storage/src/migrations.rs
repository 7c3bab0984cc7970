//! SQL migration definitions for the councilgen cache database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

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
        description: "Initial schema: enrichment_cache with expiry",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Namespaced enrichment records. expires_at is unix milliseconds.
CREATE TABLE IF NOT EXISTS enrichment_cache (
    cache_key  TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    cached_at  TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrichment_cache_expires ON enrichment_cache(expires_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
