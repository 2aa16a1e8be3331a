//! Database migrations for Limbic

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Initial schema (v1): engrams, tags, embeddings
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS engrams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'fact',
            importance REAL NOT NULL DEFAULT 0.5,
            original_importance REAL NOT NULL DEFAULT 0.5,
            decay_rate REAL NOT NULL DEFAULT 0.005,
            access_count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            inserted_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            protected INTEGER NOT NULL DEFAULT 0,
            thread_id TEXT,
            project_id TEXT NOT NULL DEFAULT 'global',
            superseded_at TEXT,
            content_hash TEXT,
            has_embedding INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_engrams_category ON engrams(category);
        CREATE INDEX IF NOT EXISTS idx_engrams_project ON engrams(project_id);
        CREATE INDEX IF NOT EXISTS idx_engrams_inserted ON engrams(inserted_at);
        CREATE INDEX IF NOT EXISTS idx_engrams_hash ON engrams(content_hash);

        -- Tags (normalized)
        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE
        );

        CREATE TABLE IF NOT EXISTS engram_tags (
            engram_id INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            PRIMARY KEY (engram_id, tag_id),
            FOREIGN KEY (engram_id) REFERENCES engrams(id) ON DELETE CASCADE,
            FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
        );

        -- Float embeddings, little-endian f32 BLOB
        CREATE TABLE IF NOT EXISTS embeddings (
            engram_id INTEGER PRIMARY KEY,
            embedding BLOB NOT NULL,
            dimensions INTEGER NOT NULL,
            model TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (engram_id) REFERENCES engrams(id) ON DELETE CASCADE
        );
        "#,
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    Ok(())
}

/// Full-text index (v2)
///
/// FTS5 may be absent from the linked SQLite; lexical search falls back
/// to a substring scan in that case, so a failure here is non-fatal.
fn migrate_v2(conn: &Connection) -> Result<()> {
    let fts = conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS engrams_fts USING fts5(
            content,
            content='engrams',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS engrams_fts_insert AFTER INSERT ON engrams BEGIN
            INSERT INTO engrams_fts(rowid, content) VALUES (new.id, new.content);
        END;

        CREATE TRIGGER IF NOT EXISTS engrams_fts_delete AFTER DELETE ON engrams BEGIN
            INSERT INTO engrams_fts(engrams_fts, rowid, content) VALUES ('delete', old.id, old.content);
        END;

        CREATE TRIGGER IF NOT EXISTS engrams_fts_update AFTER UPDATE OF content ON engrams BEGIN
            INSERT INTO engrams_fts(engrams_fts, rowid, content) VALUES ('delete', old.id, old.content);
            INSERT INTO engrams_fts(rowid, content) VALUES (new.id, new.content);
        END;
        "#,
    );

    if let Err(e) = fts {
        tracing::warn!("FTS5 unavailable, lexical search will use substring fallback: {}", e);
    }

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}

/// True iff the FTS5 index exists in this database
pub fn fts_available(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'engrams_fts'",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .unwrap_or(false)
}
