use crate::error::StoreError;
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            hash TEXT NOT NULL,
            module TEXT NOT NULL,
            revision TEXT,
            indexed_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entities (
            key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            module TEXT NOT NULL,
            file_path TEXT NOT NULL,
            parent_key TEXT,
            owner_key TEXT,
            fingerprint TEXT,
            attributes TEXT NOT NULL DEFAULT '{}',
            enrichment TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entities_file ON entities(file_path);
        CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(owner_key);
        CREATE INDEX IF NOT EXISTS idx_entities_name_kind ON entities(name, kind);
        CREATE INDEX IF NOT EXISTS idx_entities_module ON entities(module);

        CREATE TABLE IF NOT EXISTS edges (
            id INTEGER PRIMARY KEY,
            owner_key TEXT NOT NULL,
            kind TEXT NOT NULL,
            source_key TEXT NOT NULL,
            target_key TEXT,
            target_name TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            detail TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_edges_owner ON edges(owner_key);
        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_key);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_key);
        CREATE INDEX IF NOT EXISTS idx_edges_target_name ON edges(target_name);

        CREATE TABLE IF NOT EXISTS enrichment_cache (
            fingerprint TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        COMMIT;
        ",
    )?;

    let existing: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    if existing < 2 {
        // Fingerprint the attached enrichment was produced for, so a stale
        // annotation is never re-attached after a content change.
        if !has_column(conn, "entities", "enriched_fingerprint")? {
            conn.execute(
                "ALTER TABLE entities ADD COLUMN enriched_fingerprint TEXT",
                [],
            )?;
        }
    }

    if existing < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for row in rows {
        if row? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert!(has_column(&conn, "entities", "enriched_fingerprint").unwrap());
        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }
}
