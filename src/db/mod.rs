use crate::config::Config;
use crate::enrich::{EnrichmentCache, SemanticAnnotation};
use crate::error::StoreError;
use crate::model::{
    EdgeKind, EdgeRecord, EntityKind, EntityRecord, FileRecord, GraphStats, StoredEdge,
    StoredEntity,
};
use crate::util;
use anyhow::{Context, Result};
use blake3::Hasher;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params, params_from_iter};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

mod migrations;

pub use migrations::SCHEMA_VERSION;

/// The only component that mutates the persistent graph.
///
/// Every write is one transaction: an entity, its owned children and its
/// outgoing edges are replaced together.
pub trait GraphStore: Send + Sync {
    /// Create or replace an entity by key. Owned children and outgoing edges
    /// (semantic edges included) are replaced; any attached enrichment is
    /// cleared.
    fn upsert_entity(&self, record: &EntityRecord) -> Result<(), StoreError>;

    /// Delete an entity with its children and outgoing edges. Incoming edges
    /// become unresolved. Returns whether the key existed.
    fn delete_entity(&self, key: &str) -> Result<bool, StoreError>;

    fn find_by_key(&self, key: &str) -> Result<Option<StoredEntity>, StoreError>;

    fn query_structural(&self, query: &StructuralQuery) -> Result<Vec<StoredEntity>, StoreError>;

    /// Attach an annotation if the stored fingerprint still equals
    /// `fingerprint`. Returns whether it was attached.
    fn attach_enrichment(
        &self,
        key: &str,
        fingerprint: &str,
        annotation: &SemanticAnnotation,
    ) -> Result<bool, StoreError>;

    fn edges_from(&self, key: &str) -> Result<Vec<StoredEdge>, StoreError>;

    fn edges_to(&self, key: &str) -> Result<Vec<StoredEdge>, StoreError>;

    fn record_file(&self, file: &FileRecord) -> Result<(), StoreError>;

    fn get_file(&self, path: &str) -> Result<Option<FileRecord>, StoreError>;

    fn remove_file(&self, path: &str) -> Result<(), StoreError>;

    fn list_files(&self) -> Result<Vec<FileRecord>, StoreError>;

    /// Repair edge targets after reconciliation: dangling targets become
    /// unresolved, unresolved names that now match a key (or a globally
    /// unique module-level class or function) are linked. Returns the number
    /// of edges changed.
    fn relink_edges(&self) -> Result<usize, StoreError>;

    /// Wipe the graph. The enrichment cache is kept.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Filter for structural queries; unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct StructuralQuery {
    pub kinds: Vec<EntityKind>,
    pub file_path: Option<String>,
    pub module: Option<String>,
    pub name: Option<String>,
    pub key_prefix: Option<String>,
    pub owner_key: Option<String>,
    pub tracked_only: bool,
    pub limit: Option<usize>,
}

impl StructuralQuery {
    pub fn file(path: &str) -> Self {
        Self {
            file_path: Some(path.to_string()),
            ..Self::default()
        }
    }

    pub fn tracked(mut self) -> Self {
        self.tracked_only = true;
        self
    }

    pub fn kinds(mut self, kinds: &[EntityKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }
}

#[derive(Debug)]
struct ConnectionCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        Ok(())
    }

    fn on_release(&self, _conn: Connection) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDigest {
    pub rows: usize,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbDigest {
    pub files: TableDigest,
    pub entities: TableDigest,
    pub edges: TableDigest,
}

const ENTITY_COLUMNS: &str = "key, kind, name, module, file_path, parent_key, owner_key, \
                              fingerprint, attributes, enrichment, enriched_fingerprint";

const EDGE_COLUMNS: &str =
    "id, kind, owner_key, source_key, target_key, target_name, position, detail";

const STRUCTURAL_EDGE_KINDS: &str = "('IMPORTS','CALLS','INHERITS_FROM','DECORATED_BY')";

pub struct Db {
    db_path: PathBuf,
    write_conn: Arc<Mutex<Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
}

impl Db {
    pub fn new(db_path: &Path) -> Result<Self> {
        util::ensure_parent_dir(db_path)?;

        let config = Config::get();
        tracing::debug!(
            "initializing connection pool (size: {}, min_idle: {})",
            config.pool_size,
            config.pool_min_idle
        );

        // Open write connection first and run migrations
        let write_conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db at {}", db_path.display()))?;
        write_conn.busy_timeout(Duration::from_secs(30))?;
        write_conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&write_conn).context("migrate schema")?;

        let write_conn = Arc::new(Mutex::new(write_conn));

        let manager = SqliteConnectionManager::file(db_path);
        let read_pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(config.pool_min_idle.min(config.pool_size)))
            .connection_timeout(Duration::from_secs(30))
            .connection_customizer(Box::new(ConnectionCustomizer))
            .build(manager)
            .with_context(|| "create connection pool")?;

        Ok(Self {
            db_path: db_path.to_path_buf(),
            write_conn,
            read_pool,
        })
    }

    /// Get the database file path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn read_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.read_pool.get()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.write_conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn graph_stats(&self) -> Result<GraphStats, StoreError> {
        let conn = self.read_conn()?;
        let files: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;

        let mut entities = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM entities GROUP BY kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            entities.insert(kind, count as usize);
        }

        let mut edges = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM edges GROUP BY kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            edges.insert(kind, count as usize);
        }

        let unresolved: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM edges WHERE target_key IS NULL AND kind IN {STRUCTURAL_EDGE_KINDS}"
            ),
            [],
            |row| row.get(0),
        )?;
        let enriched: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE enrichment IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let enrichable: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE kind IN ('class','function','method')",
            [],
            |row| row.get(0),
        )?;
        let cache_entries: i64 =
            conn.query_row("SELECT COUNT(*) FROM enrichment_cache", [], |row| row.get(0))?;

        let mut warnings = Vec::new();
        if enrichable > 0 && enriched == 0 {
            warnings.push("no entity carries an enrichment annotation".to_string());
        }

        Ok(GraphStats {
            files: files as usize,
            entities,
            edges,
            unresolved_edges: unresolved as usize,
            enriched: enriched as usize,
            enrichable: enrichable as usize,
            cache_entries: cache_entries as usize,
            warnings,
        })
    }

    /// Order-independent digest of the graph tables, used to compare two
    /// indexing runs.
    pub fn digest(&self) -> Result<DbDigest, StoreError> {
        Ok(DbDigest {
            files: self.digest_query("SELECT path, hash, module FROM files ORDER BY path", 3)?,
            entities: self.digest_query(
                "SELECT key, kind, name, module, file_path, parent_key, owner_key, fingerprint,
                        attributes, enrichment
                 FROM entities ORDER BY key",
                10,
            )?,
            edges: self.digest_query(
                "SELECT owner_key, kind, source_key, target_key, target_name, position, detail
                 FROM edges
                 ORDER BY owner_key, kind, position, source_key, target_name",
                7,
            )?,
        })
    }

    fn digest_query(&self, sql: &str, columns: usize) -> Result<TableDigest, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let mut values = Vec::with_capacity(columns);
            for idx in 0..columns {
                let value: Option<String> = match row.get_ref(idx)? {
                    rusqlite::types::ValueRef::Null => None,
                    rusqlite::types::ValueRef::Integer(v) => Some(v.to_string()),
                    rusqlite::types::ValueRef::Real(v) => Some(v.to_string()),
                    rusqlite::types::ValueRef::Text(v) | rusqlite::types::ValueRef::Blob(v) => {
                        Some(String::from_utf8_lossy(v).to_string())
                    }
                };
                values.push(value);
            }
            Ok(json!(values).to_string())
        })?;
        let mut hasher = Hasher::new();
        let mut count = 0;
        for row in rows {
            hasher.update(row?.as_bytes());
            hasher.update(b"\n");
            count += 1;
        }
        Ok(TableDigest {
            rows: count,
            hash: hasher.finalize().to_hex().to_string(),
        })
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .read_conn()?
            .query_row(
                "SELECT value FROM meta WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn edges_where(&self, column: &str, key: &str) -> Result<Vec<StoredEdge>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges WHERE {column} = ? ORDER BY kind, position, id"
        ))?;
        let rows = stmt.query_map(params![key], raw_edge)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_edge()?);
        }
        Ok(out)
    }
}

impl GraphStore for Db {
    fn upsert_entity(&self, record: &EntityRecord) -> Result<(), StoreError> {
        let now = util::now_epoch_secs();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM edges WHERE owner_key = ?", params![record.key])?;
        tx.execute(
            "DELETE FROM edges WHERE owner_key IN (SELECT key FROM entities WHERE owner_key = ?)",
            params![record.key],
        )?;
        tx.execute("DELETE FROM entities WHERE owner_key = ?", params![record.key])?;
        write_entity(&tx, record, None, now)?;
        for child in &record.children {
            write_entity(&tx, child, Some(&record.key), now)?;
            write_edges(&tx, &child.key, &child.edges)?;
        }
        write_edges(&tx, &record.key, &record.edges)?;
        tx.commit()?;
        Ok(())
    }

    fn delete_entity(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM edges WHERE owner_key = ?
                OR owner_key IN (SELECT key FROM entities WHERE owner_key = ?)",
            params![key, key],
        )?;
        tx.execute("DELETE FROM entities WHERE owner_key = ?", params![key])?;
        let deleted = tx.execute("DELETE FROM entities WHERE key = ?", params![key])?;
        tx.execute(
            "UPDATE edges SET target_key = NULL WHERE target_key = ?",
            params![key],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    fn find_by_key(&self, key: &str) -> Result<Option<StoredEntity>, StoreError> {
        let conn = self.read_conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE key = ?"),
                params![key],
                raw_entity,
            )
            .optional()?;
        raw.map(RawEntity::into_entity).transpose()
    }

    fn query_structural(&self, query: &StructuralQuery) -> Result<Vec<StoredEntity>, StoreError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();

        let mut kinds: Vec<EntityKind> = query.kinds.clone();
        if query.tracked_only {
            if kinds.is_empty() {
                kinds = EntityKind::tracked().to_vec();
            } else {
                kinds.retain(|kind| kind.is_tracked());
            }
        }
        if !kinds.is_empty() {
            let marks = vec!["?"; kinds.len()].join(", ");
            clauses.push(format!("kind IN ({marks})"));
            values.extend(kinds.iter().map(|kind| kind.as_str().to_string()));
        }
        if let Some(path) = &query.file_path {
            clauses.push("file_path = ?".to_string());
            values.push(path.clone());
        }
        if let Some(module) = &query.module {
            clauses.push("module = ?".to_string());
            values.push(module.clone());
        }
        if let Some(name) = &query.name {
            clauses.push("name = ?".to_string());
            values.push(name.clone());
        }
        if let Some(prefix) = &query.key_prefix {
            clauses.push("substr(key, 1, ?) = ?".to_string());
            values.push(prefix.len().to_string());
            values.push(prefix.clone());
        }
        if let Some(owner) = &query.owner_key {
            clauses.push("owner_key = ?".to_string());
            values.push(owner.clone());
        }

        let mut sql = format!("SELECT {ENTITY_COLUMNS} FROM entities");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY key");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), raw_entity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_entity()?);
        }
        Ok(out)
    }

    fn attach_enrichment(
        &self,
        key: &str,
        fingerprint: &str,
        annotation: &SemanticAnnotation,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(annotation)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE entities SET enrichment = ?, enriched_fingerprint = ?
             WHERE key = ? AND fingerprint = ?",
            params![payload, fingerprint, key, fingerprint],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        {
            let mut delete = tx.prepare_cached(
                "DELETE FROM edges WHERE owner_key = ? AND kind = ?",
            )?;
            for kind in EdgeKind::semantic() {
                delete.execute(params![key, kind.as_str()])?;
            }
        }
        write_edges(&tx, key, &annotation.semantic_edges(key))?;
        tx.commit()?;
        Ok(true)
    }

    fn edges_from(&self, key: &str) -> Result<Vec<StoredEdge>, StoreError> {
        self.edges_where("source_key", key)
    }

    fn edges_to(&self, key: &str) -> Result<Vec<StoredEdge>, StoreError> {
        self.edges_where("target_key", key)
    }

    fn record_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO files (path, hash, module, revision, indexed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                module = excluded.module,
                revision = excluded.revision,
                indexed_at = excluded.indexed_at",
            params![
                file.path,
                file.hash,
                file.module,
                file.revision,
                file.indexed_at
            ],
        )?;
        Ok(())
    }

    fn get_file(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self
            .read_conn()?
            .query_row(
                "SELECT path, hash, module, revision, indexed_at FROM files WHERE path = ?",
                params![path],
                file_row,
            )
            .optional()?)
    }

    fn remove_file(&self, path: &str) -> Result<(), StoreError> {
        self.conn()?
            .execute("DELETE FROM files WHERE path = ?", params![path])?;
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        let conn = self.read_conn()?;
        let mut stmt = conn.prepare(
            "SELECT path, hash, module, revision, indexed_at FROM files ORDER BY path",
        )?;
        let rows = stmt.query_map([], file_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn relink_edges(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = tx.execute(
            &format!(
                "UPDATE edges SET target_key = NULL
                 WHERE target_key IS NOT NULL
                   AND kind IN {STRUCTURAL_EDGE_KINDS}
                   AND target_key NOT IN (SELECT key FROM entities)"
            ),
            [],
        )?;
        changed += tx.execute(
            "UPDATE edges SET target_key = target_name
             WHERE kind = 'IMPORTS' AND target_key IS NULL
               AND target_name IN (SELECT key FROM entities WHERE kind = 'module')",
            [],
        )?;
        changed += tx.execute(
            "UPDATE edges SET target_key = target_name
             WHERE kind = 'CALLS' AND target_key IS NULL
               AND target_name NOT LIKE 'self.%' AND target_name NOT LIKE 'cls.%'
               AND target_name IN (
                   SELECT key FROM entities WHERE kind IN ('class','function','method'))",
            [],
        )?;
        changed += tx.execute(
            "UPDATE edges SET target_key = target_name
             WHERE kind = 'INHERITS_FROM' AND target_key IS NULL
               AND target_name IN (SELECT key FROM entities WHERE kind = 'class')",
            [],
        )?;
        for (edge_kind, entity_kinds) in [
            ("CALLS", "('class','function')"),
            ("INHERITS_FROM", "('class')"),
        ] {
            changed += tx.execute(
                &format!(
                    "UPDATE edges SET target_key = (
                         SELECT e.key FROM entities e
                         WHERE e.name = edges.target_name
                           AND e.kind IN {entity_kinds}
                           AND e.parent_key = e.module)
                     WHERE kind = ?1 AND target_key IS NULL
                       AND instr(target_name, '.') = 0
                       AND (SELECT COUNT(*) FROM entities e
                            WHERE e.name = edges.target_name
                              AND e.kind IN {entity_kinds}
                              AND e.parent_key = e.module) = 1"
                ),
                params![edge_kind],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "
            BEGIN;
            DELETE FROM edges;
            DELETE FROM entities;
            DELETE FROM files;
            COMMIT;
            ",
        )?;
        Ok(())
    }
}

impl EnrichmentCache for Db {
    fn get(&self, fingerprint: &str) -> Result<Option<SemanticAnnotation>, StoreError> {
        let payload: Option<String> = self
            .read_conn()?
            .query_row(
                "SELECT payload FROM enrichment_cache WHERE fingerprint = ?",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    fn put(&self, fingerprint: &str, annotation: &SemanticAnnotation) -> Result<(), StoreError> {
        let payload = serde_json::to_string(annotation)?;
        self.conn()?.execute(
            "INSERT INTO enrichment_cache (fingerprint, payload, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(fingerprint) DO NOTHING",
            params![fingerprint, payload, util::now_epoch_secs()],
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.conn()?.execute("DELETE FROM enrichment_cache", [])?)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self.read_conn()?.query_row(
            "SELECT COUNT(*) FROM enrichment_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn write_entity(
    tx: &Transaction<'_>,
    record: &EntityRecord,
    owner_key: Option<&str>,
    now: i64,
) -> Result<(), StoreError> {
    let attributes = serde_json::to_string(&record.attributes)?;
    // Owned rows never displace a tracked entity that holds the same key.
    let conflict = if owner_key.is_some() {
        "DO NOTHING"
    } else {
        "DO UPDATE SET
            kind = excluded.kind,
            name = excluded.name,
            module = excluded.module,
            file_path = excluded.file_path,
            parent_key = excluded.parent_key,
            owner_key = excluded.owner_key,
            fingerprint = excluded.fingerprint,
            attributes = excluded.attributes,
            enrichment = NULL,
            enriched_fingerprint = NULL,
            updated_at = excluded.updated_at"
    };
    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO entities (key, kind, name, module, file_path, parent_key, owner_key,
                               fingerprint, attributes, enrichment, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
         ON CONFLICT(key) {conflict}"
    ))?;
    stmt.execute(params![
        record.key,
        record.kind.as_str(),
        record.name,
        record.module,
        record.file_path,
        record.parent_key,
        owner_key,
        record.fingerprint,
        attributes,
        now
    ])?;
    Ok(())
}

fn write_edges(tx: &Transaction<'_>, owner_key: &str, edges: &[EdgeRecord]) -> Result<(), StoreError> {
    if edges.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached(
        "INSERT INTO edges (owner_key, kind, source_key, target_key, target_name, position, detail)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )?;
    for edge in edges {
        let detail = match &edge.detail {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        stmt.execute(params![
            owner_key,
            edge.kind.as_str(),
            edge.source_key,
            edge.target.resolved_key(),
            edge.target_name,
            edge.position,
            detail
        ])?;
    }
    Ok(())
}

struct RawEntity {
    key: String,
    kind: String,
    name: String,
    module: String,
    file_path: String,
    parent_key: Option<String>,
    owner_key: Option<String>,
    fingerprint: Option<String>,
    attributes: String,
    enrichment: Option<String>,
    enriched_fingerprint: Option<String>,
}

impl RawEntity {
    fn into_entity(self) -> Result<StoredEntity, StoreError> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Invalid(format!("entity kind `{}`", self.kind)))?;
        let attributes: Value = serde_json::from_str(&self.attributes)?;
        let enrichment = match self.enrichment {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(StoredEntity {
            key: self.key,
            kind,
            name: self.name,
            module: self.module,
            file_path: self.file_path,
            parent_key: self.parent_key,
            owner_key: self.owner_key,
            fingerprint: self.fingerprint,
            attributes,
            enrichment,
            enriched_fingerprint: self.enriched_fingerprint,
        })
    }
}

fn raw_entity(row: &Row<'_>) -> rusqlite::Result<RawEntity> {
    Ok(RawEntity {
        key: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        module: row.get(3)?,
        file_path: row.get(4)?,
        parent_key: row.get(5)?,
        owner_key: row.get(6)?,
        fingerprint: row.get(7)?,
        attributes: row.get(8)?,
        enrichment: row.get(9)?,
        enriched_fingerprint: row.get(10)?,
    })
}

struct RawEdge {
    id: i64,
    kind: String,
    owner_key: String,
    source_key: String,
    target_key: Option<String>,
    target_name: String,
    position: i64,
    detail: Option<String>,
}

impl RawEdge {
    fn into_edge(self) -> Result<StoredEdge, StoreError> {
        let kind = EdgeKind::parse(&self.kind)
            .ok_or_else(|| StoreError::Invalid(format!("edge kind `{}`", self.kind)))?;
        let detail = match self.detail {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(StoredEdge {
            id: self.id,
            kind,
            owner_key: self.owner_key,
            source_key: self.source_key,
            target_key: self.target_key,
            target_name: self.target_name,
            position: self.position,
            detail,
        })
    }
}

fn raw_edge(row: &Row<'_>) -> rusqlite::Result<RawEdge> {
    Ok(RawEdge {
        id: row.get(0)?,
        kind: row.get(1)?,
        owner_key: row.get(2)?,
        source_key: row.get(3)?,
        target_key: row.get(4)?,
        target_name: row.get(5)?,
        position: row.get(6)?,
        detail: row.get(7)?,
    })
}

fn file_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        path: row.get(0)?,
        hash: row.get(1)?,
        module: row.get(2)?,
        revision: row.get(3)?,
        indexed_at: row.get(4)?,
    })
}
