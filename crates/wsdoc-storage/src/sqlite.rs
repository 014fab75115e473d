//! SQLite storage backend

use std::collections::HashMap;
use std::path::Path;

use crate::{DocStorage, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use wsdoc_core::{DocRecord, DocUpdate, HistoryQuery};

/// SQLite storage backend
///
/// Embedded persistence suitable for single-node setups and the CLI.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|e| StorageError::Connection(e.to_string()))?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StorageError::Connection(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                workspace_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                bin BLOB NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
                PRIMARY KEY (workspace_id, doc_id)
            );

            CREATE TABLE IF NOT EXISTS updates (
                workspace_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                bin BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
                PRIMARY KEY (workspace_id, doc_id, version)
            );

            CREATE TABLE IF NOT EXISTS histories (
                workspace_id TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                bin BLOB NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
                PRIMARY KEY (workspace_id, doc_id, version)
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn to_sql_version(version: u64) -> Result<i64, StorageError> {
    i64::try_from(version)
        .map_err(|_| StorageError::Serialization(format!("version {} out of range", version)))
}

fn from_sql_version(version: i64) -> Result<u64, StorageError> {
    u64::try_from(version)
        .map_err(|_| StorageError::Serialization(format!("negative version {}", version)))
}

/// Highest version known for a document, across snapshot and pending log
fn head_version(tx: &Transaction<'_>, workspace_id: &str, doc_id: &str) -> Result<u64, StorageError> {
    let head: Option<i64> = tx
        .query_row(
            r#"
            SELECT MAX(version) FROM (
                SELECT version FROM snapshots WHERE workspace_id = ?1 AND doc_id = ?2
                UNION ALL
                SELECT version FROM updates WHERE workspace_id = ?1 AND doc_id = ?2
            )
            "#,
            params![workspace_id, doc_id],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    head.map_or(Ok(0), from_sql_version)
}

#[async_trait]
impl DocStorage for SqliteStorage {
    async fn push_doc_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
        updates: Vec<DocUpdate>,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let mut version = head_version(&tx, workspace_id, doc_id)?;
        for update in updates {
            version += 1;
            tx.execute(
                "INSERT INTO updates (workspace_id, doc_id, version, bin) VALUES (?1, ?2, ?3, ?4)",
                params![workspace_id, doc_id, to_sql_version(version)?, update.bin],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(version)
    }

    async fn delete_doc(&self, workspace_id: &str, doc_id: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let mut affected = 0;
        for table in ["snapshots", "updates", "histories"] {
            affected += tx
                .execute(
                    &format!("DELETE FROM {} WHERE workspace_id = ?1 AND doc_id = ?2", table),
                    params![workspace_id, doc_id],
                )
                .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn delete_workspace(&self, workspace_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        for table in ["snapshots", "updates", "histories"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE workspace_id = ?1", table),
                params![workspace_id],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    async fn get_doc_versions(
        &self,
        workspace_id: &str,
    ) -> Result<Option<HashMap<String, u64>>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT doc_id, MAX(version) FROM (
                    SELECT doc_id, version FROM snapshots WHERE workspace_id = ?1
                    UNION ALL
                    SELECT doc_id, version FROM updates WHERE workspace_id = ?1
                )
                GROUP BY doc_id
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![workspace_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;

        let mut versions = HashMap::new();
        for row in rows {
            let (doc_id, version) = row.map_err(db_err)?;
            versions.insert(doc_id, from_sql_version(version)?);
        }

        if versions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(versions))
        }
    }

    async fn list_doc_histories(
        &self,
        workspace_id: &str,
        doc_id: &str,
        query: HistoryQuery,
    ) -> Result<Vec<DocRecord>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT bin, version FROM histories
                WHERE workspace_id = ?1 AND doc_id = ?2
                ORDER BY version DESC
                LIMIT ?3 OFFSET ?4
                "#,
            )
            .map_err(db_err)?;

        let limit = i64::try_from(query.limit()).unwrap_or(i64::MAX);
        let skip = i64::try_from(query.skip()).unwrap_or(i64::MAX);

        let rows = stmt
            .query_map(params![workspace_id, doc_id, limit, skip], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;

        let mut histories = Vec::new();
        for row in rows {
            let (bin, version) = row.map_err(db_err)?;
            histories.push(DocRecord::new(
                workspace_id,
                doc_id,
                bin,
                from_sql_version(version)?,
            ));
        }

        Ok(histories)
    }

    async fn get_history_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> Result<Option<DocRecord>, StorageError> {
        let conn = self.conn.lock();

        let bin: Option<Vec<u8>> = conn
            .query_row(
                "SELECT bin FROM histories WHERE workspace_id = ?1 AND doc_id = ?2 AND version = ?3",
                params![workspace_id, doc_id, to_sql_version(version)?],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        Ok(bin.map(|bin| DocRecord::new(workspace_id, doc_id, bin, version)))
    }

    async fn get_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Option<DocRecord>, StorageError> {
        let conn = self.conn.lock();

        let result: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT bin, version FROM snapshots WHERE workspace_id = ?1 AND doc_id = ?2",
                params![workspace_id, doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        match result {
            Some((bin, version)) => Ok(Some(DocRecord::new(
                workspace_id,
                doc_id,
                bin,
                from_sql_version(version)?,
            ))),
            None => Ok(None),
        }
    }

    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let current: Option<(Vec<u8>, i64)> = tx
            .query_row(
                "SELECT bin, version FROM snapshots WHERE workspace_id = ?1 AND doc_id = ?2",
                params![snapshot.workspace_id, snapshot.doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        let version = to_sql_version(snapshot.version)?;

        if let Some((bin, current_version)) = current {
            if current_version >= version {
                return Ok(false);
            }

            tx.execute(
                r#"
                INSERT OR IGNORE INTO histories (workspace_id, doc_id, version, bin)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![snapshot.workspace_id, snapshot.doc_id, current_version, bin],
            )
            .map_err(db_err)?;
        }

        tx.execute(
            r#"
            INSERT INTO snapshots (workspace_id, doc_id, bin, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, strftime('%s', 'now') * 1000)
            ON CONFLICT(workspace_id, doc_id) DO UPDATE SET
                bin = excluded.bin,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
            params![snapshot.workspace_id, snapshot.doc_id, snapshot.bin, version],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    async fn restore_doc_snapshot(
        &self,
        workspace_id: &str,
        doc_id: &str,
        bin: Vec<u8>,
        expected_head: u64,
    ) -> Result<Option<u64>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let current: Option<(Vec<u8>, i64)> = tx
            .query_row(
                "SELECT bin, version FROM snapshots WHERE workspace_id = ?1 AND doc_id = ?2",
                params![workspace_id, doc_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        let Some((replaced, current_version)) = current else {
            return Ok(None);
        };
        if from_sql_version(current_version)? != expected_head
            || head_version(&tx, workspace_id, doc_id)? != expected_head
        {
            return Ok(None);
        }

        tx.execute(
            r#"
            INSERT OR IGNORE INTO histories (workspace_id, doc_id, version, bin)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![workspace_id, doc_id, current_version, replaced],
        )
        .map_err(db_err)?;

        let version = expected_head + 1;
        tx.execute(
            r#"
            UPDATE snapshots SET bin = ?3, version = ?4, updated_at = strftime('%s', 'now') * 1000
            WHERE workspace_id = ?1 AND doc_id = ?2
            "#,
            params![workspace_id, doc_id, bin, to_sql_version(version)?],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(Some(version))
    }

    async fn get_doc_pending_updates(
        &self,
        workspace_id: &str,
        doc_id: &str,
    ) -> Result<Vec<DocRecord>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT bin, version FROM updates
                WHERE workspace_id = ?1 AND doc_id = ?2
                ORDER BY version ASC
                "#,
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![workspace_id, doc_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;

        let mut updates = Vec::new();
        for row in rows {
            let (bin, version) = row.map_err(db_err)?;
            updates.push(DocRecord::new(
                workspace_id,
                doc_id,
                bin,
                from_sql_version(version)?,
            ));
        }

        Ok(updates)
    }

    async fn mark_updates_merged(
        &self,
        workspace_id: &str,
        doc_id: &str,
        version: u64,
    ) -> Result<usize, StorageError> {
        let conn = self.conn.lock();

        conn.execute(
            "DELETE FROM updates WHERE workspace_id = ?1 AND doc_id = ?2 AND version <= ?3",
            params![workspace_id, doc_id, to_sql_version(version)?],
        )
        .map_err(db_err)
    }
}
