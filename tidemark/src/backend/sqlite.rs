//! SQLite backend over `rusqlite`: the reference [Backend] implementation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::backend::Backend;
use crate::error::Error;
use crate::migration::MigrationKind;
use crate::store::AppliedEntry;
use crate::version::VersionKey;

pub struct SqliteBackend {
    conn: Connection,
    label: String,
}

impl SqliteBackend {
    /// Open (or create) a database file.
    pub fn open(path: &str) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, format!("sqlite:{path}"))
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, "sqlite::memory:".to_string())
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection, label: impl Into<String>) -> Result<Self, Error> {
        // Concurrent engine instances wait on each other instead of failing
        // immediately.
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(SqliteBackend {
            conn,
            label: label.into(),
        })
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<String>, Error> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn ensure_lock_table(&mut self, lock_table: &str) -> Result<(), Error> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {lock_table} (\
                 id INTEGER PRIMARY KEY CHECK (id = 1), \
                 owner TEXT NOT NULL, \
                 lease_until TEXT NOT NULL)"
            ),
            [],
        )?;
        Ok(())
    }

    fn object_type(&mut self, name: &str) -> Result<Option<String>, Error> {
        let found = self
            .conn
            .query_row(
                "SELECT type FROM sqlite_master WHERE name = ?1",
                [name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(found)
    }
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

impl Backend for SqliteBackend {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn collection_exists(&mut self, table: &str) -> Result<bool, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
        let exists = stmt.query([table])?.next()?.is_some();
        Ok(exists)
    }

    fn create_collection(&mut self, table: &str) -> Result<(), Error> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 installed_rank INTEGER NOT NULL, \
                 version TEXT, \
                 description TEXT NOT NULL, \
                 type TEXT NOT NULL, \
                 script TEXT NOT NULL, \
                 checksum INTEGER, \
                 installed_by TEXT NOT NULL, \
                 installed_on TEXT NOT NULL, \
                 execution_time INTEGER NOT NULL, \
                 success INTEGER NOT NULL)"
            ),
            [],
        )?;
        self.conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_ir_idx ON {table} (installed_rank)"
            ),
            [],
        )?;
        Ok(())
    }

    fn has_current_layout(&mut self, table: &str) -> Result<bool, Error> {
        let columns = self.table_columns(table)?;
        Ok(["checksum", "success", "execution_time"]
            .iter()
            .all(|needed| columns.iter().any(|c| c == needed)))
    }

    fn upgrade_layout(&mut self, table: &str) -> Result<(), Error> {
        let columns = self.table_columns(table)?;
        if !columns.iter().any(|c| c == "checksum") {
            self.conn
                .execute(&format!("ALTER TABLE {table} ADD COLUMN checksum INTEGER"), [])?;
        }
        if !columns.iter().any(|c| c == "success") {
            self.conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN success INTEGER NOT NULL DEFAULT 1"),
                [],
            )?;
        }
        if !columns.iter().any(|c| c == "execution_time") {
            self.conn.execute(
                &format!(
                    "ALTER TABLE {table} ADD COLUMN execution_time INTEGER NOT NULL DEFAULT 0"
                ),
                [],
            )?;
        }
        Ok(())
    }

    fn read_entries(&mut self, table: &str) -> Result<Vec<AppliedEntry>, Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT installed_rank, version, description, type, script, checksum, \
             installed_by, installed_on, execution_time, success \
             FROM {table} ORDER BY installed_rank"
        ))?;
        let entries = stmt
            .query_map([], |row| {
                let version: Option<String> = row.get(1)?;
                let version = version
                    .map(|raw| VersionKey::parse(&raw).map_err(|e| conversion_error(1, e)))
                    .transpose()?;
                let kind: String = row.get(3)?;
                let kind = MigrationKind::parse(&kind).map_err(|e| conversion_error(3, e))?;
                let installed_on: String = row.get(7)?;
                let installed_on = DateTime::parse_from_rfc3339(&installed_on)
                    .map_err(|e| conversion_error(7, e))?
                    .with_timezone(&Utc);
                Ok(AppliedEntry {
                    install_rank: row.get(0)?,
                    version,
                    description: row.get(2)?,
                    kind,
                    script: row.get(4)?,
                    checksum: row.get(5)?,
                    installed_by: row.get(6)?,
                    installed_on,
                    execution_time_ms: row.get(8)?,
                    success: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn insert_entry(&mut self, table: &str, entry: &AppliedEntry) -> Result<(), Error> {
        self.conn.execute(
            &format!(
                "INSERT INTO {table} (installed_rank, version, description, type, script, \
                 checksum, installed_by, installed_on, execution_time, success) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                entry.install_rank,
                entry.version.as_ref().map(ToString::to_string),
                entry.description,
                entry.kind.as_str(),
                entry.script,
                entry.checksum,
                entry.installed_by,
                entry.installed_on.to_rfc3339(),
                entry.execution_time_ms,
                entry.success,
            ],
        )?;
        Ok(())
    }

    fn delete_failed_entries(&mut self, table: &str) -> Result<usize, Error> {
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE success = 0"), [])?;
        Ok(removed)
    }

    fn update_entry_checksum(
        &mut self,
        table: &str,
        install_rank: i64,
        checksum: Option<i32>,
    ) -> Result<(), Error> {
        let updated = self.conn.execute(
            &format!("UPDATE {table} SET checksum = ?1 WHERE installed_rank = ?2"),
            params![checksum, install_rank],
        )?;
        if updated == 0 {
            return Err(Error::backend(format!(
                "no metadata entry with install rank {install_rank}"
            )));
        }
        Ok(())
    }

    fn execute_script(&mut self, body: &str, atomic: bool) -> Result<(), Error> {
        if atomic {
            let tx = self.conn.transaction()?;
            tx.execute_batch(body)?;
            tx.commit()?;
        } else {
            self.conn.execute_batch(body)?;
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn is_empty(&mut self, reserved: &[String]) -> Result<bool, Error> {
        Ok(self.enumerate_schemas(reserved)?.is_empty())
    }

    fn enumerate_schemas(&mut self, reserved: &[String]) -> Result<Vec<String>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter(|name| !reserved.contains(name))
            .collect())
    }

    fn drop_schema(&mut self, name: &str) -> Result<(), Error> {
        match self.object_type(name)?.as_deref() {
            Some("view") => {
                self.conn.execute(&format!("DROP VIEW IF EXISTS {name}"), [])?;
            }
            Some(_) => {
                self.conn.execute(&format!("DROP TABLE IF EXISTS {name}"), [])?;
            }
            None => {}
        }
        Ok(())
    }

    fn try_acquire_lock(
        &mut self,
        lock_table: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, Error> {
        self.ensure_lock_table(lock_table)?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::backend(format!("unusable lock lease: {e}")))?;
        let lease_until = (now + lease).to_rfc3339();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<(String, String)> = tx
            .query_row(
                &format!("SELECT owner, lease_until FROM {lock_table} WHERE id = 1"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let acquired = match current {
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO {lock_table} (id, owner, lease_until) VALUES (1, ?1, ?2)"
                    ),
                    params![owner, lease_until],
                )?;
                true
            }
            Some((holder, until)) => {
                let expired = DateTime::parse_from_rfc3339(&until)
                    .map(|t| t.with_timezone(&Utc) <= now)
                    .unwrap_or(true);
                if holder == owner || expired {
                    tx.execute(
                        &format!(
                            "UPDATE {lock_table} SET owner = ?1, lease_until = ?2 WHERE id = 1"
                        ),
                        params![owner, lease_until],
                    )?;
                    true
                } else {
                    false
                }
            }
        };
        tx.commit()?;
        Ok(acquired)
    }

    fn release_lock(&mut self, lock_table: &str, owner: &str) -> Result<(), Error> {
        if !self.collection_exists(lock_table)? {
            return Ok(());
        }
        self.conn.execute(
            &format!("DELETE FROM {lock_table} WHERE id = 1 AND owner = ?1"),
            [owner],
        )?;
        Ok(())
    }

    fn lock_holder(&mut self, lock_table: &str) -> Result<Option<String>, Error> {
        if !self.collection_exists(lock_table)? {
            return Ok(None);
        }
        let current: Option<(String, String)> = self
            .conn
            .query_row(
                &format!("SELECT owner, lease_until FROM {lock_table} WHERE id = 1"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(current.and_then(|(owner, until)| {
            let live = DateTime::parse_from_rfc3339(&until)
                .map(|t| t.with_timezone(&Utc) > Utc::now())
                .unwrap_or(false);
            live.then_some(owner)
        }))
    }
}
