//! The metadata store: the persistent, ordered log of applied migrations.
//!
//! The store owns everything about the history that is backend-independent:
//! install rank assignment, the baseline and schema markers, duplicate
//! detection, layout upgrades and the advisory lock discipline. Raw row I/O
//! goes through the [Backend] capability trait.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::Error;
use crate::migration::{MigrationDescriptor, MigrationKind};
use crate::version::VersionKey;

pub(crate) const SCHEMA_MARKER_DESCRIPTION: &str = "<< Schema Creation >>";

/// How long a lock lease lasts before a crashed holder's lock may be taken
/// over by another engine instance.
const LOCK_LEASE: Duration = Duration::from_secs(300);
/// How often acquisition retries while the lock is held elsewhere.
const LOCK_POLL: Duration = Duration::from_millis(100);

/// One row of the metadata collection: a migration application, a baseline
/// marker or a schema marker.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedEntry {
    pub install_rank: i64,
    pub version: Option<VersionKey>,
    pub description: String,
    pub kind: MigrationKind,
    pub script: String,
    pub checksum: Option<i32>,
    pub installed_by: String,
    pub installed_on: DateTime<Utc>,
    pub execution_time_ms: i32,
    pub success: bool,
}

impl AppliedEntry {
    /// Whether this entry is an actual migration application rather than a
    /// marker.
    pub fn is_migration(&self) -> bool {
        matches!(
            self.kind,
            MigrationKind::Versioned | MigrationKind::Repeatable
        )
    }
}

/// Handle to the metadata collection of one database, scoped to a single
/// command. Exclusively owned by the engine for the command's duration.
pub struct MetadataStore<'b> {
    backend: &'b mut dyn Backend,
    table: String,
    lock_table: String,
    installed_by: String,
    lock_owner: String,
    lock_depth: u32,
    lock_timeout: Option<Duration>,
}

impl<'b> MetadataStore<'b> {
    pub fn new(backend: &'b mut dyn Backend, config: &Config) -> Self {
        let table = config.table().to_string();
        let lock_table = format!("{table}_lock");
        let installed_by = config
            .installed_by()
            .map(str::to_string)
            .unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "tidemark".into()));
        MetadataStore {
            backend,
            table,
            lock_table,
            installed_by,
            lock_owner: Uuid::new_v4().to_string(),
            lock_depth: 0,
            lock_timeout: config.lock_timeout(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bookkeeping objects this store maintains, which never count as user
    /// data.
    pub fn reserved_objects(&self) -> Vec<String> {
        vec![self.table.clone(), self.lock_table.clone()]
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend
    }

    pub fn exists(&mut self) -> Result<bool, Error> {
        self.backend.collection_exists(&self.table)
    }

    pub fn create_if_absent(&mut self) -> Result<(), Error> {
        self.backend.create_collection(&self.table)
    }

    /// Bring a legacy metadata collection up to the current layout. Returns
    /// true if an upgrade ran; the caller is then responsible for rewriting
    /// stored checksums via repair.
    pub fn upgrade_if_necessary(&mut self) -> Result<bool, Error> {
        if !self.exists()? {
            return Ok(false);
        }
        if self.backend.has_current_layout(&self.table)? {
            return Ok(false);
        }
        self.backend.upgrade_layout(&self.table)?;
        tracing::info!(table = %self.table, "metadata collection upgraded to the current layout");
        Ok(true)
    }

    /// Run `action` while holding the exclusive advisory lock on this
    /// store. Reentrant for the same store handle. The lock is released on
    /// success and on error; a crashed holder is covered by lease expiry.
    pub fn lock<T>(
        &mut self,
        action: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if self.lock_depth > 0 {
            self.lock_depth += 1;
            let result = action(self);
            self.lock_depth -= 1;
            return result;
        }

        self.acquire_lock()?;
        self.lock_depth = 1;
        let result = action(self);
        self.lock_depth = 0;
        let released = self
            .backend
            .release_lock(&self.lock_table, &self.lock_owner);
        match (result, released) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    fn acquire_lock(&mut self) -> Result<(), Error> {
        let deadline = self.lock_timeout.map(|t| Instant::now() + t);
        loop {
            if self
                .backend
                .try_acquire_lock(&self.lock_table, &self.lock_owner, LOCK_LEASE)?
            {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let holder = self
                        .backend
                        .lock_holder(&self.lock_table)?
                        .unwrap_or_else(|| "unknown".into());
                    return Err(Error::LockTimeout { holder });
                }
            }
            std::thread::sleep(LOCK_POLL);
        }
    }

    /// All entries ordered by install rank.
    pub fn all_applied(&mut self) -> Result<Vec<AppliedEntry>, Error> {
        self.backend.read_entries(&self.table)
    }

    /// Record one migration application. Assigns the install rank and
    /// timestamps the entry.
    pub fn record(
        &mut self,
        migration: &MigrationDescriptor,
        execution_time_ms: i32,
        success: bool,
    ) -> Result<AppliedEntry, Error> {
        let entry = AppliedEntry {
            install_rank: 0,
            version: migration.version().cloned(),
            description: migration.description().to_string(),
            kind: migration.kind(),
            script: migration.script().to_string(),
            checksum: migration.checksum(),
            installed_by: self.installed_by.clone(),
            installed_on: Utc::now(),
            execution_time_ms,
            success,
        };
        self.append(entry)
    }

    /// Append an entry, assigning the next install rank. Fails if the entry
    /// would duplicate an existing successful versioned application.
    pub fn append(&mut self, mut entry: AppliedEntry) -> Result<AppliedEntry, Error> {
        let existing = self.all_applied()?;
        if entry.kind == MigrationKind::Versioned {
            let duplicate = existing.iter().any(|e| {
                e.kind == MigrationKind::Versioned && e.success && e.version == entry.version
            });
            if duplicate {
                return Err(Error::DuplicateMigration(format!(
                    "version {} is already applied",
                    entry
                        .version
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                )));
            }
        }
        entry.install_rank = existing.iter().map(|e| e.install_rank).max().unwrap_or(0) + 1;
        self.backend.insert_entry(&self.table, &entry)?;
        Ok(entry)
    }

    /// Record that the engine itself created the named schemas, so clean
    /// knows it may drop them. Must precede any applied migration.
    pub fn add_schema_marker(&mut self, schemas: &[String]) -> Result<(), Error> {
        if self.has_applied_migrations()? {
            return Err(Error::NonEmptyHistory);
        }
        let entry = AppliedEntry {
            install_rank: 0,
            version: None,
            description: SCHEMA_MARKER_DESCRIPTION.to_string(),
            kind: MigrationKind::SchemaMarker,
            script: schemas.join(","),
            checksum: None,
            installed_by: self.installed_by.clone(),
            installed_on: Utc::now(),
            execution_time_ms: 0,
            success: true,
        };
        self.append(entry)?;
        Ok(())
    }

    /// Anchor the history at `version`: migrations at or below it are
    /// considered pre-applied.
    pub fn add_baseline_marker(
        &mut self,
        version: &VersionKey,
        description: &str,
    ) -> Result<(), Error> {
        if self.has_baseline_marker()? {
            return Err(Error::AlreadyBaselined);
        }
        if self
            .all_applied()?
            .iter()
            .any(|e| e.is_migration() && e.success)
        {
            return Err(Error::NonEmptyHistory);
        }
        let entry = AppliedEntry {
            install_rank: 0,
            version: Some(version.clone()),
            description: description.to_string(),
            kind: MigrationKind::Baseline,
            script: description.to_string(),
            checksum: None,
            installed_by: self.installed_by.clone(),
            installed_on: Utc::now(),
            execution_time_ms: 0,
            success: true,
        };
        self.append(entry)?;
        Ok(())
    }

    /// Delete entries left behind by failed migrations.
    pub fn remove_failed(&mut self) -> Result<usize, Error> {
        self.backend.delete_failed_entries(&self.table)
    }

    /// Rewrite the checksum of a single entry.
    pub fn update_checksum(
        &mut self,
        install_rank: i64,
        checksum: Option<i32>,
    ) -> Result<(), Error> {
        self.backend
            .update_entry_checksum(&self.table, install_rank, checksum)
    }

    pub fn has_schemas_marker(&mut self) -> Result<bool, Error> {
        Ok(self
            .all_applied()?
            .iter()
            .any(|e| e.kind == MigrationKind::SchemaMarker))
    }

    pub fn has_baseline_marker(&mut self) -> Result<bool, Error> {
        Ok(self.baseline_marker()?.is_some())
    }

    pub fn baseline_marker(&mut self) -> Result<Option<AppliedEntry>, Error> {
        Ok(self
            .all_applied()?
            .into_iter()
            .find(|e| e.kind == MigrationKind::Baseline))
    }

    pub fn has_applied_migrations(&mut self) -> Result<bool, Error> {
        Ok(self.all_applied()?.iter().any(AppliedEntry::is_migration))
    }
}
