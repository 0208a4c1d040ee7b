//! The backend capability set.
//!
//! The orchestrator core never talks to a database driver directly; it
//! depends on this trait, which captures exactly what a backend must be able
//! to do: read and write metadata rows, execute script bodies, describe and
//! drop user objects, and provide a compare-and-set advisory lock. Backends
//! are variants behind this seam, not subclasses of the engine.

use std::time::Duration;

use crate::error::Error;
use crate::store::AppliedEntry;

pub mod sqlite;

pub use sqlite::SqliteBackend;

pub trait Backend: Send {
    /// Short human-readable identity for logs ("sqlite:app.db").
    fn describe(&self) -> String;

    /// Whether the metadata collection is present.
    fn collection_exists(&mut self, table: &str) -> Result<bool, Error>;

    /// Create the metadata collection and its backing indexes. Idempotent.
    fn create_collection(&mut self, table: &str) -> Result<(), Error>;

    /// Whether an existing metadata collection already has the current
    /// layout. Only called when the collection exists.
    fn has_current_layout(&mut self, table: &str) -> Result<bool, Error>;

    /// Migrate a legacy metadata collection to the current layout, adding
    /// missing columns with conservative defaults.
    fn upgrade_layout(&mut self, table: &str) -> Result<(), Error>;

    /// All rows ordered by install rank.
    fn read_entries(&mut self, table: &str) -> Result<Vec<AppliedEntry>, Error>;

    /// Insert one row. The store has already assigned the install rank.
    fn insert_entry(&mut self, table: &str, entry: &AppliedEntry) -> Result<(), Error>;

    /// Delete rows with `success = false`, returning how many were removed.
    fn delete_failed_entries(&mut self, table: &str) -> Result<usize, Error>;

    /// Rewrite the checksum of the row with the given install rank.
    fn update_entry_checksum(
        &mut self,
        table: &str,
        install_rank: i64,
        checksum: Option<i32>,
    ) -> Result<(), Error>;

    /// Execute a migration script body. With `atomic` the whole body must
    /// apply or roll back as a unit where the backend supports transactions;
    /// without it, statements may commit individually.
    fn execute_script(&mut self, body: &str, atomic: bool) -> Result<(), Error>;

    /// Whether a failed script leaves no partial state behind. Backends
    /// returning false get a failed metadata entry appended on script
    /// failure, which `repair` must remove before a retry.
    fn supports_transactions(&self) -> bool;

    /// Whether the database contains no user objects. `reserved` names the
    /// engine's own bookkeeping objects, which do not count.
    fn is_empty(&mut self, reserved: &[String]) -> Result<bool, Error>;

    /// Names of all user objects, excluding `reserved` ones.
    fn enumerate_schemas(&mut self, reserved: &[String]) -> Result<Vec<String>, Error>;

    /// Drop one user object. Dropping an absent object is not an error.
    fn drop_schema(&mut self, name: &str) -> Result<(), Error>;

    /// Try to take the advisory lock stored in `lock_table` for `owner`,
    /// leasing it for `lease`. Returns false if another live owner holds it.
    /// Re-acquisition by the same owner refreshes the lease; an expired
    /// lease may be taken over.
    fn try_acquire_lock(
        &mut self,
        lock_table: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, Error>;

    /// Release the advisory lock if `owner` holds it. Releasing a lock that
    /// is not held (or whose table is gone) is not an error.
    fn release_lock(&mut self, lock_table: &str, owner: &str) -> Result<(), Error>;

    /// Current holder of the advisory lock, if any. Used for diagnostics
    /// when lock acquisition times out.
    fn lock_holder(&mut self, lock_table: &str) -> Result<Option<String>, Error>;
}
