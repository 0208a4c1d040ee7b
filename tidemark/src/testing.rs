//! Test support: an in-memory [Backend] implementation.
//!
//! `MemoryBackend` keeps metadata rows, user objects and the advisory lock
//! in plain collections, letting the orchestrator be exercised without a
//! database file. It is also the knob for scenarios that are awkward to
//! produce with a real driver: legacy metadata layouts, non-transactional
//! script execution, injected script failures and contended locks.
//!
//! As a convenience, executing a script whose body is `object:<name>`
//! creates a user object of that name, so end-to-end tests can observe
//! migrate creating state and clean dropping it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::backend::Backend;
use crate::error::Error;
use crate::store::AppliedEntry;

#[derive(Default)]
pub struct MemoryBackend {
    collections: HashMap<String, Vec<AppliedEntry>>,
    legacy: HashSet<String>,
    locks: HashMap<String, LockState>,
    objects: BTreeSet<String>,
    executed: Vec<String>,
    non_transactional: bool,
    fail_marker: Option<String>,
}

struct LockState {
    owner: String,
    lease_until: Instant,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make script failures leave their metadata trace behind, as a backend
    /// without transactional script execution would.
    pub fn non_transactional(mut self) -> Self {
        self.non_transactional = true;
        self
    }

    /// Scripts whose body contains `marker` fail with a backend error.
    pub fn fail_when_contains(&mut self, marker: impl Into<String>) {
        self.fail_marker = Some(marker.into());
    }

    /// Seed a pre-existing user object, as if created outside the engine.
    pub fn create_object(&mut self, name: impl Into<String>) {
        self.objects.insert(name.into());
    }

    pub fn objects(&self) -> Vec<String> {
        self.objects.iter().cloned().collect()
    }

    /// Bodies of every script executed so far, in execution order.
    pub fn executed_scripts(&self) -> &[String] {
        &self.executed
    }

    /// Mark a metadata collection as having the legacy layout.
    pub fn set_legacy_layout(&mut self, table: impl Into<String>) {
        self.legacy.insert(table.into());
    }

    /// Grab the advisory lock on behalf of some other engine instance.
    pub fn seize_lock(&mut self, lock_table: impl Into<String>, owner: impl Into<String>) {
        self.locks.insert(
            lock_table.into(),
            LockState {
                owner: owner.into(),
                lease_until: Instant::now() + Duration::from_secs(3600),
            },
        );
    }

    /// Current lock holder, if any lease is live.
    pub fn lock_state(&self) -> Option<&str> {
        self.locks
            .values()
            .find(|l| l.lease_until > Instant::now())
            .map(|l| l.owner.as_str())
    }
}

impl Backend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".into()
    }

    fn collection_exists(&mut self, table: &str) -> Result<bool, Error> {
        Ok(self.collections.contains_key(table))
    }

    fn create_collection(&mut self, table: &str) -> Result<(), Error> {
        self.collections.entry(table.to_string()).or_default();
        Ok(())
    }

    fn has_current_layout(&mut self, table: &str) -> Result<bool, Error> {
        Ok(!self.legacy.contains(table))
    }

    fn upgrade_layout(&mut self, table: &str) -> Result<(), Error> {
        self.legacy.remove(table);
        Ok(())
    }

    fn read_entries(&mut self, table: &str) -> Result<Vec<AppliedEntry>, Error> {
        let mut entries = self.collections.get(table).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.install_rank);
        Ok(entries)
    }

    fn insert_entry(&mut self, table: &str, entry: &AppliedEntry) -> Result<(), Error> {
        self.collections
            .get_mut(table)
            .ok_or_else(|| Error::backend(format!("no such collection '{table}'")))?
            .push(entry.clone());
        Ok(())
    }

    fn delete_failed_entries(&mut self, table: &str) -> Result<usize, Error> {
        let entries = self
            .collections
            .get_mut(table)
            .ok_or_else(|| Error::backend(format!("no such collection '{table}'")))?;
        let before = entries.len();
        entries.retain(|e| e.success);
        Ok(before - entries.len())
    }

    fn update_entry_checksum(
        &mut self,
        table: &str,
        install_rank: i64,
        checksum: Option<i32>,
    ) -> Result<(), Error> {
        let entries = self
            .collections
            .get_mut(table)
            .ok_or_else(|| Error::backend(format!("no such collection '{table}'")))?;
        match entries.iter_mut().find(|e| e.install_rank == install_rank) {
            Some(entry) => {
                entry.checksum = checksum;
                Ok(())
            }
            None => Err(Error::backend(format!(
                "no entry with install rank {install_rank}"
            ))),
        }
    }

    fn execute_script(&mut self, body: &str, _atomic: bool) -> Result<(), Error> {
        if let Some(marker) = &self.fail_marker {
            if body.contains(marker.as_str()) {
                return Err(Error::backend(format!(
                    "injected failure executing: {body}"
                )));
            }
        }
        if let Some(name) = body.trim().strip_prefix("object:") {
            self.objects.insert(name.trim().to_string());
        }
        self.executed.push(body.to_string());
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        !self.non_transactional
    }

    fn is_empty(&mut self, reserved: &[String]) -> Result<bool, Error> {
        Ok(self.enumerate_schemas(reserved)?.is_empty())
    }

    fn enumerate_schemas(&mut self, reserved: &[String]) -> Result<Vec<String>, Error> {
        Ok(self
            .objects
            .iter()
            .filter(|name| !reserved.contains(name))
            .cloned()
            .collect())
    }

    fn drop_schema(&mut self, name: &str) -> Result<(), Error> {
        self.objects.remove(name);
        self.collections.remove(name);
        Ok(())
    }

    fn try_acquire_lock(
        &mut self,
        lock_table: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, Error> {
        let now = Instant::now();
        match self.locks.get_mut(lock_table) {
            Some(state) if state.owner == owner || state.lease_until <= now => {
                state.owner = owner.to_string();
                state.lease_until = now + lease;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                self.locks.insert(
                    lock_table.to_string(),
                    LockState {
                        owner: owner.to_string(),
                        lease_until: now + lease,
                    },
                );
                Ok(true)
            }
        }
    }

    fn release_lock(&mut self, lock_table: &str, owner: &str) -> Result<(), Error> {
        if let Some(state) = self.locks.get(lock_table) {
            if state.owner == owner {
                self.locks.remove(lock_table);
            }
        }
        Ok(())
    }

    fn lock_holder(&mut self, lock_table: &str) -> Result<Option<String>, Error> {
        Ok(self
            .locks
            .get(lock_table)
            .filter(|l| l.lease_until > Instant::now())
            .map(|l| l.owner.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_expiry_allows_takeover() {
        let mut backend = MemoryBackend::new();
        assert!(backend
            .try_acquire_lock("lock", "a", Duration::from_millis(0))
            .unwrap());
        // lease of zero expires immediately; another owner may take over
        assert!(backend
            .try_acquire_lock("lock", "b", Duration::from_secs(60))
            .unwrap());
        assert!(!backend
            .try_acquire_lock("lock", "a", Duration::from_secs(60))
            .unwrap());
    }

    #[test]
    fn release_is_owner_scoped_and_tolerant() {
        let mut backend = MemoryBackend::new();
        backend
            .try_acquire_lock("lock", "a", Duration::from_secs(60))
            .unwrap();
        backend.release_lock("lock", "b").unwrap();
        assert_eq!(backend.lock_state(), Some("a"));
        backend.release_lock("lock", "a").unwrap();
        assert_eq!(backend.lock_state(), None);
        // releasing when nothing is held is a no-op
        backend.release_lock("lock", "a").unwrap();
    }

    #[test]
    fn object_convention_creates_user_objects() {
        let mut backend = MemoryBackend::new();
        backend.execute_script("object: users", true).unwrap();
        assert_eq!(backend.objects(), vec!["users".to_string()]);
        assert!(!backend.is_empty(&[]).unwrap());
    }
}
