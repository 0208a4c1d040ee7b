//! The engine: the centre point of the crate, from which the lifecycle
//! commands (migrate, validate, info, baseline, clean, repair) are run.

use std::sync::Arc;
use std::sync::Once;
use std::time::Instant;

use crate::backend::{Backend, SqliteBackend};
use crate::callback::{CallbackBus, Event};
use crate::config::Config;
use crate::error::Error;
use crate::info::{build_info, InfoRow, MigrationState};
use crate::migration::{MigrationDescriptor, MigrationKind};
use crate::resolver::CompositeResolver;
use crate::store::MetadataStore;
use crate::testing::MemoryBackend;
use crate::validate::{validate, ValidationPolicy};

enum Client<'c> {
    None,
    Owned(Box<dyn Backend>),
    Borrowed(&'c mut dyn Backend),
}

/// A configured migration engine bound to (at most) one database client.
///
/// A client opened by the engine itself (from [Config::with_url]) is owned
/// and closed when the engine is dropped; a client attached with
/// [Engine::with_client] is borrowed and left open.
///
/// ```no_run
/// use tidemark::{Config, Engine};
///
/// let config = Config::default()
///     .with_url("sqlite:app.db")
///     .with_locations(["filesystem:migrations"]);
/// let mut engine = Engine::open(config)?;
/// let applied = engine.migrate()?;
/// println!("applied {applied} migration(s)");
/// # Ok::<(), tidemark::Error>(())
/// ```
pub struct Engine<'c> {
    config: Config,
    client: Client<'c>,
}

impl Engine<'static> {
    /// An engine with no client yet. Commands fail until a URL is
    /// configured or a client attached.
    pub fn new(config: Config) -> Self {
        Engine {
            config,
            client: Client::None,
        }
    }

    /// Open a client from the configured URL. Supported schemes:
    /// `sqlite:<path>`, `sqlite::memory:` and `memory:` (an in-memory
    /// backend for tests and experiments).
    pub fn open(config: Config) -> Result<Self, Error> {
        let url = config
            .url()
            .ok_or_else(|| Error::NotConfigured("no database URL configured".into()))?
            .to_string();
        let client: Box<dyn Backend> = if url == "sqlite::memory:" {
            Box::new(SqliteBackend::open_in_memory()?)
        } else if let Some(path) = url.strip_prefix("sqlite:") {
            Box::new(SqliteBackend::open(path)?)
        } else if url == "memory:" {
            Box::new(MemoryBackend::new())
        } else {
            return Err(Error::InvalidConfig(format!(
                "unsupported database URL '{url}'"
            )));
        };
        Ok(Engine {
            config,
            client: Client::Owned(client),
        })
    }

    /// Hand an owned client to the engine; it is closed on drop.
    pub fn with_owned_client(config: Config, client: Box<dyn Backend>) -> Self {
        Engine {
            config,
            client: Client::Owned(client),
        }
    }
}

impl<'c> Engine<'c> {
    /// Borrow an existing client for the engine's lifetime. The caller
    /// keeps ownership; the engine never closes it.
    pub fn with_client(config: Config, client: &'c mut dyn Backend) -> Self {
        Engine {
            config,
            client: Client::Borrowed(client),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply all pending migrations in order. Returns the number of
    /// migrations successfully applied; on script failure the error carries
    /// the count applied before the failure.
    pub fn migrate(&mut self) -> Result<usize, Error> {
        self.execute("migrate", do_migrate)
    }

    /// Validate applied migrations against resolved ones. Pending
    /// migrations count as a validation error here.
    pub fn validate(&mut self) -> Result<(), Error> {
        self.execute("validate", |state| {
            run_validation(state, true)
        })
    }

    /// The joined per-migration state view.
    pub fn info(&mut self) -> Result<Vec<InfoRow>, Error> {
        self.execute("info", do_info)
    }

    /// Tag the existing database with the configured baseline version;
    /// migrations at or below it are skipped from then on.
    pub fn baseline(&mut self) -> Result<(), Error> {
        self.execute("baseline", do_baseline)
    }

    /// Drop the objects the engine is allowed to drop and reset the
    /// metadata collection.
    pub fn clean(&mut self) -> Result<(), Error> {
        self.execute("clean", do_clean)
    }

    /// Remove failed entries and rewrite drifted checksums from the
    /// currently resolved migrations.
    pub fn repair(&mut self) -> Result<(), Error> {
        self.execute("repair", do_repair)
    }

    fn execute<T>(
        &mut self,
        command: &'static str,
        body: impl FnOnce(&mut CommandState<'_, '_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        print_banner();
        self.config.validate()?;
        let config = self.config.clone();
        let backend: &mut dyn Backend = match &mut self.client {
            Client::None => {
                return Err(Error::NotConfigured(
                    "configure a database URL or attach a client".into(),
                ))
            }
            Client::Owned(client) => client.as_mut(),
            Client::Borrowed(client) => &mut **client,
        };
        tracing::debug!(command, backend = %backend.describe(), "executing command");

        let resolver = CompositeResolver::from_config(&config);
        let callbacks = CallbackBus::from_config(&config);
        let mut store = MetadataStore::new(backend, &config);
        store.create_if_absent()?;
        if store.upgrade_if_necessary()? {
            let resolved = resolver.resolve(&config)?;
            store.lock(|store| repair_checksums(store, &resolved))?;
            tracing::info!(
                table = config.table(),
                "metadata collection upgraded; stored checksums recomputed"
            );
        }

        store.lock(|store| {
            let mut state = CommandState {
                config: &config,
                store,
                resolver: &resolver,
                callbacks: &callbacks,
            };
            body(&mut state)
        })
    }
}

fn print_banner() {
    static BANNER: Once = Once::new();
    BANNER.call_once(|| {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "tidemark migration engine");
    });
}

struct CommandState<'a, 'b> {
    config: &'a Config,
    store: &'a mut MetadataStore<'b>,
    resolver: &'a CompositeResolver,
    callbacks: &'a CallbackBus,
}

impl CommandState<'_, '_> {
    fn fire(&mut self, event: Event, migration: Option<&MigrationDescriptor>) -> Result<(), Error> {
        self.callbacks
            .fire(event, self.store.backend_mut(), self.config, migration)
    }

    fn resolve(&self) -> Result<Vec<Arc<MigrationDescriptor>>, Error> {
        self.resolver.resolve(self.config)
    }

    fn rows(&mut self, resolved: &[Arc<MigrationDescriptor>]) -> Result<Vec<InfoRow>, Error> {
        let applied = self.store.all_applied()?;
        Ok(build_info(resolved, &applied, self.config))
    }
}

fn do_migrate(state: &mut CommandState<'_, '_>) -> Result<usize, Error> {
    if state.config.validate_on_migrate() {
        run_validation(state, false)?;
    }

    if !state.store.has_schemas_marker()?
        && !state.store.has_baseline_marker()?
        && !state.store.has_applied_migrations()?
    {
        let reserved = state.store.reserved_objects();
        let empty = state.store.backend_mut().is_empty(&reserved)?;
        if state.config.baseline_on_migrate() || empty {
            if state.config.baseline_on_migrate() && !empty {
                let version = state.config.baseline_version().clone();
                let description = state.config.baseline_description().to_string();
                state.store.add_baseline_marker(&version, &description)?;
                tracing::info!(%version, "baselined non-empty database before migrating");
            }
        } else {
            return Err(Error::NonEmptyNoMetadata);
        }
    }

    state.fire(Event::BeforeMigrate, None)?;

    let resolved = state.resolve()?;
    let rows = state.rows(&resolved)?;
    // versioned migrations in Pending/OutOfOrder apply; a repeatable applies
    // when its newest row (re-application history is rank-ordered) is
    // pending or outdated
    let mut pending: Vec<Arc<MigrationDescriptor>> = Vec::new();
    let mut repeatable_verdicts: std::collections::BTreeMap<String, Option<Arc<MigrationDescriptor>>> =
        std::collections::BTreeMap::new();
    for row in &rows {
        match row.kind() {
            MigrationKind::Versioned => {
                if matches!(
                    row.state,
                    MigrationState::Pending | MigrationState::OutOfOrder
                ) {
                    if let Some(descriptor) = &row.descriptor {
                        pending.push(Arc::clone(descriptor));
                    }
                }
            }
            MigrationKind::Repeatable => {
                let applicable = matches!(
                    row.state,
                    MigrationState::Pending | MigrationState::Outdated
                );
                repeatable_verdicts.insert(
                    row.description().to_string(),
                    if applicable {
                        row.descriptor.clone()
                    } else {
                        None
                    },
                );
            }
            _ => {}
        }
    }
    pending.extend(repeatable_verdicts.into_values().flatten());

    let mut applied = 0usize;
    for migration in pending {
        state.fire(Event::BeforeEachMigrate, Some(&migration))?;
        tracing::info!(migration = %migration.display_name(), "applying migration");
        let atomic = !state.config.allow_mixed();
        let started = Instant::now();
        let result = migration.run(state.store.backend_mut(), atomic);
        let execution_time_ms =
            i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);
        match result {
            Ok(()) => {
                state.store.record(&migration, execution_time_ms, true)?;
                applied += 1;
                state.fire(Event::AfterEachMigrate, Some(&migration))?;
            }
            Err(source) => {
                tracing::error!(
                    migration = %migration.display_name(),
                    error = %source,
                    "migration failed"
                );
                // without transactional scripts the partial work stays
                // behind, so the failure is recorded for repair to clear
                if !state.store.backend_mut().supports_transactions() {
                    state.store.record(&migration, execution_time_ms, false)?;
                }
                return Err(Error::MigrationFailed {
                    script: migration.script().to_string(),
                    applied,
                    source: Box::new(source),
                });
            }
        }
    }

    state.fire(Event::AfterMigrate, None)?;
    tracing::info!(count = applied, "migrate complete");
    Ok(applied)
}

fn run_validation(state: &mut CommandState<'_, '_>, pending_not_ok: bool) -> Result<(), Error> {
    state.fire(Event::BeforeValidate, None)?;
    let resolved = state.resolve()?;
    let rows = state.rows(&resolved)?;
    let policy = ValidationPolicy {
        pending_not_ok,
        ignore_future: state.config.ignore_future(),
    };
    match validate(&rows, policy) {
        Ok(_warnings) => {
            state.fire(Event::AfterValidate, None)?;
            Ok(())
        }
        Err(cause) => {
            if state.config.clean_on_validation_error() {
                tracing::warn!(error = %cause, "validation failed; cleaning as configured");
                do_clean(state)
            } else {
                tracing::error!(error = %cause, "validation failed");
                Err(match cause {
                    already @ Error::ValidationFailed(_) => already,
                    other => Error::ValidationFailed(other.to_string()),
                })
            }
        }
    }
}

fn do_info(state: &mut CommandState<'_, '_>) -> Result<Vec<InfoRow>, Error> {
    state.fire(Event::BeforeInfo, None)?;
    let resolved = state.resolve()?;
    let rows = state.rows(&resolved)?;
    state.fire(Event::AfterInfo, None)?;
    Ok(rows)
}

fn do_baseline(state: &mut CommandState<'_, '_>) -> Result<(), Error> {
    state.fire(Event::BeforeBaseline, None)?;
    let version = state.config.baseline_version().clone();
    let description = state.config.baseline_description().to_string();
    state.store.add_baseline_marker(&version, &description)?;
    state.fire(Event::AfterBaseline, None)?;
    tracing::info!(%version, "baseline established");
    Ok(())
}

fn do_clean(state: &mut CommandState<'_, '_>) -> Result<(), Error> {
    if state.config.clean_disabled() {
        return Err(Error::CleanDisabled);
    }
    state.fire(Event::BeforeClean, None)?;

    let reserved = state.store.reserved_objects();
    let marker_schemas: Option<Vec<String>> = state
        .store
        .all_applied()?
        .iter()
        .find(|e| e.kind == MigrationKind::SchemaMarker)
        .map(|e| {
            e.script
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        });
    // a schema marker restricts clean to what the engine itself created;
    // without one, every user object in the database is dropped
    let to_drop = match marker_schemas {
        Some(schemas) => schemas,
        None => state.store.backend_mut().enumerate_schemas(&reserved)?,
    };
    for name in &to_drop {
        tracing::info!(object = %name, "dropping");
        state.store.backend_mut().drop_schema(name)?;
    }

    // reset the history itself
    let table = state.store.table().to_string();
    state.store.backend_mut().drop_schema(&table)?;
    state.store.create_if_absent()?;

    state.fire(Event::AfterClean, None)?;
    tracing::info!(dropped = to_drop.len(), "clean complete");
    Ok(())
}

fn do_repair(state: &mut CommandState<'_, '_>) -> Result<(), Error> {
    state.fire(Event::BeforeRepair, None)?;
    let removed = state.store.remove_failed()?;
    if removed > 0 {
        tracing::info!(removed, "removed failed migration entries");
    }
    let resolved = state.resolve()?;
    repair_checksums(state.store, &resolved)?;
    state.fire(Event::AfterRepair, None)?;
    tracing::info!("repair complete");
    Ok(())
}

/// Rewrite stored checksums to match the currently resolved scripts.
fn repair_checksums(
    store: &mut MetadataStore<'_>,
    resolved: &[Arc<MigrationDescriptor>],
) -> Result<(), Error> {
    for entry in store.all_applied()? {
        if !entry.is_migration() {
            continue;
        }
        let descriptor = resolved.iter().find(|d| {
            d.kind() == entry.kind
                && match entry.kind {
                    MigrationKind::Versioned => d.version() == entry.version.as_ref(),
                    _ => d.description() == entry.description,
                }
        });
        if let Some(descriptor) = descriptor {
            if descriptor.checksum() != entry.checksum {
                tracing::info!(
                    script = %entry.script,
                    old = ?entry.checksum,
                    new = ?descriptor.checksum(),
                    "rewriting checksum"
                );
                store.update_checksum(entry.install_rank, descriptor.checksum())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{Callback, CallbackContext};
    use crate::checksum;
    use crate::error::ErrorKind;
    use crate::migration::SqlRunner;
    use crate::resolver::MigrationResolver;
    use crate::version::Target;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StaticResolver(Vec<Arc<MigrationDescriptor>>);

    impl MigrationResolver for StaticResolver {
        fn resolve(&self, _config: &Config) -> Result<Vec<Arc<MigrationDescriptor>>, Error> {
            Ok(self.0.clone())
        }
    }

    fn versioned(version: &str, body: &str) -> Arc<MigrationDescriptor> {
        Arc::new(
            MigrationDescriptor::versioned(
                version.parse().unwrap(),
                format!("migration {version}"),
                format!("V{version}__migration.sql"),
                "provider:test",
                body,
                Some(checksum::compute(body.as_bytes())),
                Arc::new(SqlRunner),
            )
            .unwrap(),
        )
    }

    fn repeatable(description: &str, body: &str) -> Arc<MigrationDescriptor> {
        Arc::new(
            MigrationDescriptor::repeatable(
                description,
                format!("R__{}.sql", description.replace(' ', "_")),
                "provider:test",
                body,
                Some(checksum::compute(body.as_bytes())),
                Arc::new(SqlRunner),
            )
            .unwrap(),
        )
    }

    fn config_with(migrations: Vec<Arc<MigrationDescriptor>>) -> Config {
        Config::default()
            .with_skip_default_resolvers(true)
            .with_skip_default_callbacks(true)
            .with_resolvers(vec![Arc::new(StaticResolver(migrations))])
            .with_lock_timeout(Some(Duration::from_secs(2)))
    }

    fn states(rows: &[InfoRow]) -> Vec<MigrationState> {
        rows.iter().map(|r| r.state).collect()
    }

    // S1: fresh migrate applies everything in order with ranks 1..=3
    #[test]
    fn fresh_migrate_applies_versioned_then_repeatable() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![
            repeatable("c rollup", "object:rollup"),
            versioned("2", "object:t2"),
            versioned("1", "object:t1"),
        ]);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 3);

        let rows = engine.info().unwrap();
        assert_eq!(
            states(&rows),
            vec![
                MigrationState::Success,
                MigrationState::Success,
                MigrationState::Success
            ]
        );
        drop(engine);

        assert_eq!(
            backend.executed_scripts(),
            &["object:t1", "object:t2", "object:rollup"]
        );
        let cfg = Config::default();
        let mut store = MetadataStore::new(&mut backend, &cfg);
        let entries = store.all_applied().unwrap();
        let ranks: Vec<i64> = entries.iter().map(|e| e.install_rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(entries[0].kind, MigrationKind::Versioned);
        assert_eq!(entries[2].kind, MigrationKind::Repeatable);
    }

    // invariant 3: idempotence
    #[test]
    fn migrate_twice_applies_nothing_the_second_time() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")]);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 1);
        assert_eq!(engine.migrate().unwrap(), 0);
    }

    // S2: out-of-order handling
    #[test]
    fn skipped_version_is_ignored_without_out_of_order() {
        let v1 = versioned("1", "object:t1");
        let v3 = versioned("3", "object:t3");
        let v2 = versioned("2", "object:t2");

        let mut backend = MemoryBackend::new();
        let config = config_with(vec![v1.clone(), v3.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 2);
        drop(engine);

        let config = config_with(vec![v1.clone(), v2.clone(), v3.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 0);
        let rows = engine.info().unwrap();
        assert_eq!(rows[1].state, MigrationState::Ignored);
        drop(engine);

        let config = config_with(vec![v1, v2, v3]).with_out_of_order(true);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 1);
        drop(engine);

        let cfg = Config::default();
        let mut store = MetadataStore::new(&mut backend, &cfg);
        let entries = store.all_applied().unwrap();
        let v2_rank = entries
            .iter()
            .find(|e| e.version.as_ref().map(ToString::to_string) == Some("2".into()))
            .unwrap()
            .install_rank;
        let v3_rank = entries
            .iter()
            .find(|e| e.version.as_ref().map(ToString::to_string) == Some("3".into()))
            .unwrap()
            .install_rank;
        assert!(v2_rank > v3_rank);
    }

    // S3: checksum drift fails validation and blocks migrate
    #[test]
    fn checksum_drift_blocks_validate_and_migrate() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        drop(engine);

        let drifted = versioned("1", "object:t1_edited");
        let config = config_with(vec![drifted.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        let err = engine.migrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        drop(engine);
        assert_eq!(backend.executed_scripts().len(), 1);
    }

    // S4: non-empty database without metadata
    #[test]
    fn non_empty_database_without_metadata_requires_baseline() {
        let mut backend = MemoryBackend::new();
        backend.create_object("legacy_table");
        let config = config_with(vec![versioned("1", "object:t1"), versioned("2", "object:t2")]);
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.migrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonEmptyNoMetadata);
        drop(engine);

        let config = config_with(vec![versioned("1", "object:t1"), versioned("2", "object:t2")])
            .with_baseline_on_migrate(true);
        let mut engine = Engine::with_client(config, &mut backend);
        // only V2 is above the baseline version of 1
        assert_eq!(engine.migrate().unwrap(), 1);
        let rows = engine.info().unwrap();
        assert_eq!(
            states(&rows),
            vec![
                MigrationState::Baseline,
                MigrationState::Success
            ]
        );
        drop(engine);
        assert_eq!(backend.executed_scripts(), &["object:t2"]);
    }

    // S5: repeatable re-run on checksum change
    #[test]
    fn changed_repeatable_is_reapplied_and_history_kept() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![repeatable("rollup", "object:rollup_v1")]);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 1);
        drop(engine);

        let config = config_with(vec![repeatable("rollup", "object:rollup_v2")]);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 1);
        let rows = engine.info().unwrap();
        // both applications show: the superseded one and the current one
        assert_eq!(
            states(&rows),
            vec![MigrationState::Outdated, MigrationState::Success]
        );
        assert_eq!(engine.migrate().unwrap(), 0);
        drop(engine);

        let cfg = Config::default();
        let mut store = MetadataStore::new(&mut backend, &cfg);
        assert_eq!(store.all_applied().unwrap().len(), 2);
    }

    // S6: future migrations
    #[test]
    fn future_migration_warns_or_fails_by_configuration() {
        let mut backend = MemoryBackend::new();
        let all = vec![versioned("1", "object:t1"), versioned("9", "object:t9")];
        let config = config_with(all.clone());
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        drop(engine);

        let only_old = vec![versioned("1", "object:t1")];
        let config = config_with(only_old.clone());
        let mut engine = Engine::with_client(config, &mut backend);
        engine.validate().unwrap();
        drop(engine);

        let config = config_with(only_old).with_ignore_future(false);
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn migrate_honors_the_target_version() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![
            versioned("1", "object:t1"),
            versioned("2", "object:t2"),
            versioned("3", "object:t3"),
        ])
        .with_target(Target::Version("2".parse().unwrap()));
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 2);
        let rows = engine.info().unwrap();
        assert_eq!(rows[2].state, MigrationState::AboveTarget);
    }

    #[test]
    fn failed_migration_aborts_and_reports_progress() {
        let mut backend = MemoryBackend::new();
        backend.fail_when_contains("boom");
        let config = config_with(vec![
            versioned("1", "object:t1"),
            versioned("2", "boom"),
            versioned("3", "object:t3"),
        ]);
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.migrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);
        assert_eq!(err.applied_before_failure(), 1);
        drop(engine);
        // transactional backend: no failed entry is recorded
        let cfg = Config::default();
        let mut store = MetadataStore::new(&mut backend, &cfg);
        let entries = store.all_applied().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
    }

    #[test]
    fn non_transactional_failure_is_recorded_and_repair_clears_it() {
        let mut backend = MemoryBackend::new().non_transactional();
        backend.fail_when_contains("boom");
        let migrations = vec![versioned("1", "object:t1"), versioned("2", "boom")];
        let config = config_with(migrations.clone());
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.migrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MigrationFailed);

        let rows = engine.info().unwrap();
        assert_eq!(rows[1].state, MigrationState::Failed);

        // repair removes the failed entry, then migrate can retry
        engine.repair().unwrap();
        let rows = engine.info().unwrap();
        assert_eq!(rows[1].state, MigrationState::Pending);
        drop(engine);

        let retry = vec![versioned("1", "object:t1"), versioned("2", "object:t2")];
        let config = config_with(retry);
        let mut engine = Engine::with_client(config, &mut backend);
        assert_eq!(engine.migrate().unwrap(), 1);
    }

    #[test]
    fn repair_rewrites_drifted_checksums() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        drop(engine);

        let drifted = versioned("1", "object:t1_edited");
        let config = config_with(vec![drifted.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.repair().unwrap();
        engine.validate().unwrap();
        drop(engine);

        let cfg = Config::default();
        let mut store = MetadataStore::new(&mut backend, &cfg);
        let entries = store.all_applied().unwrap();
        assert_eq!(entries[0].checksum, drifted.checksum());
    }

    #[test]
    fn baseline_command_writes_one_marker() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.baseline().unwrap();
        let err = engine.baseline().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyBaselined);
    }

    #[test]
    fn clean_drops_user_objects_and_resets_history() {
        let mut backend = MemoryBackend::new();
        backend.create_object("pre_existing");
        let config = config_with(vec![versioned("1", "object:t1")])
            .with_baseline_on_migrate(true);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        engine.clean().unwrap();
        let rows = engine.info().unwrap();
        assert_eq!(states(&rows), vec![MigrationState::Pending]);
        drop(engine);
        assert!(backend.objects().is_empty());
    }

    #[test]
    fn clean_honors_the_schema_marker() {
        let mut backend = MemoryBackend::new();
        backend.create_object("user_data");
        backend.create_object("engine_made");
        let cfg = Config::default();
        {
            let mut store = MetadataStore::new(&mut backend, &cfg);
            store.create_if_absent().unwrap();
            store.add_schema_marker(&["engine_made".to_string()]).unwrap();
        }
        let config = config_with(vec![]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.clean().unwrap();
        drop(engine);
        // only the marker-listed object was dropped
        assert_eq!(backend.objects(), vec!["user_data".to_string()]);
    }

    #[test]
    fn clean_disabled_refuses() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![]).with_clean_disabled(true);
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.clean().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CleanDisabled);
    }

    #[test]
    fn clean_on_validation_error_recovers_migrate() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        drop(engine);

        let drifted = versioned("1", "object:t1_edited");
        let config = config_with(vec![drifted]).with_clean_on_validation_error(true);
        let mut engine = Engine::with_client(config, &mut backend);
        // validation fails, clean wipes, then the migration applies fresh
        assert_eq!(engine.migrate().unwrap(), 1);
        let rows = engine.info().unwrap();
        assert_eq!(states(&rows), vec![MigrationState::Success]);
    }

    #[test]
    fn commands_require_a_client() {
        let mut engine = Engine::new(config_with(vec![]));
        let err = engine.migrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConfigured);
    }

    #[test]
    fn invalid_configuration_is_rejected_up_front() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![]).with_separator("");
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.info().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    }

    #[test]
    fn lock_is_released_after_each_command() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        drop(engine);
        assert!(backend.lock_state().is_none());
    }

    #[test]
    fn command_fails_fast_when_lock_is_held_elsewhere() {
        let mut backend = MemoryBackend::new();
        backend.seize_lock("schema_version_lock", "other-instance");
        let config = config_with(vec![]).with_lock_timeout(Some(Duration::from_millis(250)));
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.info().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    struct Recorder(Mutex<Vec<String>>);

    impl Callback for Recorder {
        fn before_migrate(&self, _ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
            self.0.lock().unwrap().push("beforeMigrate".into());
            Ok(())
        }
        fn before_each_migrate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
            let name = ctx.migration.unwrap().script().to_string();
            self.0.lock().unwrap().push(format!("beforeEach:{name}"));
            Ok(())
        }
        fn after_each_migrate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
            let name = ctx.migration.unwrap().script().to_string();
            self.0.lock().unwrap().push(format!("afterEach:{name}"));
            Ok(())
        }
        fn after_migrate(&self, _ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
            self.0.lock().unwrap().push("afterMigrate".into());
            Ok(())
        }
    }

    #[test]
    fn callbacks_fire_around_migrate_in_order() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")])
            .with_callbacks(vec![recorder.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                "beforeMigrate",
                "beforeEach:V1__migration.sql",
                "afterEach:V1__migration.sql",
                "afterMigrate"
            ]
        );
    }

    struct Refusing;

    impl Callback for Refusing {
        fn before_migrate(&self, _ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
            Err(Error::backend("not today"))
        }
    }

    #[test]
    fn callback_failure_aborts_the_command_and_releases_the_lock() {
        let mut backend = MemoryBackend::new();
        let config = config_with(vec![versioned("1", "object:t1")])
            .with_callbacks(vec![Arc::new(Refusing)]);
        let mut engine = Engine::with_client(config, &mut backend);
        let err = engine.migrate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendError);
        drop(engine);
        assert!(backend.lock_state().is_none());
        assert!(backend.executed_scripts().is_empty());
    }

    #[test]
    fn legacy_layout_triggers_checksum_repair_before_the_command() {
        let mut backend = MemoryBackend::new();
        let migration = versioned("1", "object:t1");
        let config = config_with(vec![migration.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        engine.migrate().unwrap();
        drop(engine);

        // simulate an old layout whose stored checksum is stale
        backend.set_legacy_layout("schema_version");
        let edited = versioned("1", "object:t1_edited");
        let config = config_with(vec![edited.clone()]);
        let mut engine = Engine::with_client(config, &mut backend);
        // the envelope upgrades, repairs checksums, and validate then passes
        engine.validate().unwrap();
        drop(engine);

        let cfg = Config::default();
        let mut store = MetadataStore::new(&mut backend, &cfg);
        assert_eq!(
            store.all_applied().unwrap()[0].checksum,
            edited.checksum()
        );
    }

    // end-to-end through the sqlite backend and real script files
    #[test]
    fn sqlite_end_to_end_with_file_resolvers() {
        use std::fs;
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("V1__create_users.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        )
        .unwrap();
        fs::write(
            dir.path().join("V1_1__add_email.sql"),
            "ALTER TABLE users ADD COLUMN email TEXT;",
        )
        .unwrap();
        fs::write(
            dir.path().join("R__grownups_view.sql"),
            "CREATE VIEW IF NOT EXISTS grownups AS SELECT * FROM users;",
        )
        .unwrap();

        let config = Config::default()
            .with_url("sqlite::memory:")
            .with_locations([format!("filesystem:{}", dir.path().display())])
            .with_lock_timeout(Some(Duration::from_secs(2)));
        let mut engine = Engine::open(config).unwrap();
        assert_eq!(engine.migrate().unwrap(), 3);
        assert_eq!(engine.migrate().unwrap(), 0);
        engine.validate().unwrap();

        let rows = engine.info().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.state == MigrationState::Success));
        assert_eq!(
            rows.iter().map(|r| r.script().to_string()).collect::<Vec<_>>(),
            vec![
                "V1__create_users.sql",
                "V1_1__add_email.sql",
                "R__grownups_view.sql"
            ]
        );

        engine.clean().unwrap();
        let rows = engine.info().unwrap();
        assert!(rows.iter().all(|r| r.state == MigrationState::Pending));
    }
}
