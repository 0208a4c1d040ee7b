use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::Error;
use crate::version::VersionKey;

/// What kind of row a migration or metadata entry is.
///
/// `Baseline` and `SchemaMarker` never come out of a resolver; they only
/// exist as distinguished entries in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationKind {
    Versioned,
    Repeatable,
    Baseline,
    SchemaMarker,
}

impl MigrationKind {
    /// The stored `type` column value.
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationKind::Versioned => "VERSIONED",
            MigrationKind::Repeatable => "REPEATABLE",
            MigrationKind::Baseline => "BASELINE",
            MigrationKind::SchemaMarker => "SCHEMA",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "VERSIONED" => Ok(MigrationKind::Versioned),
            "REPEATABLE" => Ok(MigrationKind::Repeatable),
            "BASELINE" => Ok(MigrationKind::Baseline),
            "SCHEMA" => Ok(MigrationKind::SchemaMarker),
            other => Err(Error::backend(format!("unknown migration type '{other}'"))),
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes one migration body against a backend.
///
/// The default runner hands SQL text to the backend verbatim; user-supplied
/// resolvers may attach their own runner to interpret other script kinds.
pub trait ScriptRunner: Send + Sync {
    /// Short tag identifying the interpreter, recorded for observability.
    fn tag(&self) -> &str;

    /// Run the migration body. `atomic` asks for all-or-nothing execution
    /// where the backend can provide it; it is false when mixed
    /// transactional/non-transactional statements are allowed.
    fn run(
        &self,
        backend: &mut dyn Backend,
        migration: &MigrationDescriptor,
        atomic: bool,
    ) -> Result<(), Error>;
}

/// The built-in runner for file-based SQL migrations.
pub struct SqlRunner;

impl ScriptRunner for SqlRunner {
    fn tag(&self) -> &str {
        "sql"
    }

    fn run(
        &self,
        backend: &mut dyn Backend,
        migration: &MigrationDescriptor,
        atomic: bool,
    ) -> Result<(), Error> {
        backend.execute_script(migration.body(), atomic)
    }
}

/// A resolved migration: everything the engine needs to order, validate and
/// apply one unit of schema change. Descriptors are shared immutable values;
/// resolvers hand them out as `Arc<MigrationDescriptor>`.
pub struct MigrationDescriptor {
    version: Option<VersionKey>,
    description: String,
    kind: MigrationKind,
    script: String,
    checksum: Option<i32>,
    location: String,
    body: String,
    runner: Arc<dyn ScriptRunner>,
}

impl MigrationDescriptor {
    /// A versioned migration, applied at most once.
    pub fn versioned(
        version: VersionKey,
        description: impl Into<String>,
        script: impl Into<String>,
        location: impl Into<String>,
        body: impl Into<String>,
        checksum: Option<i32>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Self, Error> {
        Self::build(
            Some(version),
            MigrationKind::Versioned,
            description,
            script,
            location,
            body,
            checksum,
            runner,
        )
    }

    /// A repeatable migration, re-applied whenever its checksum changes.
    pub fn repeatable(
        description: impl Into<String>,
        script: impl Into<String>,
        location: impl Into<String>,
        body: impl Into<String>,
        checksum: Option<i32>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Self, Error> {
        Self::build(
            None,
            MigrationKind::Repeatable,
            description,
            script,
            location,
            body,
            checksum,
            runner,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        version: Option<VersionKey>,
        kind: MigrationKind,
        description: impl Into<String>,
        script: impl Into<String>,
        location: impl Into<String>,
        body: impl Into<String>,
        checksum: Option<i32>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Result<Self, Error> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(Error::InvalidDescription(
                "description must not be empty".into(),
            ));
        }
        Ok(MigrationDescriptor {
            version,
            description,
            kind,
            script: script.into(),
            checksum,
            location: location.into(),
            body: body.into(),
            runner,
        })
    }

    /// The version, or `None` for repeatable migrations.
    pub fn version(&self) -> Option<&VersionKey> {
        self.version.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn kind(&self) -> MigrationKind {
        self.kind
    }

    /// Logical script identifier, e.g. the file name.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn checksum(&self) -> Option<i32> {
        self.checksum
    }

    /// Where the script physically came from.
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Tag of the interpreter that executes this migration.
    pub fn executor_tag(&self) -> &str {
        self.runner.tag()
    }

    pub(crate) fn run(&self, backend: &mut dyn Backend, atomic: bool) -> Result<(), Error> {
        self.runner.run(backend, self, atomic)
    }

    /// Identity under which duplicates are detected and history is matched:
    /// version for versioned migrations, description for repeatable ones.
    pub(crate) fn identity(&self) -> (MigrationKind, Option<&VersionKey>, &str) {
        match self.kind {
            MigrationKind::Versioned => (self.kind, self.version.as_ref(), ""),
            _ => (self.kind, None, self.description.as_str()),
        }
    }

    /// Human-oriented name used in log and error messages.
    pub fn display_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{} (version {})", self.script, v),
            None => format!("{} (repeatable)", self.script),
        }
    }
}

// Manual Debug impl since the runner is a trait object
impl fmt::Debug for MigrationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationDescriptor")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("kind", &self.kind)
            .field("script", &self.script)
            .field("checksum", &self.checksum)
            .field("location", &self.location)
            .field("executor_tag", &self.runner.tag())
            .finish()
    }
}

impl PartialEq for MigrationDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.description == other.description
            && self.kind == other.kind
            && self.script == other.script
            && self.checksum == other.checksum
    }
}
