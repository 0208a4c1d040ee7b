use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::callback::Callback;
use crate::error::Error;
use crate::resolver::MigrationResolver;
use crate::version::{Target, VersionKey};

/// Where migration scripts are read from.
///
/// `filesystem:` locations name a directory directly; `classpath:` (and
/// unprefixed) locations are package-style paths resolved against every
/// configured resource root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Classpath(String),
    Filesystem(PathBuf),
}

impl Location {
    pub fn parse(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix("filesystem:") {
            Location::Filesystem(PathBuf::from(path))
        } else if let Some(path) = raw.strip_prefix("classpath:") {
            Location::Classpath(path.to_string())
        } else {
            Location::Classpath(raw.to_string())
        }
    }

    /// Candidate directories for this location.
    pub fn directories(&self, resource_roots: &[PathBuf]) -> Vec<PathBuf> {
        match self {
            Location::Filesystem(path) => vec![path.clone()],
            Location::Classpath(path) => {
                resource_roots.iter().map(|root| root.join(path)).collect()
            }
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Classpath(path) => write!(f, "classpath:{path}"),
            Location::Filesystem(path) => write!(f, "filesystem:{}", path.display()),
        }
    }
}

/// Immutable parameter bundle consumed by every component of the engine.
///
/// Construct once per engine instance, either through the `with_*` builder
/// methods or from key/value properties via [Config::apply_properties]:
///
/// ```
/// use tidemark::Config;
///
/// let config = Config::default()
///     .with_locations(["filesystem:migrations"])
///     .with_table("schema_version")
///     .with_out_of_order(true);
/// assert!(config.out_of_order());
/// ```
#[derive(Clone)]
pub struct Config {
    url: Option<String>,
    locations: Vec<Location>,
    encoding: String,
    table: String,
    target: Target,
    versioned_prefix: String,
    repeatable_prefix: String,
    separator: String,
    suffix: String,
    ignore_future: bool,
    validate_on_migrate: bool,
    clean_on_validation_error: bool,
    clean_disabled: bool,
    baseline_version: VersionKey,
    baseline_description: String,
    baseline_on_migrate: bool,
    out_of_order: bool,
    allow_mixed: bool,
    skip_default_callbacks: bool,
    skip_default_resolvers: bool,
    resolvers: Vec<Arc<dyn MigrationResolver>>,
    callbacks: Vec<Arc<dyn Callback>>,
    installed_by: Option<String>,
    lock_timeout: Option<Duration>,
    resource_roots: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: None,
            locations: vec![Location::Classpath("db/migration".into())],
            encoding: "UTF-8".into(),
            table: "schema_version".into(),
            target: Target::Latest,
            versioned_prefix: "V".into(),
            repeatable_prefix: "R".into(),
            separator: "__".into(),
            suffix: ".sql".into(),
            ignore_future: true,
            validate_on_migrate: true,
            clean_on_validation_error: false,
            clean_disabled: false,
            baseline_version: VersionKey::from(1),
            baseline_description: "<< Baseline >>".into(),
            baseline_on_migrate: false,
            out_of_order: false,
            allow_mixed: false,
            skip_default_callbacks: false,
            skip_default_resolvers: false,
            resolvers: Vec::new(),
            callbacks: Vec::new(),
            installed_by: None,
            lock_timeout: None,
            resource_roots: vec![PathBuf::from(".")],
        }
    }
}

impl Config {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.locations = locations
            .into_iter()
            .map(|raw| Location::parse(raw.as_ref()))
            .collect();
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    /// Name of the metadata collection. Defaults to `schema_version`.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_versioned_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.versioned_prefix = prefix.into();
        self
    }

    pub fn with_repeatable_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.repeatable_prefix = prefix.into();
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn with_ignore_future(mut self, ignore_future: bool) -> Self {
        self.ignore_future = ignore_future;
        self
    }

    pub fn with_validate_on_migrate(mut self, validate_on_migrate: bool) -> Self {
        self.validate_on_migrate = validate_on_migrate;
        self
    }

    pub fn with_clean_on_validation_error(mut self, clean_on_validation_error: bool) -> Self {
        self.clean_on_validation_error = clean_on_validation_error;
        self
    }

    pub fn with_clean_disabled(mut self, clean_disabled: bool) -> Self {
        self.clean_disabled = clean_disabled;
        self
    }

    pub fn with_baseline_version(mut self, version: VersionKey) -> Self {
        self.baseline_version = version;
        self
    }

    pub fn with_baseline_description(mut self, description: impl Into<String>) -> Self {
        self.baseline_description = description.into();
        self
    }

    pub fn with_baseline_on_migrate(mut self, baseline_on_migrate: bool) -> Self {
        self.baseline_on_migrate = baseline_on_migrate;
        self
    }

    pub fn with_out_of_order(mut self, out_of_order: bool) -> Self {
        self.out_of_order = out_of_order;
        self
    }

    pub fn with_allow_mixed(mut self, allow_mixed: bool) -> Self {
        self.allow_mixed = allow_mixed;
        self
    }

    pub fn with_skip_default_callbacks(mut self, skip: bool) -> Self {
        self.skip_default_callbacks = skip;
        self
    }

    pub fn with_skip_default_resolvers(mut self, skip: bool) -> Self {
        self.skip_default_resolvers = skip;
        self
    }

    /// Custom resolvers, consulted after the default ones in the order
    /// given.
    pub fn with_resolvers(mut self, resolvers: Vec<Arc<dyn MigrationResolver>>) -> Self {
        self.resolvers = resolvers;
        self
    }

    /// Custom callbacks, fired after the default ones in the order given.
    pub fn with_callbacks(mut self, callbacks: Vec<Arc<dyn Callback>>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_installed_by(mut self, installed_by: impl Into<String>) -> Self {
        self.installed_by = Some(installed_by.into());
        self
    }

    /// How long lock acquisition may wait. `None` waits indefinitely with
    /// periodic retry.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Search path backing `classpath:` locations. Defaults to the current
    /// directory.
    pub fn with_resource_roots<I, P>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.resource_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Overlay key/value properties onto this configuration. Recognized
    /// keys use the `tidemark.` prefix; unknown `tidemark.*` keys log a
    /// warning and are ignored, anything else is ignored silently.
    pub fn apply_properties<I, K, V>(mut self, properties: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in properties {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "tidemark.url" => self.url = Some(value.to_string()),
                "tidemark.locations" => {
                    self.locations = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(Location::parse)
                        .collect();
                }
                "tidemark.encoding" => self.encoding = value.to_string(),
                "tidemark.table" => self.table = value.to_string(),
                "tidemark.target" => self.target = Target::parse(value)?,
                "tidemark.sqlMigrationPrefix" => self.versioned_prefix = value.to_string(),
                "tidemark.repeatableSqlMigrationPrefix" => {
                    self.repeatable_prefix = value.to_string()
                }
                "tidemark.sqlMigrationSeparator" => self.separator = value.to_string(),
                "tidemark.sqlMigrationSuffix" => self.suffix = value.to_string(),
                "tidemark.ignoreFutureMigrations" => {
                    self.ignore_future = parse_bool(key, value)?
                }
                "tidemark.validateOnMigrate" => {
                    self.validate_on_migrate = parse_bool(key, value)?
                }
                "tidemark.cleanOnValidationError" => {
                    self.clean_on_validation_error = parse_bool(key, value)?
                }
                "tidemark.cleanDisabled" => self.clean_disabled = parse_bool(key, value)?,
                "tidemark.baselineVersion" => {
                    self.baseline_version = VersionKey::parse(value)?
                }
                "tidemark.baselineDescription" => {
                    self.baseline_description = value.to_string()
                }
                "tidemark.baselineOnMigrate" => {
                    self.baseline_on_migrate = parse_bool(key, value)?
                }
                "tidemark.outOfOrder" => self.out_of_order = parse_bool(key, value)?,
                "tidemark.allowMixed" => self.allow_mixed = parse_bool(key, value)?,
                "tidemark.skipDefaultCallbacks" => {
                    self.skip_default_callbacks = parse_bool(key, value)?
                }
                "tidemark.skipDefaultResolvers" => {
                    self.skip_default_resolvers = parse_bool(key, value)?
                }
                "tidemark.installedBy" => self.installed_by = Some(value.to_string()),
                "tidemark.lockTimeout" => {
                    let seconds: u64 = value.parse().map_err(|_| {
                        Error::InvalidConfig(format!("{key} must be a number of seconds"))
                    })?;
                    self.lock_timeout = Some(Duration::from_secs(seconds));
                }
                other if other.starts_with("tidemark.") => {
                    tracing::warn!(key = other, "unknown configuration property, ignoring");
                }
                _ => {}
            }
        }
        Ok(self)
    }

    /// Check cross-field invariants. Called once per command by the engine.
    pub fn validate(&self) -> Result<(), Error> {
        if self.separator.is_empty() {
            return Err(Error::InvalidConfig("separator must not be empty".into()));
        }
        if self.table.is_empty() {
            return Err(Error::InvalidConfig(
                "metadata table name must not be empty".into(),
            ));
        }
        let encoding = self.encoding.to_ascii_lowercase();
        if encoding != "utf-8" && encoding != "utf8" {
            return Err(Error::InvalidConfig(format!(
                "unsupported encoding '{}': only UTF-8 is supported",
                self.encoding
            )));
        }
        Ok(())
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn versioned_prefix(&self) -> &str {
        &self.versioned_prefix
    }

    pub fn repeatable_prefix(&self) -> &str {
        &self.repeatable_prefix
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn ignore_future(&self) -> bool {
        self.ignore_future
    }

    pub fn validate_on_migrate(&self) -> bool {
        self.validate_on_migrate
    }

    pub fn clean_on_validation_error(&self) -> bool {
        self.clean_on_validation_error
    }

    pub fn clean_disabled(&self) -> bool {
        self.clean_disabled
    }

    pub fn baseline_version(&self) -> &VersionKey {
        &self.baseline_version
    }

    pub fn baseline_description(&self) -> &str {
        &self.baseline_description
    }

    pub fn baseline_on_migrate(&self) -> bool {
        self.baseline_on_migrate
    }

    pub fn out_of_order(&self) -> bool {
        self.out_of_order
    }

    pub fn allow_mixed(&self) -> bool {
        self.allow_mixed
    }

    pub fn skip_default_callbacks(&self) -> bool {
        self.skip_default_callbacks
    }

    pub fn skip_default_resolvers(&self) -> bool {
        self.skip_default_resolvers
    }

    pub fn resolvers(&self) -> &[Arc<dyn MigrationResolver>] {
        &self.resolvers
    }

    pub fn callbacks(&self) -> &[Arc<dyn Callback>] {
        &self.callbacks
    }

    pub fn installed_by(&self) -> Option<&str> {
        self.installed_by.as_deref()
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout
    }

    pub fn resource_roots(&self) -> &[PathBuf] {
        &self.resource_roots
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::InvalidConfig(format!(
            "{key} must be 'true' or 'false', got '{other}'"
        ))),
    }
}

// Manual Debug impl since resolvers and callbacks are trait objects
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("url", &self.url)
            .field("locations", &self.locations)
            .field("encoding", &self.encoding)
            .field("table", &self.table)
            .field("target", &self.target)
            .field("versioned_prefix", &self.versioned_prefix)
            .field("repeatable_prefix", &self.repeatable_prefix)
            .field("separator", &self.separator)
            .field("suffix", &self.suffix)
            .field("ignore_future", &self.ignore_future)
            .field("validate_on_migrate", &self.validate_on_migrate)
            .field("clean_on_validation_error", &self.clean_on_validation_error)
            .field("clean_disabled", &self.clean_disabled)
            .field("baseline_version", &self.baseline_version)
            .field("baseline_on_migrate", &self.baseline_on_migrate)
            .field("out_of_order", &self.out_of_order)
            .field("allow_mixed", &self.allow_mixed)
            .field("skip_default_callbacks", &self.skip_default_callbacks)
            .field("skip_default_resolvers", &self.skip_default_resolvers)
            .field("resolvers", &self.resolvers.len())
            .field("callbacks", &self.callbacks.len())
            .field("installed_by", &self.installed_by)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
