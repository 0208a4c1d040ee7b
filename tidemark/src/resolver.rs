//! Migration resolution: turning configured sources into the canonical,
//! ordered set of migration descriptors.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::checksum;
use crate::config::Config;
use crate::error::{location_unreadable, Error};
use crate::migration::{MigrationDescriptor, SqlRunner};
use crate::version::VersionKey;

/// Enumerates available migrations from one source.
///
/// The engine combines the default file-backed resolvers with any
/// user-supplied ones; implementations must yield descriptors in a
/// deterministic order for a given configuration.
pub trait MigrationResolver: Send + Sync {
    fn resolve(&self, config: &Config) -> Result<Vec<Arc<MigrationDescriptor>>, Error>;
}

/// Compiled filename grammar for one configuration:
/// `<prefix><version><separator><description><suffix>` for versioned
/// scripts, `<repeatable_prefix><separator><description><suffix>` for
/// repeatable ones.
struct FilenamePattern {
    versioned: Regex,
    repeatable: Regex,
    separator: String,
}

enum ParsedName {
    Versioned(VersionKey, String),
    Repeatable(String),
}

impl FilenamePattern {
    fn new(config: &Config) -> Result<Self, Error> {
        let prefix = regex::escape(config.versioned_prefix());
        let repeatable_prefix = regex::escape(config.repeatable_prefix());
        let separator = regex::escape(config.separator());
        let suffix = regex::escape(config.suffix());
        let versioned = Regex::new(&format!("^{prefix}(.+?){separator}(.*){suffix}$"))
            .map_err(|e| Error::InvalidConfig(format!("unusable filename pattern: {e}")))?;
        let repeatable = Regex::new(&format!("^{repeatable_prefix}{separator}(.*){suffix}$"))
            .map_err(|e| Error::InvalidConfig(format!("unusable filename pattern: {e}")))?;
        Ok(FilenamePattern {
            versioned,
            repeatable,
            separator: config.separator().to_string(),
        })
    }

    /// Classify a filename. `None` means the name matches neither pattern
    /// and is silently ignored; a matching shape with a malformed version or
    /// description is an error.
    fn parse(&self, filename: &str) -> Result<Option<ParsedName>, Error> {
        if let Some(captures) = self.repeatable.captures(filename) {
            let description = self.description(filename, &captures[1])?;
            return Ok(Some(ParsedName::Repeatable(description)));
        }
        if let Some(captures) = self.versioned.captures(filename) {
            // underscores are a filename-safe alias for version dots
            let raw_version = captures[1].replace('_', ".");
            let version = VersionKey::parse(&raw_version)
                .map_err(|_| Error::invalid_version(format!("{filename}: {}", &captures[1])))?;
            let description = self.description(filename, &captures[2])?;
            return Ok(Some(ParsedName::Versioned(version, description)));
        }
        Ok(None)
    }

    fn description(&self, filename: &str, raw: &str) -> Result<String, Error> {
        let description = raw.replace('_', " ").trim().to_string();
        if description.is_empty() {
            return Err(Error::InvalidDescription(format!(
                "{filename}: description must not be empty"
            )));
        }
        if description.contains(self.separator.as_str()) {
            return Err(Error::InvalidDescription(format!(
                "{filename}: description must not contain the separator '{}'",
                self.separator
            )));
        }
        Ok(description)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanKind {
    Versioned,
    Repeatable,
}

/// Default file-backed resolver: scans every configured location for
/// migration scripts of one kind. Non-matching filenames are ignored.
pub struct DirectoryResolver {
    kind: ScanKind,
}

impl DirectoryResolver {
    pub fn versioned() -> Self {
        DirectoryResolver {
            kind: ScanKind::Versioned,
        }
    }

    pub fn repeatable() -> Self {
        DirectoryResolver {
            kind: ScanKind::Repeatable,
        }
    }

    fn read_body(&self, path: &Path, location: &str) -> Result<(String, i32), Error> {
        let bytes = fs::read(path).map_err(|e| location_unreadable(location, e))?;
        let checksum = checksum::compute(&bytes);
        let text = String::from_utf8(bytes).map_err(|_| {
            location_unreadable(
                location,
                format!("{} is not valid UTF-8", path.display()),
            )
        })?;
        let body = text.strip_prefix('\u{feff}').unwrap_or(&text).to_string();
        Ok((body, checksum))
    }
}

impl MigrationResolver for DirectoryResolver {
    fn resolve(&self, config: &Config) -> Result<Vec<Arc<MigrationDescriptor>>, Error> {
        let pattern = FilenamePattern::new(config)?;
        let runner = Arc::new(SqlRunner);
        let mut out: Vec<Arc<MigrationDescriptor>> = Vec::new();

        for location in config.locations() {
            let directories = location.directories(config.resource_roots());
            let existing: Vec<_> = directories.iter().filter(|d| d.is_dir()).collect();
            if existing.is_empty() {
                return Err(location_unreadable(
                    location.to_string(),
                    "no such directory",
                ));
            }
            for dir in existing {
                let entries =
                    fs::read_dir(dir).map_err(|e| location_unreadable(location.to_string(), e))?;
                let mut paths: Vec<_> = entries
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| location_unreadable(location.to_string(), e))?
                    .into_iter()
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                paths.sort();
                for path in paths {
                    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let parsed = match pattern.parse(filename)? {
                        Some(parsed) => parsed,
                        None => continue,
                    };
                    let descriptor = match (self.kind, parsed) {
                        (ScanKind::Versioned, ParsedName::Versioned(version, description)) => {
                            let (body, checksum) =
                                self.read_body(&path, &location.to_string())?;
                            MigrationDescriptor::versioned(
                                version,
                                description,
                                filename,
                                path.display().to_string(),
                                body,
                                Some(checksum),
                                runner.clone(),
                            )?
                        }
                        (ScanKind::Repeatable, ParsedName::Repeatable(description)) => {
                            let (body, checksum) =
                                self.read_body(&path, &location.to_string())?;
                            MigrationDescriptor::repeatable(
                                description,
                                filename,
                                path.display().to_string(),
                                body,
                                Some(checksum),
                                runner.clone(),
                            )?
                        }
                        _ => continue,
                    };
                    out.push(Arc::new(descriptor));
                }
            }
        }
        Ok(out)
    }
}

/// Merges the default resolvers with user-supplied ones, rejects duplicate
/// identities and produces the canonical ordering: versioned migrations by
/// version ascending, then repeatable migrations by description ascending.
pub struct CompositeResolver {
    resolvers: Vec<Arc<dyn MigrationResolver>>,
}

impl CompositeResolver {
    pub fn from_config(config: &Config) -> Self {
        let mut resolvers: Vec<Arc<dyn MigrationResolver>> = Vec::new();
        if !config.skip_default_resolvers() {
            resolvers.push(Arc::new(DirectoryResolver::versioned()));
            resolvers.push(Arc::new(DirectoryResolver::repeatable()));
        }
        resolvers.extend(config.resolvers().iter().cloned());
        CompositeResolver { resolvers }
    }

    pub fn resolve(&self, config: &Config) -> Result<Vec<Arc<MigrationDescriptor>>, Error> {
        let mut all: Vec<Arc<MigrationDescriptor>> = Vec::new();
        for resolver in &self.resolvers {
            all.extend(resolver.resolve(config)?);
        }

        {
            let mut seen = HashMap::new();
            for descriptor in &all {
                if let Some(previous) = seen.insert(descriptor.identity(), descriptor) {
                    return Err(Error::DuplicateMigration(format!(
                        "{} and {} resolve to the same migration",
                        previous.location(),
                        descriptor.location()
                    )));
                }
            }
        }

        all.sort_by(|a, b| match (a.version(), b.version()) {
            (Some(va), Some(vb)) => va.cmp(vb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.description().cmp(b.description()),
        });
        Ok(all)
    }
}
