//! The per-version state view: resolved descriptors joined with recorded
//! history. Rebuilt from scratch on every command, never persisted.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::migration::{MigrationDescriptor, MigrationKind};
use crate::store::AppliedEntry;
use crate::version::{Target, VersionKey};

/// State of one migration relative to the current history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Resolved, not applied, eligible to apply.
    Pending,
    /// Resolved, not applied, and above the configured target.
    AboveTarget,
    /// Resolved, not applied, and below the newest applied version (or below
    /// the baseline); will not be applied without `out_of_order`.
    Ignored,
    /// Applied by a newer deployment; unknown to this one.
    Future,
    /// Applied, but the resolved script has a different checksum. Repeatable
    /// migrations in this state are re-applied; versioned ones fail
    /// validation.
    Outdated,
    /// Applied at or below the baseline; inert.
    Superseded,
    Success,
    Failed,
    /// Applied successfully, but no longer resolvable.
    MissingSuccess,
    /// Applied and failed, and no longer resolvable.
    MissingFailed,
    /// Resolved below the newest applied version and eligible to apply
    /// because `out_of_order` is enabled.
    OutOfOrder,
    Baseline,
}

impl MigrationState {
    pub fn display_name(self) -> &'static str {
        match self {
            MigrationState::Pending => "Pending",
            MigrationState::AboveTarget => "Above Target",
            MigrationState::Ignored => "Ignored",
            MigrationState::Future => "Future",
            MigrationState::Outdated => "Outdated",
            MigrationState::Superseded => "Superseded",
            MigrationState::Success => "Success",
            MigrationState::Failed => "Failed",
            MigrationState::MissingSuccess => "Missing",
            MigrationState::MissingFailed => "Missing (Failed)",
            MigrationState::OutOfOrder => "Out of Order",
            MigrationState::Baseline => "Baseline",
        }
    }

    /// Whether migrate should apply a migration in this state.
    pub fn is_applicable(self) -> bool {
        matches!(
            self,
            MigrationState::Pending | MigrationState::OutOfOrder | MigrationState::Outdated
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// One row of the joined view: a resolved descriptor, its applied entry, or
/// both.
#[derive(Debug, Clone)]
pub struct InfoRow {
    pub descriptor: Option<Arc<MigrationDescriptor>>,
    pub applied: Option<AppliedEntry>,
    pub state: MigrationState,
}

impl InfoRow {
    pub fn version(&self) -> Option<&VersionKey> {
        self.applied
            .as_ref()
            .and_then(|e| e.version.as_ref())
            .or_else(|| self.descriptor.as_ref().and_then(|d| d.version()))
    }

    pub fn description(&self) -> &str {
        if let Some(entry) = &self.applied {
            &entry.description
        } else if let Some(descriptor) = &self.descriptor {
            descriptor.description()
        } else {
            ""
        }
    }

    pub fn kind(&self) -> MigrationKind {
        if let Some(entry) = &self.applied {
            entry.kind
        } else if let Some(descriptor) = &self.descriptor {
            descriptor.kind()
        } else {
            MigrationKind::Versioned
        }
    }

    pub fn script(&self) -> &str {
        if let Some(entry) = &self.applied {
            &entry.script
        } else if let Some(descriptor) = &self.descriptor {
            descriptor.script()
        } else {
            ""
        }
    }
}

/// Upper bound on what migrate may apply, after resolving the target
/// sentinels against the current history.
enum TargetBound {
    Unlimited,
    UpTo(VersionKey),
    Nothing,
}

impl TargetBound {
    fn excludes(&self, version: &VersionKey) -> bool {
        match self {
            TargetBound::Unlimited => false,
            TargetBound::UpTo(bound) => version > bound,
            TargetBound::Nothing => true,
        }
    }
}

/// Join resolver output with the applied history into the ordered state
/// view: schema marker first, then versioned rows by version, then
/// repeatable rows by description.
pub(crate) fn build_info(
    resolved: &[Arc<MigrationDescriptor>],
    applied: &[AppliedEntry],
    config: &Config,
) -> Vec<InfoRow> {
    let baseline_version: Option<&VersionKey> = applied
        .iter()
        .find(|e| e.kind == MigrationKind::Baseline)
        .and_then(|e| e.version.as_ref());
    let max_applied: Option<&VersionKey> = applied
        .iter()
        .filter(|e| {
            e.success && matches!(e.kind, MigrationKind::Versioned | MigrationKind::Baseline)
        })
        .filter_map(|e| e.version.as_ref())
        .max();
    let max_resolved: Option<&VersionKey> = resolved.iter().filter_map(|d| d.version()).max();

    let bound = match config.target() {
        Target::Latest => TargetBound::Unlimited,
        Target::Current => match max_applied {
            Some(version) => TargetBound::UpTo(version.clone()),
            None => TargetBound::Nothing,
        },
        Target::Version(version) => TargetBound::UpTo(version.clone()),
    };

    let versioned_by_version: HashMap<&VersionKey, &Arc<MigrationDescriptor>> = resolved
        .iter()
        .filter(|d| d.kind() == MigrationKind::Versioned)
        .filter_map(|d| d.version().map(|v| (v, d)))
        .collect();
    let repeatable_by_description: HashMap<&str, &Arc<MigrationDescriptor>> = resolved
        .iter()
        .filter(|d| d.kind() == MigrationKind::Repeatable)
        .map(|d| (d.description(), d))
        .collect();

    // rank of the newest application per repeatable description
    let mut latest_repeatable: HashMap<&str, i64> = HashMap::new();
    for entry in applied {
        if entry.kind == MigrationKind::Repeatable {
            let rank = latest_repeatable
                .entry(entry.description.as_str())
                .or_insert(entry.install_rank);
            *rank = (*rank).max(entry.install_rank);
        }
    }

    let mut joined_versions: HashSet<&VersionKey> = HashSet::new();
    let mut joined_descriptions: HashSet<&str> = HashSet::new();
    let mut rows: Vec<InfoRow> = Vec::new();

    for entry in applied {
        let row = match entry.kind {
            MigrationKind::SchemaMarker => InfoRow {
                descriptor: None,
                applied: Some(entry.clone()),
                state: MigrationState::Success,
            },
            MigrationKind::Baseline => {
                let descriptor = entry
                    .version
                    .as_ref()
                    .and_then(|v| versioned_by_version.get(v));
                if let Some(version) = entry.version.as_ref() {
                    joined_versions.insert(version);
                }
                InfoRow {
                    descriptor: descriptor.map(|d| Arc::clone(d)),
                    applied: Some(entry.clone()),
                    state: MigrationState::Baseline,
                }
            }
            MigrationKind::Versioned => {
                let descriptor = entry
                    .version
                    .as_ref()
                    .and_then(|v| versioned_by_version.get(v));
                if let Some(version) = entry.version.as_ref() {
                    joined_versions.insert(version);
                }
                let state = versioned_state(
                    entry,
                    descriptor.is_some(),
                    descriptor.and_then(|d| d.checksum()),
                    baseline_version,
                    max_resolved,
                );
                InfoRow {
                    descriptor: descriptor.map(|d| Arc::clone(d)),
                    applied: Some(entry.clone()),
                    state,
                }
            }
            MigrationKind::Repeatable => {
                let descriptor = repeatable_by_description.get(entry.description.as_str());
                joined_descriptions.insert(entry.description.as_str());
                let is_latest = latest_repeatable
                    .get(entry.description.as_str())
                    .is_some_and(|rank| *rank == entry.install_rank);
                let state = repeatable_state(
                    entry,
                    descriptor.is_some(),
                    descriptor.and_then(|d| d.checksum()),
                    is_latest,
                );
                InfoRow {
                    descriptor: descriptor.map(|d| Arc::clone(d)),
                    applied: Some(entry.clone()),
                    state,
                }
            }
        };
        rows.push(row);
    }

    for descriptor in resolved {
        match descriptor.kind() {
            MigrationKind::Versioned => {
                let Some(version) = descriptor.version() else {
                    continue;
                };
                if joined_versions.contains(version) {
                    continue;
                }
                let state = if baseline_version.is_some_and(|b| version <= b) {
                    MigrationState::Ignored
                } else if bound.excludes(version) {
                    MigrationState::AboveTarget
                } else if max_applied.is_some_and(|m| version < m) {
                    if config.out_of_order() {
                        MigrationState::OutOfOrder
                    } else {
                        MigrationState::Ignored
                    }
                } else {
                    MigrationState::Pending
                };
                rows.push(InfoRow {
                    descriptor: Some(Arc::clone(descriptor)),
                    applied: None,
                    state,
                });
            }
            MigrationKind::Repeatable => {
                if joined_descriptions.contains(descriptor.description()) {
                    continue;
                }
                rows.push(InfoRow {
                    descriptor: Some(Arc::clone(descriptor)),
                    applied: None,
                    state: MigrationState::Pending,
                });
            }
            _ => {}
        }
    }

    rows.sort_by(|a, b| row_class(a).cmp(&row_class(b)));
    rows
}

/// Ordering key: schema marker, then versioned rows by version, then
/// repeatable rows by description, ties broken by install rank.
fn row_class(row: &InfoRow) -> (u8, Option<VersionKey>, String, i64) {
    let rank = row.applied.as_ref().map(|e| e.install_rank).unwrap_or(i64::MAX);
    match (row.kind(), row.version()) {
        (MigrationKind::SchemaMarker, _) => (0, None, String::new(), rank),
        (_, Some(version)) => (1, Some(version.clone()), String::new(), rank),
        (_, None) => (2, None, row.description().to_string(), rank),
    }
}

fn versioned_state(
    entry: &AppliedEntry,
    resolvable: bool,
    resolved_checksum: Option<i32>,
    baseline_version: Option<&VersionKey>,
    max_resolved: Option<&VersionKey>,
) -> MigrationState {
    if !resolvable {
        let future = match (entry.version.as_ref(), max_resolved) {
            (Some(version), Some(max)) => version > max,
            (Some(_), None) => true,
            _ => false,
        };
        if future {
            return MigrationState::Future;
        }
        return if entry.success {
            MigrationState::MissingSuccess
        } else {
            MigrationState::MissingFailed
        };
    }
    if !entry.success {
        return MigrationState::Failed;
    }
    if let (Some(version), Some(baseline)) = (entry.version.as_ref(), baseline_version) {
        if version <= baseline {
            return MigrationState::Superseded;
        }
    }
    if entry.checksum != resolved_checksum {
        return MigrationState::Outdated;
    }
    MigrationState::Success
}

fn repeatable_state(
    entry: &AppliedEntry,
    resolvable: bool,
    resolved_checksum: Option<i32>,
    is_latest: bool,
) -> MigrationState {
    if !resolvable {
        return if entry.success {
            MigrationState::MissingSuccess
        } else {
            MigrationState::MissingFailed
        };
    }
    if !entry.success {
        return MigrationState::Failed;
    }
    if !is_latest {
        return MigrationState::Outdated;
    }
    if entry.checksum != resolved_checksum {
        return MigrationState::Outdated;
    }
    MigrationState::Success
}
