//! Validation of the joined state view: detects drift between what was
//! applied and what resolves today.

use crate::error::Error;
use crate::info::{InfoRow, MigrationState};
use crate::migration::MigrationKind;

/// Knobs for one validation pass. The `validate` command treats pending
/// migrations as an error; validation-on-migrate does not.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ValidationPolicy {
    pub pending_not_ok: bool,
    pub ignore_future: bool,
}

/// Check the rows in order and return the first offending one as a typed
/// error. Warnings (downgraded future migrations) are returned on success.
pub(crate) fn validate(
    rows: &[InfoRow],
    policy: ValidationPolicy,
) -> Result<Vec<String>, Error> {
    let mut warnings = Vec::new();

    for row in rows {
        if let (Some(descriptor), Some(entry)) = (&row.descriptor, &row.applied) {
            if entry.kind != MigrationKind::Baseline && descriptor.kind() != entry.kind {
                return Err(Error::ValidationFailed(format!(
                    "migration {} changed type from {} to {}",
                    row.script(),
                    entry.kind,
                    descriptor.kind()
                )));
            }
            if entry.kind == MigrationKind::Versioned
                && descriptor.description() != entry.description
            {
                return Err(Error::ValidationFailed(format!(
                    "migration version {} changed description from '{}' to '{}'",
                    row.version().map(ToString::to_string).unwrap_or_default(),
                    entry.description,
                    descriptor.description()
                )));
            }
        }

        match row.state {
            MigrationState::Outdated if row.kind() == MigrationKind::Versioned => {
                return Err(Error::ChecksumMismatch {
                    script: row.script().to_string(),
                    stored: row.applied.as_ref().and_then(|e| e.checksum),
                    resolved: row.descriptor.as_ref().and_then(|d| d.checksum()),
                });
            }
            MigrationState::MissingSuccess | MigrationState::MissingFailed => {
                return Err(Error::MissingAppliedScript(row.script().to_string()));
            }
            MigrationState::Future => {
                let name = format!(
                    "{} (version {})",
                    row.script(),
                    row.version().map(ToString::to_string).unwrap_or_default()
                );
                if policy.ignore_future {
                    tracing::warn!(
                        migration = %name,
                        "applied migration is newer than any resolved migration"
                    );
                    warnings.push(format!("future migration: {name}"));
                } else {
                    return Err(Error::FutureMigration(name));
                }
            }
            MigrationState::Pending | MigrationState::OutOfOrder
                if policy.pending_not_ok =>
            {
                return Err(Error::ValidationFailed(format!(
                    "migration {} is resolved but has not been applied",
                    row.script()
                )));
            }
            MigrationState::Outdated if policy.pending_not_ok => {
                // a repeatable migration awaiting re-application
                return Err(Error::ValidationFailed(format!(
                    "repeatable migration {} has changed and has not been re-applied",
                    row.script()
                )));
            }
            _ => {}
        }
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::info::build_info;
    use crate::migration::{MigrationDescriptor, SqlRunner};
    use crate::store::AppliedEntry;
    use chrono::Utc;
    use std::sync::Arc;

    const LENIENT: ValidationPolicy = ValidationPolicy {
        pending_not_ok: false,
        ignore_future: true,
    };
    const STRICT: ValidationPolicy = ValidationPolicy {
        pending_not_ok: true,
        ignore_future: false,
    };

    fn descriptor(version: &str, description: &str, checksum: i32) -> Arc<MigrationDescriptor> {
        Arc::new(
            MigrationDescriptor::versioned(
                version.parse().unwrap(),
                description,
                format!("V{version}__{}.sql", description.replace(' ', "_")),
                "filesystem:migrations",
                "SELECT 1;",
                Some(checksum),
                Arc::new(SqlRunner),
            )
            .unwrap(),
        )
    }

    fn applied(version: &str, description: &str, checksum: i32) -> AppliedEntry {
        AppliedEntry {
            install_rank: 1,
            version: Some(version.parse().unwrap()),
            description: description.into(),
            kind: crate::migration::MigrationKind::Versioned,
            script: format!("V{version}__{}.sql", description.replace(' ', "_")),
            checksum: Some(checksum),
            installed_by: "tester".into(),
            installed_on: Utc::now(),
            execution_time_ms: 1,
            success: true,
        }
    }

    #[test]
    fn clean_history_validates() {
        let resolved = vec![descriptor("1", "one", 10)];
        let rows = build_info(&resolved, &[applied("1", "one", 10)], &Config::default());
        assert!(validate(&rows, LENIENT).unwrap().is_empty());
        assert!(validate(&rows, STRICT).unwrap().is_empty());
    }

    #[test]
    fn checksum_drift_is_a_mismatch_error() {
        let resolved = vec![descriptor("1", "one", 99)];
        let rows = build_info(&resolved, &[applied("1", "one", 10)], &Config::default());
        let err = validate(&rows, LENIENT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert!(err.to_string().contains("V1__one.sql"));
    }

    #[test]
    fn unresolvable_applied_migration_is_an_error() {
        // with nothing resolved at all the entry counts as future
        let rows = build_info(&[], &[applied("1", "one", 10)], &Config::default());
        let err = validate(
            &rows,
            ValidationPolicy {
                pending_not_ok: false,
                ignore_future: false,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FutureMigration);

        // resolving a newer one makes it genuinely missing
        let resolved = vec![descriptor("2", "two", 20)];
        let rows = build_info(
            &resolved,
            &[applied("1", "one", 10), applied("2", "two", 20)],
            &Config::default(),
        );
        let err = validate(&rows, LENIENT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingAppliedScript);
    }

    #[test]
    fn future_migration_downgrades_to_warning_when_ignored() {
        let resolved = vec![descriptor("1", "one", 10)];
        let history = vec![applied("1", "one", 10), applied("9", "nine", 90)];
        let rows = build_info(&resolved, &history, &Config::default());

        let warnings = validate(&rows, LENIENT).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("version 9"));

        let err = validate(
            &rows,
            ValidationPolicy {
                pending_not_ok: false,
                ignore_future: false,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FutureMigration);
    }

    #[test]
    fn pending_is_only_an_error_when_asked() {
        let resolved = vec![descriptor("1", "one", 10)];
        let rows = build_info(&resolved, &[], &Config::default());
        assert!(validate(&rows, LENIENT).unwrap().is_empty());
        let err = validate(&rows, STRICT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }

    #[test]
    fn changed_description_is_an_error() {
        let resolved = vec![descriptor("1", "renamed", 10)];
        let rows = build_info(&resolved, &[applied("1", "original", 10)], &Config::default());
        let err = validate(&rows, LENIENT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(err.to_string().contains("original"));
    }

    #[test]
    fn first_offending_row_wins() {
        let resolved = vec![descriptor("1", "one", 99), descriptor("2", "two", 88)];
        let history = vec![applied("1", "one", 10), applied("2", "two", 20)];
        let rows = build_info(&resolved, &history, &Config::default());
        let err = validate(&rows, LENIENT).unwrap_err();
        assert!(err.to_string().contains("V1__one.sql"));
    }
}
