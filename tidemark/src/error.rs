use crate::version::VersionKey;

/// Broad classification of every error the engine can raise.
///
/// Each [Error] variant maps onto exactly one kind; callers that only care
/// about the category (a CLI picking an exit message, a retry loop deciding
/// whether a failure is transient) can match on [Error::kind] instead of the
/// full variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotConfigured,
    InvalidConfig,
    LocationUnreadable,
    InvalidVersion,
    InvalidDescription,
    DuplicateMigration,
    NonEmptyNoMetadata,
    AlreadyBaselined,
    NonEmptyHistory,
    ValidationFailed,
    ChecksumMismatch,
    MissingAppliedScript,
    FutureMigration,
    MigrationFailed,
    CleanDisabled,
    LockTimeout,
    BackendError,
}

/// Error type for the tidemark crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no database client configured: {0}")]
    NotConfigured(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unable to read migration location '{location}': {detail}")]
    LocationUnreadable { location: String, detail: String },
    #[error("invalid migration version '{0}'")]
    InvalidVersion(String),
    #[error("invalid migration description: {0}")]
    InvalidDescription(String),
    #[error("duplicate migration: {0}")]
    DuplicateMigration(String),
    #[error(
        "found non-empty database without metadata table; \
         run baseline or enable baseline_on_migrate to initialize it"
    )]
    NonEmptyNoMetadata,
    #[error("unable to baseline: a baseline marker already exists")]
    AlreadyBaselined,
    #[error("unable to baseline: migrations have already been applied")]
    NonEmptyHistory,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error(
        "checksum mismatch for migration {script}: stored {stored:?}, resolved {resolved:?}"
    )]
    ChecksumMismatch {
        script: String,
        stored: Option<i32>,
        resolved: Option<i32>,
    },
    #[error("applied migration {0} is no longer resolvable")]
    MissingAppliedScript(String),
    #[error("applied migration {0} has a higher version than any resolved migration")]
    FutureMigration(String),
    #[error("migration {script} failed after {applied} successful migration(s): {source}")]
    MigrationFailed {
        script: String,
        applied: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("clean is disabled by configuration")]
    CleanDisabled,
    #[error("timed out waiting for the metadata lock held by {holder}")]
    LockTimeout { holder: String },
    #[error("{0}")]
    Backend(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotConfigured(_) => ErrorKind::NotConfigured,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::LocationUnreadable { .. } => ErrorKind::LocationUnreadable,
            Error::InvalidVersion(_) => ErrorKind::InvalidVersion,
            Error::InvalidDescription(_) => ErrorKind::InvalidDescription,
            Error::DuplicateMigration(_) => ErrorKind::DuplicateMigration,
            Error::NonEmptyNoMetadata => ErrorKind::NonEmptyNoMetadata,
            Error::AlreadyBaselined => ErrorKind::AlreadyBaselined,
            Error::NonEmptyHistory => ErrorKind::NonEmptyHistory,
            Error::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::MissingAppliedScript(_) => ErrorKind::MissingAppliedScript,
            Error::FutureMigration(_) => ErrorKind::FutureMigration,
            Error::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            Error::CleanDisabled => ErrorKind::CleanDisabled,
            Error::LockTimeout { .. } => ErrorKind::LockTimeout,
            Error::Backend(_) | Error::Sqlite(_) => ErrorKind::BackendError,
        }
    }

    /// The number of migrations applied before a `migrate` command failed.
    /// Zero for every other error.
    pub fn applied_before_failure(&self) -> usize {
        match self {
            Error::MigrationFailed { applied, .. } => *applied,
            _ => 0,
        }
    }

    pub(crate) fn invalid_version(raw: impl Into<String>) -> Self {
        Error::InvalidVersion(raw.into())
    }

    pub(crate) fn backend(detail: impl Into<String>) -> Self {
        Error::Backend(detail.into())
    }
}

pub(crate) fn location_unreadable(location: impl Into<String>, detail: impl ToString) -> Error {
    Error::LocationUnreadable {
        location: location.into(),
        detail: detail.to_string(),
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Backend(value)
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync>() {}
    check::<Error>();
    check::<VersionKey>();
}
