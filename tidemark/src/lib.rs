//! `tidemark` is a database schema migration engine.
//!
//! Core concepts:
//! - Migrations are script files discovered from configured locations:
//!   **versioned** migrations (`V1__create_users.sql`) are applied exactly
//!   once, in version order; **repeatable** migrations
//!   (`R__refresh_views.sql`) are re-applied whenever their content changes.
//! - Every application is recorded in a metadata collection in the target
//!   database itself, which makes runs idempotent, restart-safe and
//!   reproducible across environments.
//! - An advisory lock in the database serializes engine instances, so
//!   several application replicas can race to migrate on startup and
//!   exactly one wins.
//!
//! # Example
//!
//! ```no_run
//! use tidemark::{Config, Engine};
//!
//! let config = Config::default()
//!     .with_url("sqlite:app.db")
//!     .with_locations(["filesystem:migrations"]);
//!
//! let mut engine = Engine::open(config)?;
//! let applied = engine.migrate()?;
//! println!("applied {applied} migration(s)");
//!
//! // inspect the joined state of every known migration
//! for row in engine.info()? {
//!     println!("{:>10}  {}", row.state.to_string(), row.script());
//! }
//! # Ok::<(), tidemark::Error>(())
//! ```
//!
//! # Commands
//!
//! - [Engine::migrate] — apply everything pending, in order.
//! - [Engine::validate] — detect drift between applied history and the
//!   scripts as they resolve today (changed checksums, vanished scripts,
//!   unapplied migrations).
//! - [Engine::info] — the joined per-migration state view.
//! - [Engine::baseline] — adopt an existing database by marking a starting
//!   version; everything at or below it is skipped.
//! - [Engine::repair] — remove failed entries and rewrite drifted
//!   checksums.
//! - [Engine::clean] — drop what the engine may drop and reset the
//!   history.
//!
//! # Extending
//!
//! Additional migration sources implement [resolver::MigrationResolver];
//! lifecycle observers implement [callback::Callback]. Both are handed to
//! the engine through [Config]. Database drivers implement
//! [backend::Backend]; the crate ships a SQLite backend and an in-memory
//! one in [testing] for exercising the engine without a database file.

mod checksum;
mod config;
mod engine;
mod error;
mod info;
mod migration;
mod store;
mod validate;
mod version;

pub mod backend;
pub mod callback;
pub mod resolver;
pub mod testing;

pub use checksum::compute as compute_checksum;
pub use config::{Config, Location};
pub use engine::Engine;
pub use error::{Error, ErrorKind};
pub use info::{InfoRow, MigrationState};
pub use migration::{MigrationDescriptor, MigrationKind, ScriptRunner, SqlRunner};
pub use store::{AppliedEntry, MetadataStore};
pub use version::{Target, VersionKey};
