//! Lifecycle callbacks: ordered, typed notifications fired around each
//! command and around each individual migration.

use std::fs;
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{location_unreadable, Error};
use crate::migration::MigrationDescriptor;

/// The lifecycle moments a callback can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    BeforeClean,
    AfterClean,
    BeforeMigrate,
    AfterMigrate,
    BeforeEachMigrate,
    AfterEachMigrate,
    BeforeValidate,
    AfterValidate,
    BeforeBaseline,
    AfterBaseline,
    BeforeRepair,
    AfterRepair,
    BeforeInfo,
    AfterInfo,
}

impl Event {
    /// The event's script name: a file called `<name><suffix>` in a
    /// configured location is executed by the default script callback.
    pub fn name(self) -> &'static str {
        match self {
            Event::BeforeClean => "beforeClean",
            Event::AfterClean => "afterClean",
            Event::BeforeMigrate => "beforeMigrate",
            Event::AfterMigrate => "afterMigrate",
            Event::BeforeEachMigrate => "beforeEachMigrate",
            Event::AfterEachMigrate => "afterEachMigrate",
            Event::BeforeValidate => "beforeValidate",
            Event::AfterValidate => "afterValidate",
            Event::BeforeBaseline => "beforeBaseline",
            Event::AfterBaseline => "afterBaseline",
            Event::BeforeRepair => "beforeRepair",
            Event::AfterRepair => "afterRepair",
            Event::BeforeInfo => "beforeInfo",
            Event::AfterInfo => "afterInfo",
        }
    }
}

/// What a callback gets to work with: the live backend, the engine
/// configuration, and (for per-migration events) the migration in flight.
pub struct CallbackContext<'a> {
    pub backend: &'a mut dyn Backend,
    pub config: &'a Config,
    pub migration: Option<&'a MigrationDescriptor>,
}

/// Lifecycle notification receiver. Every method defaults to a no-op;
/// implement the ones you care about. Errors abort the current command.
#[allow(unused_variables)]
pub trait Callback: Send + Sync {
    fn before_clean(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_clean(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn before_migrate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_migrate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn before_each_migrate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_each_migrate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn before_validate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_validate(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn before_baseline(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_baseline(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn before_repair(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_repair(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn before_info(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
    fn after_info(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        Ok(())
    }
}

/// Ordered list of callbacks. The default script callback runs first unless
/// skipped, then user callbacks in registration order.
pub struct CallbackBus {
    callbacks: Vec<Arc<dyn Callback>>,
}

impl CallbackBus {
    pub fn from_config(config: &Config) -> Self {
        let mut callbacks: Vec<Arc<dyn Callback>> = Vec::new();
        if !config.skip_default_callbacks() {
            callbacks.push(Arc::new(ScriptCallback));
        }
        callbacks.extend(config.callbacks().iter().cloned());
        CallbackBus { callbacks }
    }

    pub fn fire(
        &self,
        event: Event,
        backend: &mut dyn Backend,
        config: &Config,
        migration: Option<&MigrationDescriptor>,
    ) -> Result<(), Error> {
        for callback in &self.callbacks {
            let mut ctx = CallbackContext {
                backend: &mut *backend,
                config,
                migration,
            };
            dispatch(callback.as_ref(), event, &mut ctx)?;
        }
        Ok(())
    }
}

fn dispatch(
    callback: &dyn Callback,
    event: Event,
    ctx: &mut CallbackContext<'_>,
) -> Result<(), Error> {
    match event {
        Event::BeforeClean => callback.before_clean(ctx),
        Event::AfterClean => callback.after_clean(ctx),
        Event::BeforeMigrate => callback.before_migrate(ctx),
        Event::AfterMigrate => callback.after_migrate(ctx),
        Event::BeforeEachMigrate => callback.before_each_migrate(ctx),
        Event::AfterEachMigrate => callback.after_each_migrate(ctx),
        Event::BeforeValidate => callback.before_validate(ctx),
        Event::AfterValidate => callback.after_validate(ctx),
        Event::BeforeBaseline => callback.before_baseline(ctx),
        Event::AfterBaseline => callback.after_baseline(ctx),
        Event::BeforeRepair => callback.before_repair(ctx),
        Event::AfterRepair => callback.after_repair(ctx),
        Event::BeforeInfo => callback.before_info(ctx),
        Event::AfterInfo => callback.after_info(ctx),
    }
}

/// The default callback: executes a script named after the event (for
/// example `beforeMigrate.sql`) from each configured location that has one.
/// Locations that do not exist are skipped; commands that resolve
/// migrations report unreadable locations themselves.
struct ScriptCallback;

impl ScriptCallback {
    fn run_scripts(&self, event: Event, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
        let filename = format!("{}{}", event.name(), ctx.config.suffix());
        for location in ctx.config.locations() {
            for dir in location.directories(ctx.config.resource_roots()) {
                let path = dir.join(&filename);
                if !path.is_file() {
                    continue;
                }
                let body = fs::read_to_string(&path)
                    .map_err(|e| location_unreadable(location.to_string(), e))?;
                tracing::debug!(script = %path.display(), event = event.name(), "executing callback script");
                ctx.backend
                    .execute_script(&body, !ctx.config.allow_mixed())?;
            }
        }
        Ok(())
    }
}

macro_rules! script_callback_methods {
    ($(($method:ident, $event:expr)),* $(,)?) => {
        $(
            fn $method(&self, ctx: &mut CallbackContext<'_>) -> Result<(), Error> {
                self.run_scripts($event, ctx)
            }
        )*
    };
}

impl Callback for ScriptCallback {
    script_callback_methods!(
        (before_clean, Event::BeforeClean),
        (after_clean, Event::AfterClean),
        (before_migrate, Event::BeforeMigrate),
        (after_migrate, Event::AfterMigrate),
        (before_each_migrate, Event::BeforeEachMigrate),
        (after_each_migrate, Event::AfterEachMigrate),
        (before_validate, Event::BeforeValidate),
        (after_validate, Event::AfterValidate),
        (before_baseline, Event::BeforeBaseline),
        (after_baseline, Event::AfterBaseline),
        (before_repair, Event::BeforeRepair),
        (after_repair, Event::AfterRepair),
        (before_info, Event::BeforeInfo),
        (after_info, Event::AfterInfo),
    );
}
