//! Maps command names to handlers and runs the setup/tidy/shutdown hook
//! lists every registered component may contribute.
//!
//! Grounded on `original_source/erddaputil/main/commands.py`'s
//! `CommandRegistry`/`CommandGroup` pair, collapsed here into a single
//! struct since this crate has no analogue of the original's decorator
//! registration sugar.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::command::{Command, CommandResponse};
use crate::core::errors::CoreError;

pub type Handler = Arc<dyn Fn(&Command) -> Result<CommandResponse, CoreError> + Send + Sync>;
pub type Hook = Arc<dyn Fn() -> Result<(), CoreError> + Send + Sync>;

#[derive(Default)]
pub struct CommandRegistry {
    routes: Mutex<HashMap<String, Handler>>,
    setup_hooks: Mutex<Vec<Hook>>,
    shutdown_hooks: Mutex<Vec<Hook>>,
    tidy_hooks: Mutex<Vec<Hook>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Handler) {
        self.routes.lock().insert(name.into(), handler);
    }

    pub fn on_setup(&self, hook: Hook) {
        self.setup_hooks.lock().push(hook);
    }

    pub fn on_shutdown(&self, hook: Hook) {
        self.shutdown_hooks.lock().push(hook);
    }

    pub fn on_tidy(&self, hook: Hook) {
        self.tidy_hooks.lock().push(hook);
    }

    /// Runs every `on_setup` hook, in registration order, stopping at the
    /// first failure.
    pub fn setup(&self) -> Result<(), CoreError> {
        for hook in self.setup_hooks.lock().iter() {
            hook()?;
        }
        Ok(())
    }

    /// Runs every `on_shutdown` hook. Unlike `setup`, failures are logged
    /// and swallowed so one component's teardown bug can't block the rest.
    pub fn shutdown(&self) {
        for hook in self.shutdown_hooks.lock().iter() {
            if let Err(e) = hook() {
                tracing::warn!(error = %e, "shutdown hook failed");
            }
        }
    }

    /// Runs every `on_tidy` hook. Called periodically by the local receiver
    /// between accepted connections (cache-reload checks, stale-entry
    /// eviction).
    pub fn tidy(&self) {
        for hook in self.tidy_hooks.lock().iter() {
            if let Err(e) = hook() {
                tracing::warn!(error = %e, "tidy hook failed");
            }
        }
    }

    /// Routes `cmd` to its registered handler and converts any error into
    /// an error-state [`CommandResponse`] rather than propagating it — a
    /// handler failure is reported to the caller, not the daemon process.
    pub fn route(&self, cmd: &Command) -> CommandResponse {
        let handler = self.routes.lock().get(&cmd.name).cloned();
        match handler {
            Some(handler) => match handler(cmd) {
                Ok(resp) => resp,
                Err(e) => CommandResponse::error(cmd.guid.clone(), &e),
            },
            None => CommandResponse::error(
                cmd.guid.clone(),
                &CoreError::validation(format!("no handler registered for '{}'", cmd.name)),
            ),
        }
    }
}
