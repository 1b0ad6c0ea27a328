//! Shared, thread-safe owner of a handler table and its module list.
//!
//! One runtime per process, or one per test for isolation. The connection
//! layer takes it by `Arc` and routes every inbound frame through
//! [`SemRuntime::handle_sem`].

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use timeline_core::sem::SemEvent;

use crate::handlers::{register_core, CORE_MODULE};
use crate::modules::ModuleRegistry;
use crate::registry::{dispatch, SemContext, SemOutcome, SemRegistry};

#[derive(Default)]
pub struct SemRuntime {
    handlers: RwLock<SemRegistry>,
    modules: Mutex<ModuleRegistry>,
}

impl SemRuntime {
    /// Empty runtime with no handlers or modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runtime with the built-in module registered and applied.
    pub fn with_defaults() -> Self {
        let runtime = Self::new();
        runtime.register_module(CORE_MODULE, register_core);
        runtime.ensure_registered();
        runtime
    }

    pub fn register_sem<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&SemEvent, &SemContext<'_>) + Send + Sync + 'static,
    {
        self.handlers.write().register(event_type, handler);
    }

    pub fn clear_sem_handlers(&self) {
        self.handlers.write().clear();
    }

    pub fn register_module<F>(&self, id: impl Into<String>, module: F) -> bool
    where
        F: Fn(&mut SemRegistry) + Send + Sync + 'static,
    {
        self.modules.lock().register(id, module)
    }

    /// Apply modules registered since the last call.
    pub fn ensure_registered(&self) -> usize {
        let mut modules = self.modules.lock();
        let mut handlers = self.handlers.write();
        modules.ensure_registered(&mut handlers)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().count()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.handlers.read().event_types()
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.modules.lock().ids()
    }

    /// Route one frame. The handler runs outside the table lock, so it may
    /// register further handlers without deadlocking.
    pub fn handle_sem(&self, frame: &Value, ctx: &SemContext<'_>) -> SemOutcome {
        dispatch(frame, ctx, |event_type| self.handlers.read().resolve(event_type))
    }
}
