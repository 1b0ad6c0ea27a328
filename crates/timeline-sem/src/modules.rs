use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::registry::SemRegistry;

/// Registers a group of handlers into a [`SemRegistry`].
pub type ModuleFn = Arc<dyn Fn(&mut SemRegistry) + Send + Sync>;

/// Append-only list of handler modules, each applied at most once.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<(String, ModuleFn)>,
    applied: HashSet<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module. Returns false (and keeps the original) if `id` is
    /// already registered.
    pub fn register<F>(&mut self, id: impl Into<String>, module: F) -> bool
    where
        F: Fn(&mut SemRegistry) + Send + Sync + 'static,
    {
        let id = id.into();
        if self.modules.iter().any(|(existing, _)| *existing == id) {
            debug!(module = %id, "module already registered");
            return false;
        }
        self.modules.push((id, Arc::new(module)));
        true
    }

    /// Apply every module not yet applied, in registration order. Returns
    /// how many were applied by this call.
    pub fn ensure_registered(&mut self, handlers: &mut SemRegistry) -> usize {
        let mut applied = 0;
        for (id, module) in &self.modules {
            if self.applied.contains(id) {
                continue;
            }
            module(handlers);
            self.applied.insert(id.clone());
            applied += 1;
            debug!(module = %id, handlers = handlers.count(), "applied sem module");
        }
        applied
    }

    pub fn ids(&self) -> Vec<String> {
        self.modules.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
