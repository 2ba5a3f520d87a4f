use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::EngagementClassifier;

pub type SharedClassifier = Arc<Mutex<dyn EngagementClassifier>>;

/// Thread-safe registry of classifier backends.
///
/// Backends are wrapped in `Mutex` because `EngagementClassifier::classify`
/// takes `&mut self`. Callers lock per frame, never across a frame read.
pub struct ClassifierRegistry {
    backends: HashMap<String, SharedClassifier>,
    default_name: Option<String>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with every built-in backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::StubClassifier::new());
        registry
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<C: EngagementClassifier + 'static>(&mut self, backend: C) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("classifier '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedClassifier> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedClassifier> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Sorted list of registered backend names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Backend by name, or the default when `name` is empty.
    pub fn select(&self, name: &str) -> Result<SharedClassifier> {
        if name.trim().is_empty() {
            return self
                .default_backend()
                .ok_or_else(|| anyhow!("no classifier registered"));
        }
        self.get(name).ok_or_else(|| {
            anyhow!(
                "classifier '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            )
        })
    }
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}
