//! Adapter registry.
//!
//! Maps adapter names (`claude`, `codex`, `acp`, `gemini`, `opencode`,
//! `agent-sdk`) to shared adapter instances.  The coordinator resolves
//! `create_session` / `set_adapter` requests through here.

use std::collections::HashMap;
use std::sync::Arc;

use bc_domain::error::{Error, Result};

use crate::traits::BackendAdapter;

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        let name = adapter.name().to_owned();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            tracing::warn!(adapter = %name, "adapter re-registered, replacing");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown adapter: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
