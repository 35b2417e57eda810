//! Filter factory registry.
//!
//! Plugins contribute filters under well-known names by filling a
//! registry; the runtime instantiates filters by name. Loading factories
//! out of shared libraries is a host concern — a loader calls
//! [`PluginRegistry::load_definition`] with whatever it resolved.

use crate::environment::FilterEnvironment;
use crate::filter::Filter;
use crate::{FlowgraphError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared factory creating filter instances by name.
pub type SharedFilterFactory =
    Arc<dyn Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync>;

/// Signature of a plugin's definition entry point: it registers all
/// filter factories the plugin provides.
pub type PluginDefinition = fn(&PluginRegistry);

/// Name → factory map the runtime instantiates filters through.
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, SharedFilterFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a name; a later registration replaces an
    /// earlier one.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(factory));
    }

    /// Run a plugin's definition entry point against this registry.
    pub fn load_definition(&self, definition: PluginDefinition) {
        definition(self);
    }

    /// Look up a factory by name.
    pub fn factory(&self, name: &str) -> Result<SharedFilterFactory> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| FlowgraphError::PluginSymbolMissing(name.to_string()))
    }

    /// Instantiate a filter by name.
    pub fn create(&self, name: &str, env: &Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> {
        self.factory(name)?(env)
    }

    /// Registered factory names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterId;
    use crate::properties::PropertyCollection;
    use crate::services::Services;

    struct Nop;
    impl Filter for Nop {}

    fn definition(registry: &PluginRegistry) {
        registry.register("nop", |_env| Ok(Box::new(Nop)));
    }

    #[test]
    fn test_register_and_create() {
        let registry = PluginRegistry::new();
        registry.load_definition(definition);
        assert_eq!(registry.names(), vec!["nop".to_string()]);

        let env = FilterEnvironment::new(
            FilterId(0),
            "nop",
            "main",
            PropertyCollection::new("nop"),
            Arc::new(Services::new()),
        );
        env.bind_thread();
        assert!(registry.create("nop", &env).is_ok());
    }

    #[test]
    fn test_missing_symbol() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.factory("ghost"),
            Err(FlowgraphError::PluginSymbolMissing(_))
        ));
    }
}
