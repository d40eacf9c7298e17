//! Optional worker extensions.
//!
//! Plugins are compiled in and registered by identifier. Configuration picks
//! which ones run and in what order; each factory sees the core workers and may
//! decline to produce a worker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::PluginConfig;
use crate::metrics::MetricsSystem;
use crate::worker::block_report::BlockReportFactory;
use crate::worker::{BlockStore, Worker, WorkerContext};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unknown plugin: {0}")]
    Unknown(String),

    #[error("plugin {0} is already registered")]
    DuplicateIdentifier(String),

    #[error("plugin {plugin} failed to instantiate: {reason}")]
    Instantiation { plugin: String, reason: String },
}

/// Handles a plugin may use beyond the core worker list.
#[derive(Clone)]
pub struct PluginContext {
    pub worker: Arc<WorkerContext>,
    pub metrics: Arc<MetricsSystem>,
    pub blocks: Arc<BlockStore>,
    pub report_interval: Duration,
}

impl PluginContext {
    pub fn new(
        worker: Arc<WorkerContext>,
        metrics: Arc<MetricsSystem>,
        blocks: Arc<BlockStore>,
        config: &PluginConfig,
    ) -> Self {
        Self {
            worker,
            metrics,
            blocks,
            report_interval: Duration::from_millis(config.block_report_interval_ms.max(1)),
        }
    }
}

/// Produces an optional extra worker for a process.
pub trait WorkerFactory: Send + Sync {
    /// Identifier used in `plugins.enabled`.
    fn identifier(&self) -> &'static str;

    /// `Ok(None)` means the plugin has nothing to run in this process.
    fn create(
        &self,
        core: &[Arc<dyn Worker>],
        context: &PluginContext,
    ) -> Result<Option<Arc<dyn Worker>>, PluginError>;
}

/// Identifier to factory.
pub struct PluginRegistry {
    factories: BTreeMap<&'static str, Arc<dyn WorkerFactory>>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the plugins compiled into this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        // Only fails on a duplicate, which an empty registry cannot have.
        let _ = registry.register(Arc::new(BlockReportFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn WorkerFactory>) -> Result<(), PluginError> {
        let id = factory.identifier();
        if self.factories.contains_key(id) {
            return Err(PluginError::DuplicateIdentifier(id.to_string()));
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    pub fn identifiers(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Instantiate `enabled` in order. Unknown identifiers are an error; factories
    /// that decline are skipped.
    pub fn instantiate(
        &self,
        enabled: &[String],
        core: &[Arc<dyn Worker>],
        context: &PluginContext,
    ) -> Result<Vec<Arc<dyn Worker>>, PluginError> {
        let mut plugins = Vec::with_capacity(enabled.len());
        for id in enabled {
            let factory = self
                .factories
                .get(id.as_str())
                .ok_or_else(|| PluginError::Unknown(id.clone()))?;
            match factory.create(core, context)? {
                Some(worker) => {
                    info!(plugin = %id, "Instantiated worker plugin");
                    plugins.push(worker);
                }
                None => info!(plugin = %id, "Plugin declined to create a worker"),
            }
        }
        Ok(plugins)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcServiceMap;
    use crate::worker::WorkerError;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Worker for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn start(&self) -> Result<(), WorkerError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), WorkerError> {
            Ok(())
        }
        fn services(&self) -> Result<RpcServiceMap, WorkerError> {
            Ok(RpcServiceMap::new())
        }
    }

    struct Fixed(&'static str, bool);

    impl WorkerFactory for Fixed {
        fn identifier(&self) -> &'static str {
            self.0
        }
        fn create(
            &self,
            _: &[Arc<dyn Worker>],
            _: &PluginContext,
        ) -> Result<Option<Arc<dyn Worker>>, PluginError> {
            Ok(self.1.then(|| Arc::new(Named(self.0)) as Arc<dyn Worker>))
        }
    }

    fn context() -> PluginContext {
        PluginContext::new(
            Arc::new(WorkerContext::new()),
            Arc::new(MetricsSystem::new("worker").unwrap()),
            Arc::new(BlockStore::new()),
            &PluginConfig::default(),
        )
    }

    #[test]
    fn test_instantiate_follows_configured_order() {
        let mut registry = PluginRegistry::empty();
        registry.register(Arc::new(Fixed("a", true))).unwrap();
        registry.register(Arc::new(Fixed("b", true))).unwrap();
        registry.register(Arc::new(Fixed("skip", false))).unwrap();

        let enabled = vec!["b".to_string(), "skip".to_string(), "a".to_string()];
        let plugins = registry.instantiate(&enabled, &[], &context()).unwrap();
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_and_duplicate_identifiers() {
        let mut registry = PluginRegistry::with_builtin();
        assert_eq!(registry.identifiers(), vec!["block-report"]);
        assert!(matches!(
            registry.register(Arc::new(BlockReportFactory)),
            Err(PluginError::DuplicateIdentifier(_))
        ));

        let err = registry
            .instantiate(&["nope".to_string()], &[], &context())
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Unknown(id) if id == "nope"));
    }
}
