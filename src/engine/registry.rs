//! Engine registry: configuration-selected engine name to constructor.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, SiftError};

use super::elasticsearch::ElasticsearchEngine;
use super::SearchEngine;

/// Builds an engine from process configuration.
pub type EngineFactory = for<'a> fn(&'a Config) -> BoxFuture<'a, Result<Arc<dyn SearchEngine>>>;

/// Registration table populated at process start.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    factories: BTreeMap<&'static str, EngineFactory>,
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every engine shipped with this crate.
    pub fn with_builtin_engines() -> Self {
        let mut registry = Self::new();
        registry
            .factories
            .insert(ElasticsearchEngine::NAME, elasticsearch_factory as EngineFactory);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: EngineFactory) -> Result<()> {
        if self.factories.contains_key(name) {
            return Err(SiftError::Config(format!(
                "search engine '{name}' is already registered"
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Construct the engine named by `config.search_engine.engine`.
    pub async fn build(&self, config: &Config) -> Result<Arc<dyn SearchEngine>> {
        let name = config.search_engine.engine.as_str();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SiftError::UnknownEngine {
                name: name.to_string(),
                available: self.names().join(", "),
            })?;

        let engine = factory(config).await?;
        info!(engine = engine.name(), "search engine initialised");
        Ok(engine)
    }
}

fn elasticsearch_factory(config: &Config) -> BoxFuture<'_, Result<Arc<dyn SearchEngine>>> {
    Box::pin(async move {
        let engine = ElasticsearchEngine::new(config)?;
        Ok(Arc::new(engine) as Arc<dyn SearchEngine>)
    })
}
