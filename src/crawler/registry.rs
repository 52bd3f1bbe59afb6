use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::Crawler;
use super::fetch::FetchCrawler;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("crawler not found: {0}")]
    NotFound(String),
}

/// Crawler name → implementation, built once at startup
#[derive(Clone, Default)]
pub struct CrawlerRegistry {
    crawlers: BTreeMap<String, Arc<dyn Crawler>>,
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in crawlers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FetchCrawler));
        registry
    }

    /// Add a crawler under its own name, replacing any previous one
    pub fn register(&mut self, crawler: Arc<dyn Crawler>) {
        self.crawlers.insert(crawler.name().to_string(), crawler);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Crawler>, RegistryError> {
        self.crawlers
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.crawlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.crawlers.keys().map(String::as_str)
    }
}
