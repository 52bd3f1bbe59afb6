//! Crawler plugins
//!
//! A crawler is the domain-specific callback invoked by a worker for one task.
//! Crawlers are registered by name in a [`CrawlerRegistry`] at startup; the task
//! `kind` selects which one runs.
//!
//! ## Example
//!
//! ```rust,ignore
//! struct Companies;
//!
//! #[async_trait]
//! impl Crawler for Companies {
//!     fn name(&self) -> &str {
//!         "companies"
//!     }
//!
//!     async fn crawl(&self, ctx: &CrawlContext, params: &Value, _: &CrawlOptions) -> Result<(), CrawlError> {
//!         let page = ctx.throttle("detail").run(|| ctx.http().get(url)).await??;
//!         ctx.register_differences(&previous, &page.json()?)?;
//!         Ok(())
//!     }
//! }
//! ```

mod context;
mod fetch;
mod registry;

pub use context::{CrawlContext, Services};
pub use fetch::FetchCrawler;
pub use registry::{CrawlerRegistry, RegistryError};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::net::FetchError;
use crate::queue::{CrawlOptions, Producer, ProducerError};
use crate::throttle::ThrottleError;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Throttle failed: {0}")]
    Throttle(#[from] ThrottleError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Crawler: Send + Sync {
    /// Registry key; matches the task `kind`
    fn name(&self) -> &str;

    /// Harvest one task; an `Err` marks the task FAULTY
    async fn crawl(
        &self,
        ctx: &CrawlContext,
        params: &Value,
        options: &CrawlOptions,
    ) -> Result<(), CrawlError>;

    /// Seed work: submit one set of params per unit the crawler wants harvested
    ///
    /// `options` carries the settings given on the command line. Crawlers that
    /// are only ever fed from outside keep the default, which submits nothing.
    async fn crawl_params(
        &self,
        _services: &Services,
        _producer: &dyn Producer,
        _options: &CrawlOptions,
    ) -> Result<(), CrawlError> {
        Ok(())
    }
}
