use async_trait::async_trait;
use reqwest::Url;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{CrawlContext, CrawlError, Crawler, Services};
use crate::queue::{CrawlOptions, Producer};

/// Downloads a JSON document and records how it changed since the last run
///
/// Params: `{"url": "https://..."}`. Requests are throttled per host under the
/// `get` operation. The option `snapshot_key` overrides the key the previous
/// version is stored under (the URL by default).
///
/// Seeding takes the option `urls` (an array) and submits one task per entry.
pub struct FetchCrawler;

impl FetchCrawler {
    pub const NAME: &'static str = "fetch";
}

#[async_trait]
impl Crawler for FetchCrawler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn crawl(
        &self,
        ctx: &CrawlContext,
        params: &Value,
        options: &CrawlOptions,
    ) -> Result<(), CrawlError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| CrawlError::InvalidParams("missing string field `url`".to_string()))?;
        let parsed =
            Url::parse(url).map_err(|e| CrawlError::InvalidParams(format!("{url}: {e}")))?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let snapshot_key = options
            .get("snapshot_key")
            .and_then(Value::as_str)
            .unwrap_or(url)
            .to_string();

        ctx.throttle("get").for_sub_key(host).wait().await?;
        let current: Value = ctx.http().get_json(url).await?;

        match ctx.load_snapshot(&snapshot_key)? {
            Some(previous) => {
                let diff = ctx.register_differences(&previous, &current)?;
                info!(
                    task_id = %ctx.task_id(),
                    url,
                    changed = diff.changed.len(),
                    "Document compared with previous version"
                );
            }
            None => debug!(url, "First version of document"),
        }

        ctx.save_snapshot(&snapshot_key, &current)?;
        Ok(())
    }

    async fn crawl_params(
        &self,
        _services: &Services,
        producer: &dyn Producer,
        options: &CrawlOptions,
    ) -> Result<(), CrawlError> {
        let urls = options
            .get("urls")
            .and_then(Value::as_array)
            .ok_or_else(|| CrawlError::InvalidParams("missing array option `urls`".to_string()))?;

        let mut per_task = options.settings.clone();
        per_task.remove("urls");
        let task_options = options.clone().with_settings(per_task);

        for url in urls {
            let url = url
                .as_str()
                .ok_or_else(|| CrawlError::InvalidParams(format!("not a URL string: {url}")))?;
            Url::parse(url).map_err(|e| CrawlError::InvalidParams(format!("{url}: {e}")))?;
            producer
                .add_crawl_params(json!({ "url": url }), task_options.clone())
                .await?;
        }

        info!(urls = urls.len(), "Fetch tasks seeded");
        Ok(())
    }
}
