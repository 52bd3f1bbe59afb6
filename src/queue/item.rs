use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Keys owned by [`CrawlOptions`]; free-form settings never shadow them
pub const RESERVED_OPTION_KEYS: [&str; 3] = ["crawler", "task_id", "current_execution_date"];

/// Execution configuration handed to a crawler together with its params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlOptions {
    pub crawler: String,
    pub task_id: Uuid,
    pub current_execution_date: DateTime<Utc>,
    /// Merged defaults and per-task options
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl CrawlOptions {
    pub fn new(crawler: impl Into<String>, task_id: Uuid) -> Self {
        Self {
            crawler: crawler.into(),
            task_id,
            current_execution_date: Utc::now(),
            settings: Map::new(),
        }
    }

    /// Replace the free-form settings, dropping any reserved keys
    pub fn with_settings(mut self, mut settings: Map<String, Value>) -> Self {
        for key in RESERVED_OPTION_KEYS {
            settings.remove(key);
        }
        self.settings = settings;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

/// The (params, options) pair submitted for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub params: Value,
    pub options: CrawlOptions,
}

impl QueueItem {
    pub fn new(params: Value, options: CrawlOptions) -> Self {
        Self { params, options }
    }
}
