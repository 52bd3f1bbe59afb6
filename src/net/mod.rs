pub mod http;
pub mod retry;

pub use http::{FetchError, HttpClient, Page, fetch_tenaciously};
pub use retry::{RetryPolicy, WaitError, retry, retry_outcome, wait_tenaciously};
