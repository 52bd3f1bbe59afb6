use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "crawlbox")]
#[command(about = "Crawl task execution engine", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $CRAWLBOX_CONFIG or config/crawlbox.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the poller and the worker pool until interrupted
    Run(RunArgs),

    /// Create a task from literal parameters
    Enqueue(EnqueueArgs),

    /// Let a crawler seed its own batch tasks
    CrawlParams(CrawlParamsArgs),

    /// Inspect and replay nacked queue items
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Number of concurrent workers
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub workers_num: Option<u64>,

    /// Seconds between poll cycles
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct EnqueueArgs {
    /// Crawler kind
    #[arg(long)]
    pub crawler: String,

    /// Crawl params as JSON
    #[arg(long)]
    pub params: String,

    /// Task options as a JSON object
    #[arg(long)]
    pub options: Option<String>,

    /// Mark the task as part of a batch instead of on-demand
    #[arg(long)]
    pub batch: bool,

    /// Execute in this process right away
    #[arg(long)]
    pub now: bool,
}

#[derive(clap::Args, Debug)]
pub struct CrawlParamsArgs {
    /// Crawler kind
    #[arg(long)]
    pub crawler: String,

    /// Crawler options as a JSON object
    #[arg(long)]
    pub options: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// List nacked items, oldest first
    Failed {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Put a nacked item back in line
    Replay { seq: u64 },
}
