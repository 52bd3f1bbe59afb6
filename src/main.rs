mod cli;

use clap::Parser;
use cli::{Cli, Commands, CrawlParamsArgs, EnqueueArgs, QueueCommands, RunArgs};
use crawlbox::config::{Config, HumanDuration};
use crawlbox::crawler::CrawlerRegistry;
use crawlbox::engine::Engine;
use crawlbox::ledger::{NewTask, TaskType};
use crawlbox::observability;
use crawlbox::queue::DurableQueue;
use serde_json::{Map, Value};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let _ = dotenvy::dotenv();
    observability::init_tracing();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Run(args) => run(config, args).await?,
        Commands::Enqueue(args) => enqueue(config, args).await?,
        Commands::CrawlParams(args) => crawl_params(config, args).await?,
        Commands::Queue { command } => queue(config, command)?,
    }

    Ok(())
}

async fn run(mut config: Config, args: RunArgs) -> Result<(), AnyError> {
    if let Some(workers_num) = args.workers_num {
        config.engine.workers_num = workers_num as usize;
    }
    if let Some(interval) = args.interval {
        config.engine.poll_interval = HumanDuration::from_secs(interval);
    }

    Engine::open(config, CrawlerRegistry::with_defaults())?
        .run()
        .await?;
    Ok(())
}

async fn enqueue(config: Config, args: EnqueueArgs) -> Result<(), AnyError> {
    let params: Value = serde_json::from_str(&args.params)?;
    let options: Map<String, Value> = match &args.options {
        Some(raw) => serde_json::from_str(raw)?,
        None => Map::new(),
    };
    let task_type = if args.batch {
        TaskType::Batch
    } else {
        TaskType::OnDemand
    };

    let engine = Engine::open(config, CrawlerRegistry::with_defaults())?;
    let task = engine.enqueue(
        NewTask::builder()
            .kind(args.crawler)
            .params(params)
            .options(options)
            .task_type(task_type)
            .build(),
    )?;

    if args.now {
        let task = engine.run_now(&task.task_id).await?;
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        engine.flush()?;
        println!("{}", task.task_id);
    }

    Ok(())
}

async fn crawl_params(config: Config, args: CrawlParamsArgs) -> Result<(), AnyError> {
    let options: Map<String, Value> = match &args.options {
        Some(raw) => serde_json::from_str(raw)?,
        None => Map::new(),
    };

    let engine = Engine::open(config, CrawlerRegistry::with_defaults())?;
    let created = engine.crawl_params(&args.crawler, options).await?;
    println!("created {created} batch tasks for {}", args.crawler);

    Ok(())
}

fn queue(config: Config, command: QueueCommands) -> Result<(), AnyError> {
    let queue = DurableQueue::open(&config.storage.queue_path)?;

    match command {
        QueueCommands::Failed { limit } => {
            for failed in queue.list_failed(limit)? {
                println!("{}", serde_json::to_string(&failed)?);
            }
        }
        QueueCommands::Replay { seq } => {
            let item = queue.replay_failed(seq)?;
            queue.flush()?;
            println!("replayed seq={seq} task_id={}", item.options.task_id);
        }
    }

    Ok(())
}
