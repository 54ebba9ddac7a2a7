use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chain_etl::config::Config;
use chain_etl::core::cursor::PipelineCursor;
use chain_etl::core::pipeline::EtlPipeline;
use chain_etl::db::{SharedDatabase, TransactionStore};
use chain_etl::extract::BlockFetcher;
use chain_etl::rpc::EthRpc;
use chain_etl::scoring::train::train;
use chain_etl::scoring::{FraudReport, FraudScorer, HeuristicLabeler, TrainingParams};
use chain_etl::stream::{StorageSink, StreamManager, StreamOptions};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML config file; defaults apply when it is missing
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the RPC endpoint from the config
    #[arg(long)]
    rpc: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, normalize, score and load blocks from the cursor up to the confirmed head
    Batch {
        /// Process exactly this range instead of resuming from the cursor
        #[arg(long)]
        start: Option<u64>,
        #[arg(long)]
        end: Option<u64>,
    },
    /// Run the batch ETL now and then on a fixed period until Ctrl-C
    Schedule {
        /// Seconds between runs; defaults to batch.schedule_interval_secs
        #[arg(long)]
        every: Option<u64>,
    },
    /// Follow the chain head until Ctrl-C
    Stream,
    /// Train the fraud model on stored transactions
    Train {
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
        /// Where to write the model; defaults to scoring.model_path
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Score recently stored transactions and write a report
    Score {
        #[arg(long, default_value_t = 1_000)]
        limit: usize,
        #[arg(long, default_value = "fraud_report.json")]
        report: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chain_etl=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config);
    if let Some(url) = cli.rpc {
        config.rpc.url = url;
    }
    tracing::info!("chain-etl starting against {}", config.rpc.url);

    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    let db = SharedDatabase::open(db_path).context("failed to open database")?;
    tracing::info!("Database opened at {}", config.database.path);

    match cli.command {
        Commands::Batch { start, end } => run_batch(&config, db, start, end).await,
        Commands::Schedule { every } => run_schedule(&config, db, every).await,
        Commands::Stream => run_stream(&config, db).await,
        Commands::Train { limit, output } => run_train(&config, &db, limit, output),
        Commands::Score { limit, report } => run_score(&config, &db, limit, &report),
    }
}

fn fetcher(config: &Config) -> anyhow::Result<Arc<BlockFetcher>> {
    let mut rpc = EthRpc::new(&config.rpc.url, config.rpc.timeout()).context("failed to build RPC client")?;
    if let (Some(user), Some(password)) = (&config.rpc.user, &config.rpc.password) {
        rpc = rpc.with_basic_auth(user, password);
    }
    Ok(Arc::new(BlockFetcher::with_options(
        Arc::new(rpc),
        config.extract.cache_capacity,
        config.rpc.timeout(),
    )))
}

fn pipeline(config: &Config, db: SharedDatabase) -> anyhow::Result<EtlPipeline> {
    let cursor = PipelineCursor::load(Arc::new(db.clone()))?;
    let scorer = Arc::new(FraudScorer::from_config(config.scoring.clone())?);
    Ok(EtlPipeline::new(fetcher(config)?, Arc::new(db), cursor)
        .with_options(config.extract.workers, config.batch.clone())
        .with_scorer(scorer))
}

async fn run_batch(config: &Config, db: SharedDatabase, start: Option<u64>, end: Option<u64>) -> anyhow::Result<()> {
    let etl = pipeline(config, db)?;

    match (start, end) {
        (Some(start), Some(end)) => {
            let outcome = etl.process_range(start, end).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        (Some(_), None) => anyhow::bail!("--start requires --end"),
        (None, end) => {
            let summary = etl.run_once(end).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

async fn run_schedule(config: &Config, db: SharedDatabase, every: Option<u64>) -> anyhow::Result<()> {
    let etl = pipeline(config, db)?;
    let every = every.map_or_else(|| config.batch.schedule_interval(), Duration::from_secs);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Ctrl-C received");
    };
    let summary = etl.run_scheduled(every, shutdown).await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_stream(config: &Config, db: SharedDatabase) -> anyhow::Result<()> {
    let sink = Arc::new(StorageSink::new(Arc::new(db)));
    let stream = StreamManager::new(fetcher(config)?, sink, StreamOptions::from(&config.stream));
    stream.connect().await?;
    stream.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received");
    stream.stop().await?;
    println!("{}", serde_json::to_string_pretty(&stream.stats())?);
    Ok(())
}

fn run_train(config: &Config, db: &SharedDatabase, limit: usize, output: Option<PathBuf>) -> anyhow::Result<()> {
    let records = db.recent_transactions(limit)?;
    let (artifact, report) = train(&records, None, &HeuristicLabeler, &TrainingParams::default())?;
    let path = output.unwrap_or_else(|| PathBuf::from(&config.scoring.model_path));
    artifact.save(&path)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_score(config: &Config, db: &SharedDatabase, limit: usize, report_path: &Path) -> anyhow::Result<()> {
    let scorer = FraudScorer::from_config(config.scoring.clone())?;
    let records = db.recent_transactions(limit)?;
    let scored = scorer.score(&records, Some(&records))?;
    db.upsert_scores(&scored)?;

    let report = FraudReport::from_scored(&scored);
    report.save(report_path)?;
    for (tx_hash, probability, level) in db.top_scores(5)? {
        tracing::info!("{level:8} {probability:.3} {tx_hash}");
    }
    if let Some(importance) = scorer.feature_importance() {
        for (name, value) in importance {
            tracing::info!("{name:25}: {value:.3}");
        }
    }
    println!(
        "{} transactions scored, {} suspicious ({:.1}%)",
        report.total_transactions,
        report.suspicious_transactions,
        report.fraud_rate * 100.0
    );
    Ok(())
}
