use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use graphlens::backend::PromptTemplate;
use graphlens::config::Config;
use graphlens::enrichment::{EnrichmentJob, EnrichmentPipeline, PipelineSettings};
use graphlens::freshness::{FreshnessGateway, FreshnessReport};
use graphlens::models::RepoHandle;
use graphlens::query::{Direction, FallbackSearcher, QueryEngine};
use graphlens::reliability::BackendCascade;
use graphlens::scheduler::{Scheduler, SchedulerSettings};
use graphlens::store::{Db, GraphStore, RunRecord};
use graphlens::vcs::{GitCli, VcsAdapter};

/// Enriched code graph with freshness-aware navigation queries
#[derive(Parser)]
#[command(name = "graphlens", version, about)]
struct Cli {
    /// Path to the JSON config file (default: graphlens.json)
    #[arg(short, long, default_value = "")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enrichment scheduler until interrupted
    Daemon,
    /// Search symbols by name or annotation
    Search {
        repo: String,
        query: String,
        #[arg(short, long, default_value_t = 0)]
        limit: usize,
    },
    /// List direct callers and referrers of a symbol
    WhereUsed {
        repo: String,
        symbol: String,
        #[arg(short, long, default_value_t = 0)]
        limit: usize,
    },
    /// Walk callers (upstream) or callees (downstream) transitively
    Lineage {
        repo: String,
        symbol: String,
        #[arg(short, long, default_value = "upstream")]
        direction: Direction,
        #[arg(short, long, default_value_t = 0)]
        max_results: usize,
    },
    /// Show graph freshness and recent enrichment batches
    Status {
        repo: String,
        #[arg(short, long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Serialize)]
struct StatusView {
    repo: String,
    freshness: FreshnessReport,
    failing_spans: usize,
    recent_runs: Vec<RunRecord>,
}

/// Stores and adapters shared by every command.
struct App {
    config: Config,
    graphs: Arc<GraphStore>,
    db: Arc<TokioMutex<Db>>,
    vcs: Arc<dyn VcsAdapter>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let graphs = Arc::new(GraphStore::new(config.graph_dir()));
        let db = Db::open(config.enrichment_db_path()).context("Failed to open enrichment store")?;
        let vcs: Arc<dyn VcsAdapter> = Arc::new(GitCli::new(Duration::from_secs(
            config.scheduler.vcs_timeout_secs,
        )));
        Ok(Self {
            config,
            graphs,
            db: Arc::new(TokioMutex::new(db)),
            vcs,
        })
    }

    fn repo(&self, id: &str) -> Result<RepoHandle> {
        self.config
            .repos
            .iter()
            .find(|r| r.id == id)
            .map(|r| RepoHandle::new(&r.id, &r.path))
            .with_context(|| format!("repository {id:?} is not configured"))
    }

    fn gateway(&self) -> FreshnessGateway {
        FreshnessGateway::new(
            Arc::clone(&self.graphs),
            Arc::clone(&self.vcs),
            self.config.freshness.stale_policy,
        )
    }

    fn query_engine(&self) -> Result<QueryEngine> {
        let fallback =
            FallbackSearcher::from_config(&self.config.query).context("Invalid fallback_exclude glob")?;
        Ok(QueryEngine::new(
            self.gateway(),
            Arc::clone(&self.db),
            fallback,
            self.config.query.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let config = Config::load(&cli.config)?;

    // 2. Open stores
    let app = App::open(config)?;

    // 3. Dispatch
    match cli.command {
        Commands::Daemon => run_daemon(app).await,
        Commands::Search { repo, query, limit } => {
            let repo = app.repo(&repo)?;
            print_json(&app.query_engine()?.search(&repo, &query, limit).await?)
        }
        Commands::WhereUsed { repo, symbol, limit } => {
            let repo = app.repo(&repo)?;
            print_json(&app.query_engine()?.where_used(&repo, &symbol, limit).await?)
        }
        Commands::Lineage {
            repo,
            symbol,
            direction,
            max_results,
        } => {
            let repo = app.repo(&repo)?;
            print_json(
                &app.query_engine()?
                    .lineage(&repo, &symbol, direction, max_results)
                    .await?,
            )
        }
        Commands::Status { repo, runs } => {
            let repo = app.repo(&repo)?;
            let freshness = app.gateway().evaluate(&repo).await.report;
            let recent = app.db.lock().await.recent_runs(&repo.id, runs)?;
            let failing_spans = app.db.lock().await.failures_for_repo(&repo.id)?.len();
            print_json(&StatusView {
                repo: repo.id,
                freshness,
                failing_spans,
                recent_runs: recent,
            })
        }
    }
}

async fn run_daemon(app: App) -> Result<()> {
    info!("Starting graphlens daemon...");

    let cascade = Arc::new(BackendCascade::from_config(&app.config).context("Failed to build backend cascade")?);
    info!(backends = cascade.len(), "Backend cascade ready");

    let pipeline = Arc::new(EnrichmentPipeline::new(
        Arc::clone(&app.graphs),
        Arc::clone(&app.db),
        cascade,
        PromptTemplate::from_config(app.config.enrichment.prompt_template.as_deref()),
        PipelineSettings::from_config(&app.config.enrichment),
    ));
    let job = Arc::new(EnrichmentJob::new(pipeline, Arc::clone(&app.vcs)));
    let scheduler = Arc::new(Scheduler::new(
        job,
        SchedulerSettings::from_config(&app.config.scheduler),
    ));

    for repo in &app.config.repos {
        scheduler.register_repo(&repo.id, &repo.path).await;
    }

    let runner = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, cancelling active runs");

    scheduler.shutdown().await;
    runner.await.context("Scheduler task failed")?;

    for state in scheduler.statuses() {
        info!(
            repo = %state.repo_id,
            status = state.status.as_str(),
            failures = state.consecutive_failures,
            degraded = state.degraded,
            "Final repository state"
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    println!("{out}");
    Ok(())
}
