use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use interfaces_github_repositories::{
    Clock, FetchPageError, GitHubClient, NewGitHubClientError, RetryPolicy, SystemClock,
};
use projects_crawler::{
    config::{Cli, Command, CrawlArgs},
    db::{
        build_pool,
        repository::queries::{count_repositories, CountRepositoriesError},
        setup_schema, BuildPoolError, PgPool, SetupSchemaError, DEFAULT_POOL_SIZE,
    },
    pipeline::{
        checkpoint::index::{CheckpointError, CheckpointStore, FileCheckpointStore},
        crawl::index::{CrawlOutcome, CrawlPlan, CrawlReport, Crawler},
        upsert::index::UpsertEngine,
    },
    utils::csv_export::{export_snapshot, ExportError},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utils_trace::tracing_init;

const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Error)]
pub enum MainError {
    #[error("ParseArgs: {source}")]
    ParseArgs {
        #[source]
        source: clap::Error,
    },

    #[error("BuildPool: {source}")]
    BuildPool {
        #[source]
        source: BuildPoolError,
    },

    #[error("GetConnection: {source}")]
    GetConnection {
        #[source]
        source: r2d2::Error,
    },

    #[error("SetupSchema: {source}")]
    SetupSchema {
        #[source]
        source: SetupSchemaError,
    },

    #[error("CountRepositories: {source}")]
    CountRepositories {
        #[source]
        source: CountRepositoriesError,
    },

    #[error("NewGitHubClient: {source}")]
    NewGitHubClient {
        #[source]
        source: NewGitHubClientError,
    },

    #[error("RateLimitStatus: {source}")]
    RateLimitStatus {
        #[source]
        source: FetchPageError,
    },

    #[error("LoadCheckpoint: {source}")]
    LoadCheckpoint {
        #[source]
        source: CheckpointError,
    },

    #[error("Export: {source}")]
    Export {
        #[source]
        source: ExportError,
    },

    #[error("BlockingTask: {source}")]
    BlockingTask {
        #[from]
        source: tokio::task::JoinError,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(err) = tracing_init(&cli.log_level, cli.log_format) {
        eprintln!("TracingInit: {err}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, MainError> {
    let command = cli
        .resolved_command()
        .map_err(|source| MainError::ParseArgs { source })?;

    let pool = build_pool(&cli.database_url, DEFAULT_POOL_SIZE)
        .map_err(|source| MainError::BuildPool { source })?;

    match command {
        Command::Crawl(args) => crawl(pool, args, cli.export_path).await,
        Command::Export => {
            let repositories = prepare_store(pool.clone()).await?;
            info!(repositories, "Exporting latest snapshot");
            export(pool, cli.export_path).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn crawl(pool: PgPool, args: CrawlArgs, export_path: PathBuf) -> Result<ExitCode, MainError> {
    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone());

    let initial_count = prepare_store(pool.clone()).await?;
    info!(repositories = initial_count, "Database ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let retry = RetryPolicy::default()
        .with_max_attempts(args.max_attempts)
        .with_jitter(args.retry_jitter);
    let mut client = GitHubClient::new(args.github_token.clone(), clock.clone())
        .and_then(|client| client.with_request_timeout(args.request_timeout()))
        .map_err(|source| MainError::NewGitHubClient { source })?
        .with_endpoint(args.endpoint.clone())
        .with_search_query(args.search_query.clone())
        .with_retry_policy(retry);

    let budget = client
        .rate_limit_status()
        .await
        .map_err(|source| MainError::RateLimitStatus { source })?;
    info!(
        remaining = budget.remaining,
        limit = ?budget.limit,
        reset_at = %budget.reset_at,
        "GitHub rate limit"
    );

    let checkpoints = FileCheckpointStore::new(&args.checkpoint_path);
    let saved = checkpoints
        .load()
        .await
        .map_err(|source| MainError::LoadCheckpoint { source })?;
    let plan = CrawlPlan::resolve(args.resume_cursor.clone(), args.fresh, saved.as_ref(), clock.now());
    if plan.resumed {
        info!(
            cursor = ?plan.cursor,
            processed = plan.records_processed,
            checkpoint = %checkpoints.path().display(),
            "Resuming crawl"
        );
    }

    let engine = UpsertEngine::new(pool.clone(), plan.recorded_at, clock.clone())
        .with_store_attempts(args.store_attempts);
    info!(recorded_at = %engine.recorded_at(), "Star observation bucket");
    let mut crawler = Crawler::new(client, engine, checkpoints, clock, args.params());
    let report = crawler.run(plan, &cancel).await;

    log_report(&report);

    let final_count = count(pool.clone()).await?;
    info!(
        before = initial_count,
        after = final_count,
        added = final_count - initial_count,
        "Repository count"
    );

    match &report.outcome {
        CrawlOutcome::Completed(_) => {
            if !args.no_export {
                export(pool, export_path).await?;
            }
            Ok(ExitCode::SUCCESS)
        }
        CrawlOutcome::Cancelled => {
            warn!("Crawl cancelled, run again to resume from the checkpoint");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        CrawlOutcome::Failed(_) => Ok(ExitCode::FAILURE),
    }
}

fn log_report(report: &CrawlReport) {
    let summary = &report.summary;

    info!(
        pages = summary.pages,
        processed = summary.records_processed,
        written = summary.written,
        observations = summary.star_observations_appended,
        failed = summary.failed.len(),
        elapsed_secs = summary.elapsed.as_secs(),
        cursor = ?summary.cursor,
        "Crawl summary"
    );

    for failed in &summary.failed {
        warn!(
            repository_id = failed.record.id,
            full_name = %failed.record.full_name,
            reason = %failed.reason,
            "Failed record"
        );
    }
}

/// First Ctrl+C stops the crawl after the page in flight, the second one
/// exits immediately.
fn spawn_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Shutdown requested, finishing the current page. Press Ctrl+C again to force quit");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(i32::from(EXIT_CANCELLED));
        }
    });
}

async fn prepare_store(pool: PgPool) -> Result<i64, MainError> {
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|source| MainError::GetConnection { source })?;
        setup_schema(&mut conn).map_err(|source| MainError::SetupSchema { source })?;
        count_repositories(&mut conn).map_err(|source| MainError::CountRepositories { source })
    })
    .await?
}

async fn count(pool: PgPool) -> Result<i64, MainError> {
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|source| MainError::GetConnection { source })?;
        count_repositories(&mut conn).map_err(|source| MainError::CountRepositories { source })
    })
    .await?
}

async fn export(pool: PgPool, path: PathBuf) -> Result<usize, MainError> {
    tokio::task::spawn_blocking(move || {
        export_snapshot(&pool, &path).map_err(|source| MainError::Export { source })
    })
    .await?
}
