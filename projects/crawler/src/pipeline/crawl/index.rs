use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use interfaces_github_repositories::{
    Clock, FetchPageError, GitHubClient, Page, MAX_PAGE_SIZE,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::pipeline::{
    checkpoint::index::{Checkpoint, CheckpointError, CheckpointStatus, CheckpointStore},
    upsert::index::{observation_bucket, BatchResult, BatchSink, FailedRecord, PersistBatchError},
};

pub const DEFAULT_TARGET: u64 = 100_000;
pub const DEFAULT_PAGE_SIZE: u32 = MAX_PAGE_SIZE;
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(100);

/// Anything that hands out cursor-ordered pages of repositories.
#[async_trait]
pub trait PageSource: Send {
    async fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page, FetchPageError>;
}

#[async_trait]
impl PageSource for GitHubClient {
    async fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page, FetchPageError> {
        GitHubClient::fetch_page(self, cursor, page_size).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrawlParams {
    pub target: u64,
    pub page_size: u32,
    /// Pause between pages, on top of whatever the API makes us wait.
    pub page_delay: Duration,
}

impl Default for CrawlParams {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            page_size: DEFAULT_PAGE_SIZE,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }
}

/// Where a run starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlPlan {
    pub cursor: Option<String>,
    pub records_processed: u64,
    pub pages_completed: u64,
    pub recorded_at: NaiveDateTime,
    pub resumed: bool,
}

impl CrawlPlan {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            cursor: None,
            records_processed: 0,
            pages_completed: 0,
            recorded_at: observation_bucket(now),
            resumed: false,
        }
    }

    /// An explicit cursor wins, then an unfinished checkpoint (unless a fresh
    /// crawl is forced), then a fresh crawl.
    pub fn resolve(
        resume_cursor: Option<String>,
        fresh: bool,
        checkpoint: Option<&Checkpoint>,
        now: DateTime<Utc>,
    ) -> Self {
        if let Some(cursor) = resume_cursor {
            return Self {
                cursor: Some(cursor),
                resumed: true,
                ..Self::fresh(now)
            };
        }

        match checkpoint {
            Some(checkpoint) if !fresh && checkpoint.is_resumable() => Self {
                cursor: checkpoint.cursor.clone(),
                records_processed: checkpoint.records_processed,
                pages_completed: checkpoint.pages_completed,
                recorded_at: checkpoint.recorded_at,
                resumed: true,
            },
            _ => Self::fresh(now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlState {
    Idle,
    Fetching,
    Persisting,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    TargetReached,
    Exhausted,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("FetchPage: {source}")]
    FetchPage {
        #[from]
        source: FetchPageError,
    },

    #[error("PersistBatch: {source}")]
    PersistBatch {
        #[from]
        source: PersistBatchError,
    },

    #[error("SaveCheckpoint: {source}")]
    SaveCheckpoint {
        #[from]
        source: CheckpointError,
    },
}

#[derive(Debug)]
pub enum CrawlOutcome {
    Completed(CompletionReason),
    Cancelled,
    Failed(CrawlError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlSummary {
    /// Pages persisted by this run.
    pub pages: u64,
    /// Records written or rejected so far, including those of the run being
    /// resumed.
    pub records_processed: u64,
    pub written: usize,
    pub star_observations_appended: usize,
    pub failed: Vec<FailedRecord>,
    /// Cursor of the next page to request.
    pub cursor: Option<String>,
    pub elapsed: Duration,
}

impl CrawlSummary {
    fn absorb(&mut self, page: &Page, batch: BatchResult) {
        self.pages += 1;
        self.records_processed += processed(&batch);
        self.written += batch.written;
        self.star_observations_appended += batch.star_observations_appended;
        self.failed.extend(batch.failed);
        self.cursor = page.next_cursor.clone();
    }
}

#[derive(Debug)]
pub struct CrawlReport {
    pub outcome: CrawlOutcome,
    pub summary: CrawlSummary,
}

impl CrawlReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CrawlOutcome::Completed(_))
    }
}

/// Drives fetch → persist → checkpoint until the target is met, the
/// results run out, something fatal happens or the run is cancelled.
pub struct Crawler<S, K, C> {
    source: S,
    sink: K,
    checkpoints: C,
    clock: Arc<dyn Clock>,
    params: CrawlParams,
    state: CrawlState,
}

impl<S, K, C> Crawler<S, K, C>
where
    S: PageSource,
    K: BatchSink,
    C: CheckpointStore,
{
    pub fn new(source: S, sink: K, checkpoints: C, clock: Arc<dyn Clock>, params: CrawlParams) -> Self {
        Self {
            source,
            sink,
            checkpoints,
            clock,
            params,
            state: CrawlState::Idle,
        }
    }

    pub fn state(&self) -> CrawlState {
        self.state
    }

    pub fn into_parts(self) -> (S, K, C) {
        (self.source, self.sink, self.checkpoints)
    }

    fn transition(&mut self, next: CrawlState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Crawl state change");
            self.state = next;
        }
    }

    pub async fn run(&mut self, plan: CrawlPlan, cancel: &CancellationToken) -> CrawlReport {
        let started = self.clock.now();
        let start_count = plan.records_processed;

        let mut checkpoint = Checkpoint {
            cursor: plan.cursor.clone(),
            records_processed: plan.records_processed,
            pages_completed: plan.pages_completed,
            recorded_at: plan.recorded_at,
            status: CheckpointStatus::InProgress,
            updated_at: started,
            last_error: None,
        };
        let mut summary = CrawlSummary {
            records_processed: plan.records_processed,
            cursor: plan.cursor.clone(),
            ..CrawlSummary::default()
        };

        info!(
            target = self.params.target,
            page_size = self.params.page_size,
            resumed = plan.resumed,
            already_processed = plan.records_processed,
            recorded_at = %plan.recorded_at,
            "Starting crawl"
        );
        self.transition(CrawlState::Fetching);

        let opened = self.checkpoints.save(&checkpoint).await;
        let outcome = match opened {
            Err(source) => CrawlOutcome::Failed(source.into()),
            Ok(()) => self.crawl_pages(&mut checkpoint, &mut summary, started, start_count, cancel).await,
        };

        let outcome = self.record_outcome(outcome, &mut checkpoint).await;
        summary.elapsed = (self.clock.now() - started).to_std().unwrap_or_default();

        self.transition(match &outcome {
            CrawlOutcome::Completed(_) => CrawlState::Completed,
            CrawlOutcome::Cancelled => CrawlState::Cancelled,
            CrawlOutcome::Failed(_) => CrawlState::Failed,
        });

        CrawlReport { outcome, summary }
    }

    async fn crawl_pages(
        &mut self,
        checkpoint: &mut Checkpoint,
        summary: &mut CrawlSummary,
        started: DateTime<Utc>,
        start_count: u64,
        cancel: &CancellationToken,
    ) -> CrawlOutcome {
        loop {
            if checkpoint.records_processed >= self.params.target {
                return CrawlOutcome::Completed(CompletionReason::TargetReached);
            }
            if cancel.is_cancelled() {
                return CrawlOutcome::Cancelled;
            }

            self.transition(CrawlState::Fetching);
            let remaining = self.params.target - checkpoint.records_processed;
            let page_size = remaining.min(u64::from(self.params.page_size)) as u32;

            // a fetch writes nothing, so it is safe to abandon
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.source.fetch_page(checkpoint.cursor.as_deref(), page_size) => Some(result),
            };
            let page = match fetched {
                None => return CrawlOutcome::Cancelled,
                Some(Ok(page)) => page,
                Some(Err(source)) => return CrawlOutcome::Failed(source.into()),
            };

            self.transition(CrawlState::Persisting);
            let batch = match self.sink.persist_batch(&page.records).await {
                Ok(batch) => batch,
                Err(source) => return CrawlOutcome::Failed(source.into()),
            };

            let now = self.clock.now();
            checkpoint.cursor = page.next_cursor.clone();
            checkpoint.records_processed += processed(&batch);
            checkpoint.pages_completed += 1;
            checkpoint.updated_at = now;
            summary.absorb(&page, batch);

            if let Err(source) = self.checkpoints.save(checkpoint).await {
                return CrawlOutcome::Failed(source.into());
            }

            log_progress(
                checkpoint,
                self.params.target,
                checkpoint.records_processed - start_count,
                (now - started).to_std().unwrap_or_default(),
                &page,
            );

            if !page.has_more {
                return CrawlOutcome::Completed(CompletionReason::Exhausted);
            }

            if !self.params.page_delay.is_zero() {
                self.clock.sleep(self.params.page_delay).await;
            }
        }
    }

    /// Stamps the final status onto the checkpoint. A run that cannot record
    /// its own completion is reported as failed.
    async fn record_outcome(&mut self, outcome: CrawlOutcome, checkpoint: &mut Checkpoint) -> CrawlOutcome {
        match &outcome {
            CrawlOutcome::Completed(reason) => {
                checkpoint.status = CheckpointStatus::Completed;
                info!(?reason, processed = checkpoint.records_processed, "Crawl completed");
            }
            CrawlOutcome::Cancelled => {
                checkpoint.status = CheckpointStatus::InProgress;
                warn!(
                    processed = checkpoint.records_processed,
                    cursor = ?checkpoint.cursor,
                    "Crawl cancelled between pages, progress saved"
                );
            }
            CrawlOutcome::Failed(err) => {
                checkpoint.status = CheckpointStatus::Failed;
                checkpoint.last_error = Some(err.to_string());
                error!(
                    error = %err,
                    processed = checkpoint.records_processed,
                    cursor = ?checkpoint.cursor,
                    "Crawl failed, resume will restart after the last persisted page"
                );
            }
        }
        checkpoint.updated_at = self.clock.now();

        match self.checkpoints.save(checkpoint).await {
            Ok(()) => outcome,
            Err(source) => {
                error!(error = %source, "Could not record the crawl outcome");
                match outcome {
                    CrawlOutcome::Failed(err) => CrawlOutcome::Failed(err),
                    _ => CrawlOutcome::Failed(source.into()),
                }
            }
        }
    }
}

/// Records the sink dealt with, written or rejected. Duplicates coalesced
/// within the page count once.
fn processed(batch: &BatchResult) -> u64 {
    (batch.written + batch.failed.len()) as u64
}

fn log_progress(
    checkpoint: &Checkpoint,
    target: u64,
    processed_this_run: u64,
    elapsed: Duration,
    page: &Page,
) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { processed_this_run as f64 / secs } else { 0.0 };
    let remaining = target.saturating_sub(checkpoint.records_processed);
    let eta_minutes = if rate > 0.0 { remaining as f64 / rate / 60.0 } else { 0.0 };
    let percent = if target > 0 {
        checkpoint.records_processed as f64 / target as f64 * 100.0
    } else {
        100.0
    };

    info!(
        processed = checkpoint.records_processed,
        target,
        percent = %format!("{percent:.1}"),
        rate = %format!("{rate:.1}/s"),
        eta_minutes = %format!("{eta_minutes:.1}"),
        api_remaining = page.rate_limit.as_ref().map(|limit| limit.remaining),
        "Crawl progress"
    );
}
