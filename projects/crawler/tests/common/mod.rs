//! In-memory stand-ins for the remote search and the store.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use interfaces_github_repositories::{FetchPageError, Page, RawRepository};
use projects_crawler::pipeline::{
    checkpoint::index::{Checkpoint, CheckpointError, CheckpointStore},
    crawl::index::PageSource,
    upsert::index::{
        coalesce_batch, validate_record, BatchResult, BatchSink, FailedRecord, PersistBatchError,
    },
};
use tokio_util::sync::CancellationToken;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn repo(id: i64, stars: i64) -> RawRepository {
    RawRepository {
        id,
        name: format!("repo{id}"),
        owner: format!("owner{id}"),
        full_name: format!("owner{id}/repo{id}"),
        created_at: Some(start() - chrono::Duration::days(id)),
        updated_at: Some(start()),
        stars,
    }
}

pub fn repos(count: i64) -> Vec<RawRepository> {
    (1..=count).map(|id| repo(id, 1_000_000 - id)).collect()
}

/// Serves a fixed, ordered result set. Cursors are offsets.
pub struct FakeRemote {
    records: Vec<RawRepository>,
    pub calls: Vec<(Option<String>, u32)>,
    fail_on_call: Option<usize>,
    cancel_after_call: Option<(usize, CancellationToken)>,
}

impl FakeRemote {
    pub fn new(records: Vec<RawRepository>) -> Self {
        Self {
            records,
            calls: Vec::new(),
            fail_on_call: None,
            cancel_after_call: None,
        }
    }

    /// The nth request (zero-based) fails fatally.
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Cancels `token` right after serving the nth request (zero-based).
    pub fn cancelling_after_call(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_after_call = Some((call, token));
        self
    }

    pub fn cursors(&self) -> Vec<Option<String>> {
        self.calls.iter().map(|(cursor, _)| cursor.clone()).collect()
    }

    pub fn page_sizes(&self) -> Vec<u32> {
        self.calls.iter().map(|(_, size)| *size).collect()
    }
}

#[async_trait]
impl PageSource for FakeRemote {
    async fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page, FetchPageError> {
        let call = self.calls.len();
        self.calls.push((cursor.map(str::to_string), page_size));

        if self.fail_on_call == Some(call) {
            return Err(FetchPageError::malformed("scripted failure"));
        }

        let offset = match cursor {
            None => 0,
            Some(cursor) => cursor
                .strip_prefix("offset:")
                .and_then(|offset| offset.parse::<usize>().ok())
                .ok_or_else(|| FetchPageError::malformed(format!("unknown cursor {cursor}")))?,
        };
        let end = (offset + page_size as usize).min(self.records.len());
        let records = self.records[offset.min(end)..end].to_vec();

        if let Some((after, token)) = &self.cancel_after_call {
            if *after == call {
                token.cancel();
            }
        }

        Ok(Page {
            records,
            next_cursor: Some(format!("offset:{end}")),
            has_more: end < self.records.len(),
            rate_limit: None,
        })
    }
}

/// Applies the same upsert rules as the PostgreSQL engine: one row per id,
/// unique full names, at most one observation per repository and bucket.
pub struct MemorySink {
    pub recorded_at: NaiveDateTime,
    pub repositories: BTreeMap<i64, RawRepository>,
    pub observations: HashMap<(i64, NaiveDateTime), i64>,
    /// Ids in the order they were written.
    pub persisted: Vec<i64>,
    pub batches: usize,
    fail_on_batch: Option<usize>,
}

impl MemorySink {
    pub fn new(recorded_at: NaiveDateTime) -> Self {
        Self {
            recorded_at,
            repositories: BTreeMap::new(),
            observations: HashMap::new(),
            persisted: Vec::new(),
            batches: 0,
            fail_on_batch: None,
        }
    }

    /// The nth batch (zero-based) finds the store unavailable.
    pub fn failing_on_batch(mut self, batch: usize) -> Self {
        self.fail_on_batch = Some(batch);
        self
    }

    pub fn ids(&self) -> Vec<i64> {
        self.repositories.keys().copied().collect()
    }

    pub fn observed_ids(&self) -> HashSet<i64> {
        self.observations.keys().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn persist_batch(
        &mut self,
        records: &[RawRepository],
    ) -> Result<BatchResult, PersistBatchError> {
        let batch = self.batches;
        self.batches += 1;
        if self.fail_on_batch == Some(batch) {
            return Err(PersistBatchError::StoreUnavailable {
                repository_id: records.first().map(|r| r.id).unwrap_or_default(),
                attempts: 3,
                reason: "connection refused".to_string(),
            });
        }

        let mut result = BatchResult::default();
        for record in coalesce_batch(records) {
            if let Err(reason) = validate_record(&record) {
                result.failed.push(FailedRecord { record, reason });
                continue;
            }
            let taken = self
                .repositories
                .values()
                .any(|other| other.id != record.id && other.full_name == record.full_name);
            if taken {
                let reason = format!("full_name {} belongs to another repository", record.full_name);
                result.failed.push(FailedRecord { record, reason });
                continue;
            }

            let key = (record.id, self.recorded_at);
            if !self.observations.contains_key(&key) {
                self.observations.insert(key, record.stars);
                result.star_observations_appended += 1;
            }
            self.persisted.push(record.id);
            self.repositories.insert(record.id, record);
            result.written += 1;
        }

        Ok(result)
    }
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    pub current: Option<Checkpoint>,
    pub history: Vec<Checkpoint>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.current.clone())
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.current = Some(checkpoint.clone());
        self.history.push(checkpoint.clone());
        Ok(())
    }
}
