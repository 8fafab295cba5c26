use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use interfaces_github_repositories::{Clock, RawRepository};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{
    repository::{
        models::NewRepository,
        queries::{upsert_repository, UpsertRepositoryError},
    },
    star::{
        models::NewStarObservation,
        queries::{append_star_observation, AppendStarObservationError},
    },
    PgPool,
};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_OWNER_LEN: usize = 255;
pub const MAX_FULL_NAME_LEN: usize = 512;

pub const DEFAULT_STORE_ATTEMPTS: usize = 3;
const STORE_MIN_BACKOFF: Duration = Duration::from_millis(500);
const STORE_MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct FailedRecord {
    pub record: RawRepository,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub written: usize,
    pub star_observations_appended: usize,
    pub failed: Vec<FailedRecord>,
}

#[derive(Debug, Error)]
pub enum PersistBatchError {
    #[error("StoreUnavailable: gave up after {attempts} attempts on repository {repository_id}: {reason}")]
    StoreUnavailable {
        repository_id: i64,
        attempts: usize,
        reason: String,
    },

    #[error("Query: {source}")]
    Query {
        #[source]
        source: DieselError,
    },

    #[error("BlockingTask: {source}")]
    BlockingTask {
        #[from]
        source: tokio::task::JoinError,
    },
}

/// Anything that can take a page of repositories and make it durable.
#[async_trait]
pub trait BatchSink: Send {
    async fn persist_batch(
        &mut self,
        records: &[RawRepository],
    ) -> Result<BatchResult, PersistBatchError>;
}

/// Observation bucket for a run: the wall-clock instant at PostgreSQL's
/// `TIMESTAMP` precision.
pub fn observation_bucket(now: DateTime<Utc>) -> NaiveDateTime {
    now.naive_utc().trunc_subsecs(6)
}

/// Keeps one record per repository id. The surviving record sits where the
/// id first appeared and carries the values of its last appearance.
pub fn coalesce_batch(records: &[RawRepository]) -> Vec<RawRepository> {
    let mut positions: HashMap<i64, usize> = HashMap::with_capacity(records.len());
    let mut coalesced: Vec<RawRepository> = Vec::with_capacity(records.len());

    for record in records {
        match positions.get(&record.id) {
            Some(&at) => coalesced[at] = record.clone(),
            None => {
                positions.insert(record.id, coalesced.len());
                coalesced.push(record.clone());
            }
        }
    }

    coalesced
}

/// Checks what the schema would reject and returns the star count as the
/// column type.
pub fn validate_record(record: &RawRepository) -> Result<i32, String> {
    let checks = [
        ("name", &record.name, MAX_NAME_LEN),
        ("owner", &record.owner, MAX_OWNER_LEN),
        ("full_name", &record.full_name, MAX_FULL_NAME_LEN),
    ];
    for (field, value, max) in checks {
        if value.is_empty() {
            return Err(format!("{field} is empty"));
        }
        let len = value.chars().count();
        if len > max {
            return Err(format!("{field} is {len} characters, limit is {max}"));
        }
    }

    i32::try_from(record.stars)
        .ok()
        .filter(|stars| *stars >= 0)
        .ok_or_else(|| format!("star count {} is outside 0..={}", record.stars, i32::MAX))
}

/// Writes batches into `repositories` and `repository_stars`.
///
/// Each record is its own transaction: the repository upsert and the
/// observation insert commit together or not at all, and one bad record
/// never rolls back its neighbours.
pub struct UpsertEngine {
    pool: PgPool,
    recorded_at: NaiveDateTime,
    clock: Arc<dyn Clock>,
    store_attempts: usize,
}

enum RecordOutcome {
    Written { appended: bool },
    Rejected(String),
}

impl UpsertEngine {
    pub fn new(pool: PgPool, recorded_at: NaiveDateTime, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            recorded_at,
            clock,
            store_attempts: DEFAULT_STORE_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_store_attempts(mut self, attempts: usize) -> Self {
        self.store_attempts = attempts.max(1);
        self
    }

    pub fn recorded_at(&self) -> NaiveDateTime {
        self.recorded_at
    }

    fn store_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(STORE_MIN_BACKOFF)
            .with_max_delay(STORE_MAX_BACKOFF)
            .with_max_times(self.store_attempts.saturating_sub(1))
            .build()
    }

    async fn persist_record(&self, record: &RawRepository) -> Result<RecordOutcome, PersistBatchError> {
        let star_count = match validate_record(record) {
            Ok(star_count) => star_count,
            Err(reason) => return Ok(RecordOutcome::Rejected(reason)),
        };

        let mut backoff = self.store_backoff();
        let mut attempts = 0usize;

        loop {
            attempts += 1;

            let pool = self.pool.clone();
            let owned = record.clone();
            let recorded_at = self.recorded_at;
            let crawled_at = self.clock.now().naive_utc();

            let written = tokio::task::spawn_blocking(move || {
                write_record(&pool, &owned, star_count, recorded_at, crawled_at)
            })
            .await?;

            match written {
                Ok(appended) => return Ok(RecordOutcome::Written { appended }),
                Err(WriteRecordError::Constraint(reason)) => return Ok(RecordOutcome::Rejected(reason)),
                Err(WriteRecordError::Unavailable(reason)) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            repository_id = record.id,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            %reason,
                            "Store unavailable, retrying record"
                        );
                        self.clock.sleep(delay).await;
                    }
                    None => {
                        return Err(PersistBatchError::StoreUnavailable {
                            repository_id: record.id,
                            attempts,
                            reason,
                        })
                    }
                },
                Err(WriteRecordError::Query(source)) => return Err(PersistBatchError::Query { source }),
            }
        }
    }
}

#[async_trait]
impl BatchSink for UpsertEngine {
    async fn persist_batch(
        &mut self,
        records: &[RawRepository],
    ) -> Result<BatchResult, PersistBatchError> {
        let mut result = BatchResult::default();

        for record in coalesce_batch(records) {
            match self.persist_record(&record).await? {
                RecordOutcome::Written { appended } => {
                    result.written += 1;
                    if appended {
                        result.star_observations_appended += 1;
                    }
                }
                RecordOutcome::Rejected(reason) => {
                    warn!(
                        repository_id = record.id,
                        full_name = %record.full_name,
                        %reason,
                        "Skipping repository"
                    );
                    result.failed.push(FailedRecord { record, reason });
                }
            }
        }

        debug!(
            written = result.written,
            appended = result.star_observations_appended,
            failed = result.failed.len(),
            "Persisted batch"
        );

        Ok(result)
    }
}

#[derive(Debug, Error)]
enum WriteRecordError {
    #[error("Constraint: {0}")]
    Constraint(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Query: {0}")]
    Query(DieselError),
}

impl From<DieselError> for WriteRecordError {
    fn from(err: DieselError) -> Self {
        classify_store_error(err)
    }
}

impl From<UpsertRepositoryError> for WriteRecordError {
    fn from(err: UpsertRepositoryError) -> Self {
        match err {
            UpsertRepositoryError::UpsertRepository { source } => classify_store_error(source),
        }
    }
}

impl From<AppendStarObservationError> for WriteRecordError {
    fn from(err: AppendStarObservationError) -> Self {
        match err {
            AppendStarObservationError::AppendStarObservation { source } => classify_store_error(source),
        }
    }
}

fn classify_store_error(err: DieselError) -> WriteRecordError {
    match err {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::UniqueViolation
            | DatabaseErrorKind::ForeignKeyViolation
            | DatabaseErrorKind::NotNullViolation
            | DatabaseErrorKind::CheckViolation => {
                let constraint = info
                    .constraint_name()
                    .map(|name| format!(" ({name})"))
                    .unwrap_or_default();
                WriteRecordError::Constraint(format!("{kind:?}{constraint}: {}", info.message()))
            }
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::SerializationFailure => {
                WriteRecordError::Unavailable(format!("{kind:?}: {}", info.message()))
            }
            _ => WriteRecordError::Query(DieselError::DatabaseError(kind, info)),
        },
        other => WriteRecordError::Query(other),
    }
}

fn write_record(
    pool: &PgPool,
    record: &RawRepository,
    star_count: i32,
    recorded_at: NaiveDateTime,
    crawled_at: NaiveDateTime,
) -> Result<bool, WriteRecordError> {
    let mut conn = pool
        .get()
        .map_err(|source| WriteRecordError::Unavailable(format!("GetConnectionFromPool: {source}")))?;

    conn.transaction::<bool, WriteRecordError, _>(|conn| {
        // the repository row has to exist before its observation references it
        upsert_repository(conn, &NewRepository::from_raw(record, crawled_at))?;

        let appended = append_star_observation(
            conn,
            &NewStarObservation {
                repository_id: record.id,
                star_count,
                recorded_at: Some(recorded_at),
            },
        )?;

        Ok(appended)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel::PgConnection;
    use interfaces_github_repositories::ManualClock;

    fn repo(id: i64, full_name: &str, stars: i64) -> RawRepository {
        let (owner, name) = full_name.split_once('/').unwrap();
        RawRepository {
            id,
            name: name.to_string(),
            owner: owner.to_string(),
            full_name: full_name.to_string(),
            created_at: None,
            updated_at: None,
            stars,
        }
    }

    #[test]
    fn coalesce_keeps_last_values_at_first_position() {
        let batch = vec![repo(1, "a/b", 10), repo(2, "c/d", 3), repo(1, "a/b", 15)];

        let coalesced = coalesce_batch(&batch);

        assert_eq!(coalesced.len(), 2);
        assert_eq!(coalesced[0].id, 1);
        assert_eq!(coalesced[0].stars, 15);
        assert_eq!(coalesced[1].id, 2);
    }

    #[test]
    fn coalesce_leaves_distinct_records_alone() {
        let batch = vec![repo(3, "x/y", 1), repo(1, "a/b", 2), repo(2, "c/d", 3)];

        assert_eq!(coalesce_batch(&batch), batch);
    }

    #[test]
    fn validation_rejects_what_the_schema_would() {
        assert_eq!(validate_record(&repo(1, "a/b", 42)), Ok(42));

        let long_name = format!("a/{}", "n".repeat(MAX_NAME_LEN + 1));
        assert!(validate_record(&repo(1, &long_name, 1)).unwrap_err().contains("name"));

        assert!(validate_record(&repo(1, "a/b", -1)).is_err());
        assert!(validate_record(&repo(1, "a/b", i64::from(i32::MAX) + 1)).is_err());

        let mut unnamed = repo(1, "a/b", 1);
        unnamed.owner.clear();
        assert_eq!(validate_record(&unnamed), Err("owner is empty".to_string()));
    }

    #[test]
    fn validation_counts_characters_not_bytes() {
        let name = "é".repeat(MAX_NAME_LEN);
        let record = repo(1, &format!("o/{name}"), 1);

        assert!(validate_record(&record).is_ok());
    }

    #[test]
    fn bucket_is_truncated_to_microseconds() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);

        let bucket = observation_bucket(now);

        assert_eq!(bucket.and_utc().timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn store_errors_are_sorted_by_recoverability() {
        assert!(matches!(
            classify_store_error(DieselError::NotFound),
            WriteRecordError::Query(DieselError::NotFound)
        ));
        assert!(matches!(
            classify_store_error(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                Box::new("duplicate key value violates unique constraint".to_string()),
            )),
            WriteRecordError::Constraint(_)
        ));
        assert!(matches!(
            classify_store_error(DieselError::DatabaseError(
                DatabaseErrorKind::SerializationFailure,
                Box::new("could not serialize access".to_string()),
            )),
            WriteRecordError::Unavailable(_)
        ));
    }

    /// Nothing listens on port 1, so every checkout times out.
    fn unreachable_engine(clock: &ManualClock) -> UpsertEngine {
        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_millis(200))
            .build_unchecked(ConnectionManager::<PgConnection>::new(
                "postgres://crawler@127.0.0.1:1/unreachable",
            ));
        let bucket = observation_bucket(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

        UpsertEngine::new(pool, bucket, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn store_outage_is_retried_with_backoff_then_fatal() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let mut engine = unreachable_engine(&clock);

        let result = engine.persist_batch(&[repo(1, "a/b", 10)]).await;

        assert!(matches!(
            result,
            Err(PersistBatchError::StoreUnavailable {
                repository_id: 1,
                attempts: 3,
                ..
            })
        ));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
    }

    #[tokio::test]
    async fn single_store_attempt_gives_up_without_sleeping() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let mut engine = unreachable_engine(&clock).with_store_attempts(1);

        let result = engine.persist_batch(&[repo(7, "c/d", 1)]).await;

        assert!(matches!(
            result,
            Err(PersistBatchError::StoreUnavailable {
                repository_id: 7,
                attempts: 1,
                ..
            })
        ));
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn engine_keeps_the_bucket_it_was_given() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let engine = unreachable_engine(&clock);

        assert_eq!(
            engine.recorded_at(),
            observation_bucket(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
    }
}
