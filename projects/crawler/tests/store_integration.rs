//! Runs against a real PostgreSQL when `TEST_DATABASE_URL` is set, and is a
//! no-op otherwise.

mod common;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use chrono::NaiveDateTime;
use common::{repo, start};
use diesel::prelude::*;
use interfaces_github_repositories::{ManualClock, RawRepository};
use projects_crawler::{
    db::{
        build_pool,
        repository::queries::get_repository,
        schema::{repositories, repository_stars},
        setup_schema,
        snapshot::queries::load_latest_snapshot,
        star::{
            models::NewStarObservation,
            queries::{append_star_observation, get_star_history},
        },
        PgPool,
    },
    pipeline::upsert::index::{observation_bucket, BatchSink, UpsertEngine},
    utils::csv_export::write_snapshot_csv,
};

static NEXT_ID: AtomicI64 = AtomicI64::new(0);

/// Ids far above anything GitHub hands out, distinct per test and per run.
fn fresh_id() -> i64 {
    let run = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64 % 1_000_000)
        .unwrap_or_default();
    9_000_000_000_000 + run * 1_000 + NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

fn named(id: i64, owner: &str, name: &str, stars: i64) -> RawRepository {
    RawRepository {
        owner: owner.to_string(),
        name: name.to_string(),
        full_name: format!("{owner}/{name}"),
        ..repo(id, stars)
    }
}

fn pool() -> Result<Option<PgPool>> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return Ok(None);
    };
    let pool = build_pool(&url, 2)?;
    let mut conn = pool.get()?;
    setup_schema(&mut conn)?;
    Ok(Some(pool))
}

fn engine(pool: &PgPool, recorded_at: NaiveDateTime) -> UpsertEngine {
    UpsertEngine::new(pool.clone(), recorded_at, Arc::new(ManualClock::new(start())))
}

fn cleanup(pool: &PgPool, ids: &[i64]) -> Result<()> {
    let mut conn = pool.get()?;
    diesel::delete(repository_stars::table.filter(repository_stars::repository_id.eq_any(ids)))
        .execute(&mut conn)?;
    diesel::delete(repositories::table.filter(repositories::id.eq_any(ids))).execute(&mut conn)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn same_batch_twice_leaves_one_observation_per_bucket() -> Result<()> {
    let Some(pool) = pool()? else { return Ok(()) };
    let ids = [fresh_id(), fresh_id()];
    let batch: Vec<RawRepository> = ids.iter().map(|id| named(*id, "idem", &id.to_string(), 42)).collect();
    let mut sink = engine(&pool, observation_bucket(start()));

    let first = sink.persist_batch(&batch).await?;
    let second = sink.persist_batch(&batch).await?;

    assert_eq!(first.written, 2);
    assert_eq!(first.star_observations_appended, 2);
    assert_eq!(second.written, 2);
    assert_eq!(second.star_observations_appended, 0);

    let mut conn = pool.get()?;
    for id in ids {
        assert_eq!(get_star_history(&mut conn, id)?.len(), 1);
        assert!(get_repository(&mut conn, id)?.is_some());
    }

    cleanup(&pool, &ids)
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_in_batch_keeps_last_star_count() -> Result<()> {
    let Some(pool) = pool()? else { return Ok(()) };
    let id = fresh_id();
    let owner = format!("a{id}");
    let bucket = observation_bucket(start());

    let result = engine(&pool, bucket)
        .persist_batch(&[named(id, &owner, "b", 10), named(id, &owner, "b", 15)])
        .await?;

    assert_eq!(result.written, 1);
    let mut conn = pool.get()?;
    let history = get_star_history(&mut conn, id)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].star_count, 15);
    assert_eq!(history[0].recorded_at, Some(bucket));

    // a different bucket is a new observation
    let later = observation_bucket(start() + chrono::Duration::hours(1));
    engine(&pool, later)
        .persist_batch(&[named(id, &owner, "b", 20)])
        .await?;
    let history = get_star_history(&mut conn, id)?;
    assert_eq!(
        history.iter().map(|o| o.star_count).collect::<Vec<_>>(),
        vec![15, 20]
    );

    cleanup(&pool, &[id])
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_onto_a_taken_full_name_is_a_failed_record() -> Result<()> {
    let Some(pool) = pool()? else { return Ok(()) };
    let (holder, newcomer, bystander) = (fresh_id(), fresh_id(), fresh_id());
    let owner = format!("o{holder}");
    let mut sink = engine(&pool, observation_bucket(start()));

    sink.persist_batch(&[named(holder, &owner, "taken", 1)]).await?;
    let result = sink
        .persist_batch(&[
            named(newcomer, &owner, "taken", 2),
            named(bystander, &owner, "free", 3),
        ])
        .await?;

    assert_eq!(result.written, 1);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].record.id, newcomer);

    let mut conn = pool.get()?;
    assert!(get_repository(&mut conn, newcomer)?.is_none());
    assert!(get_star_history(&mut conn, newcomer)?.is_empty());
    assert!(get_repository(&mut conn, bystander)?.is_some());

    cleanup(&pool, &[holder, newcomer, bystander])
}

#[tokio::test(flavor = "multi_thread")]
async fn observation_for_unknown_repository_is_rejected() -> Result<()> {
    let Some(pool) = pool()? else { return Ok(()) };
    let mut conn = pool.get()?;

    let orphan = NewStarObservation {
        repository_id: fresh_id(),
        star_count: 1,
        recorded_at: Some(observation_bucket(start())),
    };

    assert!(append_star_observation(&mut conn, &orphan).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn export_uses_the_latest_observation() -> Result<()> {
    let Some(pool) = pool()? else { return Ok(()) };
    let id = fresh_id();
    let owner = format!("x{id}");

    engine(&pool, observation_bucket(start()))
        .persist_batch(&[named(id, &owner, "snap", 5)])
        .await?;
    engine(&pool, observation_bucket(start() + chrono::Duration::days(1)))
        .persist_batch(&[named(id, &owner, "snap", 8)])
        .await?;

    let mut conn = pool.get()?;
    let rows = load_latest_snapshot(&mut conn)?;
    let ours: Vec<_> = rows.into_iter().filter(|row| row.id == id).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].star_count, 8);

    let mut out = Vec::new();
    write_snapshot_csv(&ours, &mut out)?;
    let text = String::from_utf8(out)?;
    assert!(text.lines().nth(1).unwrap().starts_with(&format!("{id},{owner}/snap,{owner},snap,8,")));

    cleanup(&pool, &[id])
}
