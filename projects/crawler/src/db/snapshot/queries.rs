use diesel::prelude::*;
use thiserror::Error;

use crate::db::snapshot::models::SnapshotRow;

const LATEST_SNAPSHOT_SQL: &str = r#"
    SELECT id, full_name, owner, name, star_count, recorded_at,
           created_at, updated_at, last_crawled_at
    FROM (
        SELECT DISTINCT ON (r.id)
               r.id, r.full_name, r.owner, r.name,
               rs.star_count, rs.recorded_at,
               r.created_at, r.updated_at, r.last_crawled_at
        FROM repositories r
        JOIN repository_stars rs ON rs.repository_id = r.id
        ORDER BY r.id, rs.recorded_at DESC NULLS LAST, rs.id DESC
    ) latest
    ORDER BY star_count DESC, id
"#;

#[derive(Debug, Error)]
pub enum LoadLatestSnapshotError {
    #[error("LoadLatestSnapshot: {source}")]
    LoadLatestSnapshot {
        #[from]
        source: diesel::result::Error,
    },
}

/// One row per repository that has at least one observation, most starred
/// first.
pub fn load_latest_snapshot(
    conn: &mut PgConnection,
) -> Result<Vec<SnapshotRow>, LoadLatestSnapshotError> {
    diesel::sql_query(LATEST_SNAPSHOT_SQL)
        .load::<SnapshotRow>(conn)
        .map_err(|source| LoadLatestSnapshotError::LoadLatestSnapshot { source })
}
