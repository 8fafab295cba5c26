use diesel::prelude::*;
use thiserror::Error;

use crate::db::{schema::repository_stars::dsl::*, star::models::*};

#[derive(Debug, Error)]
pub enum AppendStarObservationError {
    #[error("AppendStarObservation: {source}")]
    AppendStarObservation {
        #[from]
        source: diesel::result::Error,
    },
}

/// Returns `true` when a row was written, `false` when the repository
/// already has an observation for this `recorded_at`.
pub fn append_star_observation(
    conn: &mut PgConnection,
    new: &NewStarObservation,
) -> Result<bool, AppendStarObservationError> {
    diesel::insert_into(repository_stars)
        .values(new)
        .on_conflict((repository_id, recorded_at))
        .do_nothing()
        .execute(conn)
        .map(|inserted| inserted > 0)
        .map_err(|source| AppendStarObservationError::AppendStarObservation { source })
}

#[derive(Debug, Error)]
pub enum GetStarHistoryError {
    #[error("GetStarHistory: {source}")]
    GetStarHistory {
        #[from]
        source: diesel::result::Error,
    },
}

/// Every observation for one repository, oldest first.
pub fn get_star_history(
    conn: &mut PgConnection,
    repo_id_val: i64,
) -> Result<Vec<StarObservation>, GetStarHistoryError> {
    repository_stars
        .filter(repository_id.eq(repo_id_val))
        .order((recorded_at.asc(), id.asc()))
        .select(StarObservation::as_select())
        .load(conn)
        .map_err(|source| GetStarHistoryError::GetStarHistory { source })
}
