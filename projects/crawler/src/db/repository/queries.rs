use diesel::prelude::*;
use diesel::upsert::excluded;

use crate::db::{repository::models::*, schema::repositories::dsl::*};

#[derive(Debug, thiserror::Error)]
pub enum UpsertRepositoryError {
    #[error("UpsertRepository: {source}")]
    UpsertRepository {
        #[from]
        source: diesel::result::Error,
    },
}

/// Inserts a new row or refreshes the mutable columns of an existing one.
/// `created_at` keeps the value from the first sighting.
pub fn upsert_repository(
    conn: &mut PgConnection,
    new: &NewRepository,
) -> Result<Repository, UpsertRepositoryError> {
    diesel::insert_into(repositories)
        .values(new)
        .on_conflict(id)
        .do_update()
        .set((
            name.eq(excluded(name)),
            owner.eq(excluded(owner)),
            full_name.eq(excluded(full_name)),
            updated_at.eq(excluded(updated_at)),
            last_crawled_at.eq(excluded(last_crawled_at)),
        ))
        .returning(Repository::as_returning())
        .get_result(conn)
        .map_err(|source| UpsertRepositoryError::UpsertRepository { source })
}

#[derive(Debug, thiserror::Error)]
pub enum GetRepositoryError {
    #[error("GetRepository: {source}")]
    GetRepository {
        #[from]
        source: diesel::result::Error,
    },
}

pub fn get_repository(
    conn: &mut PgConnection,
    id_val: i64,
) -> Result<Option<Repository>, GetRepositoryError> {
    repositories
        .find(id_val)
        .select(Repository::as_select())
        .first(conn)
        .optional()
        .map_err(|source| GetRepositoryError::GetRepository { source })
}

#[derive(Debug, thiserror::Error)]
pub enum CountRepositoriesError {
    #[error("CountRepositories: {source}")]
    CountRepositories {
        #[from]
        source: diesel::result::Error,
    },
}

pub fn count_repositories(conn: &mut PgConnection) -> Result<i64, CountRepositoriesError> {
    repositories
        .count()
        .get_result(conn)
        .map_err(|source| CountRepositoriesError::CountRepositories { source })
}
