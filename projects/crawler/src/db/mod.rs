pub mod repository;
pub mod schema;
pub mod snapshot;
pub mod star;

use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use thiserror::Error;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

/// DDL for both tables and their indexes; safe to apply repeatedly.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const DEFAULT_POOL_SIZE: u32 = 4;

#[derive(Debug, Error)]
pub enum BuildPoolError {
    #[error("BuildPool: {source}")]
    BuildPool {
        #[from]
        source: r2d2::Error,
    },
}

pub fn build_pool(database_url: &str, max_size: u32) -> Result<PgPool, BuildPoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);

    Pool::builder()
        .max_size(max_size.max(1))
        .connection_timeout(Duration::from_secs(30))
        .build(manager)
        .map_err(|source| BuildPoolError::BuildPool { source })
}

#[derive(Debug, Error)]
pub enum SetupSchemaError {
    #[error("SetupSchema: {source}")]
    SetupSchema {
        #[from]
        source: diesel::result::Error,
    },
}

pub fn setup_schema(conn: &mut PgConnection) -> Result<(), SetupSchemaError> {
    conn.batch_execute(SCHEMA_SQL)
        .map_err(|source| SetupSchemaError::SetupSchema { source })
}
