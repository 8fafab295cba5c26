use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::db::{
    snapshot::{
        models::SnapshotRow,
        queries::{load_latest_snapshot, LoadLatestSnapshotError},
    },
    PgPool,
};

pub const DEFAULT_EXPORT_PATH: &str = "repositories_export.csv";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("GetConnection: {source}")]
    GetConnection {
        #[from]
        source: r2d2::Error,
    },

    #[error("LoadLatestSnapshot: {source}")]
    LoadLatestSnapshot {
        #[from]
        source: LoadLatestSnapshotError,
    },

    #[error("CreateFile: {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("WriteCsv: {source}")]
    WriteCsv {
        #[from]
        source: csv::Error,
    },

    #[error("Flush: {source}")]
    Flush {
        #[from]
        source: std::io::Error,
    },
}

/// Writes the header and one line per row; returns the number of rows.
/// The header is written even when there are no rows.
pub fn write_snapshot_csv<W: Write>(rows: &[SnapshotRow], writer: W) -> Result<usize, ExportError> {
    let mut csv = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);

    csv.write_record([
        "id",
        "full_name",
        "owner",
        "name",
        "star_count",
        "recorded_at",
        "created_at",
        "updated_at",
        "last_crawled_at",
    ])?;
    for row in rows {
        csv.serialize(row)?;
    }
    csv.flush()?;

    Ok(rows.len())
}

/// Loads the latest snapshot and writes it to `path`. Blocking; run it off
/// the async runtime.
pub fn export_snapshot(pool: &PgPool, path: &Path) -> Result<usize, ExportError> {
    let mut conn = pool.get()?;
    let rows = load_latest_snapshot(&mut conn)?;

    let file = File::create(path).map_err(|source| ExportError::CreateFile {
        path: path.to_path_buf(),
        source,
    })?;
    let written = write_snapshot_csv(&rows, file)?;

    info!(rows = written, path = %path.display(), "Exported snapshot");
    Ok(written)
}
