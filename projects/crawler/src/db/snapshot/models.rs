use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Nullable, Timestamp, Varchar};
use serde::Serialize;

/// A repository joined with its most recent star observation. Field order
/// is the column order of the exported CSV.
#[derive(Debug, Clone, PartialEq, QueryableByName, Serialize)]
pub struct SnapshotRow {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Varchar)]
    pub full_name: String,
    #[diesel(sql_type = Varchar)]
    pub owner: String,
    #[diesel(sql_type = Varchar)]
    pub name: String,
    #[diesel(sql_type = Integer)]
    pub star_count: i32,
    #[diesel(sql_type = Nullable<Timestamp>)]
    pub recorded_at: Option<NaiveDateTime>,
    #[diesel(sql_type = Nullable<Timestamp>)]
    pub created_at: Option<NaiveDateTime>,
    #[diesel(sql_type = Nullable<Timestamp>)]
    pub updated_at: Option<NaiveDateTime>,
    #[diesel(sql_type = Nullable<Timestamp>)]
    pub last_crawled_at: Option<NaiveDateTime>,
}
