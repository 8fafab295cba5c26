use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::db::repository::models::Repository;
use crate::db::schema::repository_stars;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Associations)]
#[diesel(belongs_to(Repository))]
#[diesel(table_name = repository_stars)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct StarObservation {
    pub id: i32,
    pub repository_id: i64,
    pub star_count: i32,
    pub recorded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = repository_stars)]
pub struct NewStarObservation {
    pub repository_id: i64,
    pub star_count: i32,
    pub recorded_at: Option<NaiveDateTime>,
}
