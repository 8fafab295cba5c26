use chrono::NaiveDateTime;
use diesel::prelude::*;
use interfaces_github_repositories::RawRepository;

use crate::db::schema::repositories;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable)]
#[diesel(table_name = repositories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub full_name: String,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub last_crawled_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = repositories)]
pub struct NewRepository<'a> {
    pub id: i64,
    pub name: &'a str,
    pub owner: &'a str,
    pub full_name: &'a str,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
    pub last_crawled_at: Option<NaiveDateTime>,
}

impl<'a> NewRepository<'a> {
    pub fn from_raw(raw: &'a RawRepository, crawled_at: NaiveDateTime) -> Self {
        Self {
            id: raw.id,
            name: &raw.name,
            owner: &raw.owner,
            full_name: &raw.full_name,
            created_at: raw.created_at.map(|ts| ts.naive_utc()),
            updated_at: raw.updated_at.map(|ts| ts.naive_utc()),
            last_crawled_at: Some(crawled_at),
        }
    }
}
