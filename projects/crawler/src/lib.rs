//! GitHub repository star crawler
//!
//! - GraphQL pages come from `interfaces_github_repositories`
//! - PostgreSQL schema, models and queries in `db/`
//! - Upsert engine, checkpoints and the crawl loop in `pipeline/`
//! - CSV snapshot export in `utils/`
//! - Needs GITHUB_TOKEN and DATABASE_URL, see `config`

pub mod config;
pub mod db;
pub mod pipeline;
pub mod utils;
