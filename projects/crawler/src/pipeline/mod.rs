pub mod checkpoint;
pub mod crawl;
pub mod upsert;
