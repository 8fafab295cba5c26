use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest `first:` value GitHub accepts on a connection.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A repository as the crawler sees it, after leaving the GraphQL envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRepository {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub full_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub stars: i64,
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// In the order the remote returned them.
    pub records: Vec<RawRepository>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cost: Option<u32>,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimit {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}

// Wire format

#[derive(Debug, Deserialize)]
pub struct GraphQLResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphQLError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQLError {
    pub fn is_rate_limited(&self) -> bool {
        self.kind.as_deref() == Some("RATE_LIMITED")
    }

    /// Schema validation failures carry a machine-readable code; execution
    /// failures (timeouts, "something went wrong") do not.
    pub fn is_validation(&self) -> bool {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .is_some()
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchData {
    pub search: Option<SearchConnection>,
    #[serde(rename = "rateLimit", default)]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitData {
    #[serde(rename = "rateLimit")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
pub struct SearchConnection {
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    #[serde(default)]
    pub nodes: Vec<Option<SearchNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

/// `... on Repository` fragment; non-repository hits deserialize as `{}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchNode {
    pub database_id: Option<i64>,
    pub name: Option<String>,
    pub name_with_owner: Option<String>,
    pub owner: Option<OwnerNode>,
    pub stargazer_count: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct OwnerNode {
    pub login: String,
}
