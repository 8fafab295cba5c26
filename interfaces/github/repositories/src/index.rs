use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{header::HeaderMap, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{AttemptFailure, FetchPageError, NewGitHubClientError};
use crate::retry::RetryPolicy;
use crate::types::{
    GraphQLError, GraphQLResponse, Page, RateLimit, RateLimitData, RawRepository, SearchData,
    SearchNode, MAX_PAGE_SIZE,
};

pub const GITHUB_GRAPHQL_ENDPOINT: &str = "https://api.github.com/graphql";
pub const DEFAULT_SEARCH_QUERY: &str = "stars:>1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "rust-client";

const SEARCH_REPOSITORIES_QUERY: &str = r#"
    query searchRepositories($query: String!, $first: Int!, $cursor: String) {
        search(query: $query, type: REPOSITORY, first: $first, after: $cursor) {
            pageInfo {
                hasNextPage
                endCursor
            }
            nodes {
                ... on Repository {
                    databaseId
                    name
                    nameWithOwner
                    owner {
                        login
                    }
                    stargazerCount
                    createdAt
                    updatedAt
                }
            }
        }
        rateLimit {
            limit
            cost
            remaining
            resetAt
        }
    }
"#;

const RATE_LIMIT_QUERY: &str = r#"
    query rateLimitStatus {
        rateLimit {
            limit
            cost
            remaining
            resetAt
        }
    }
"#;

/// GraphQL search client for public repositories.
///
/// `fetch_page` only returns once it has a complete page or a failure that
/// retrying cannot fix; rate-limit waits and transient retries happen inside.
pub struct GitHubClient {
    http: Client,
    endpoint: String,
    token: String,
    search_query: String,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    last_rate_limit: Option<RateLimit>,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, clock: Arc<dyn Clock>) -> Result<Self, NewGitHubClientError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(NewGitHubClientError::MissingToken);
        }

        Ok(Self {
            http: build_http_client(DEFAULT_REQUEST_TIMEOUT)?,
            endpoint: GITHUB_GRAPHQL_ENDPOINT.to_string(),
            token,
            search_query: DEFAULT_SEARCH_QUERY.to_string(),
            retry: RetryPolicy::default(),
            clock,
            last_rate_limit: None,
        })
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn with_search_query(mut self, search_query: impl Into<String>) -> Self {
        self.search_query = search_query.into();
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, NewGitHubClientError> {
        self.http = build_http_client(timeout)?;
        Ok(self)
    }

    /// Budget reported by the most recent successful response.
    pub fn last_rate_limit(&self) -> Option<&RateLimit> {
        self.last_rate_limit.as_ref()
    }

    pub async fn fetch_page(
        &mut self,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page, FetchPageError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(FetchPageError::InvalidPageSize {
                page_size,
                max: MAX_PAGE_SIZE,
            });
        }

        let payload = serde_json::json!({
            "query": SEARCH_REPOSITORIES_QUERY,
            "variables": {
                "query": self.search_query,
                "first": page_size,
                "cursor": cursor,
            }
        });

        let page = self
            .execute::<SearchData, _, _>(&payload, |response| interpret_search(response, page_size))
            .await?;

        debug!(
            records = page.records.len(),
            has_more = page.has_more,
            cursor = ?cursor,
            "Fetched search page"
        );

        self.last_rate_limit = page.rate_limit.clone();
        Ok(page)
    }

    pub async fn rate_limit_status(&mut self) -> Result<RateLimit, FetchPageError> {
        let payload = serde_json::json!({
            "query": RATE_LIMIT_QUERY,
            "variables": {}
        });

        let rate_limit = self
            .execute::<RateLimitData, _, _>(&payload, interpret_rate_limit)
            .await?;

        self.last_rate_limit = Some(rate_limit.clone());
        Ok(rate_limit)
    }

    async fn execute<T, R, F>(
        &mut self,
        payload: &serde_json::Value,
        mut interpret: F,
    ) -> Result<R, FetchPageError>
    where
        T: DeserializeOwned,
        F: FnMut(GraphQLResponse<T>) -> Result<R, AttemptFailure>,
    {
        let mut backoff = self.retry.backoff();
        let mut attempts = 0usize;

        loop {
            self.wait_for_budget().await;
            attempts += 1;

            let outcome = match self.send::<T>(payload).await {
                Ok(response) => interpret(response),
                Err(failure) => Err(failure),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(AttemptFailure::RateLimited { reset_at }) => {
                    // rate-limit waits do not count as attempts
                    attempts -= 1;
                    self.last_rate_limit = None;
                    let wait = self.retry.rate_limit_wait(self.clock.now(), reset_at);
                    warn!(
                        wait_secs = wait.as_secs(),
                        reset_at = ?reset_at,
                        "GitHub rate limit hit, waiting before retrying the same request"
                    );
                    self.clock.sleep(wait).await;
                }
                Err(AttemptFailure::Transient { reason }) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            attempt = attempts,
                            max_attempts = self.retry.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            %reason,
                            "Transient GitHub failure, retrying"
                        );
                        self.clock.sleep(delay).await;
                    }
                    None => {
                        return Err(FetchPageError::RetriesExhausted {
                            attempts,
                            last: reason,
                        })
                    }
                },
                Err(AttemptFailure::Fatal(err)) => return Err(err),
            }
        }
    }

    /// Holds the next request back while the last known budget is empty.
    async fn wait_for_budget(&mut self) {
        let reset_at = match &self.last_rate_limit {
            Some(limit) if limit.is_exhausted() => limit.reset_at,
            _ => return,
        };

        let now = self.clock.now();
        if reset_at > now {
            let wait = self.retry.rate_limit_wait(now, Some(reset_at));
            info!(
                wait_secs = wait.as_secs(),
                %reset_at,
                "GitHub budget exhausted, pausing until reset"
            );
            self.clock.sleep(wait).await;
        }
        self.last_rate_limit = None;
    }

    async fn send<T: DeserializeOwned>(
        &self,
        payload: &serde_json::Value,
    ) -> Result<GraphQLResponse<T>, AttemptFailure> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|source| AttemptFailure::Transient {
                reason: format!("RequestSend: {source}"),
            })?;

        let status = response.status();
        let headers = response.headers().clone();

        let body = response
            .text()
            .await
            .map_err(|source| AttemptFailure::Transient {
                reason: format!("ResponseRead: {source}"),
            })?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body, self.clock.now()));
        }

        let parsed = serde_json::from_str(&body).map_err(|source| {
            FetchPageError::malformed(format!("DeserializeResponseBody: {source}"))
        })?;

        Ok(parsed)
    }
}

fn build_http_client(timeout: Duration) -> Result<Client, NewGitHubClientError> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

pub(crate) fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: DateTime<Utc>,
) -> AttemptFailure {
    let message = snippet(body);

    match status {
        StatusCode::UNAUTHORIZED => AttemptFailure::Fatal(FetchPageError::Authentication { status, message }),
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
            let remaining = header_number(headers, "x-ratelimit-remaining");
            let reset_at = header_number(headers, "x-ratelimit-reset")
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            let retry_after =
                header_number(headers, "retry-after").map(|secs| now + chrono::Duration::seconds(secs));

            if remaining == Some(0) {
                AttemptFailure::RateLimited { reset_at }
            } else if retry_after.is_some() {
                AttemptFailure::RateLimited {
                    reset_at: retry_after,
                }
            } else if status == StatusCode::TOO_MANY_REQUESTS
                || body.to_ascii_lowercase().contains("rate limit")
            {
                AttemptFailure::RateLimited { reset_at: None }
            } else {
                AttemptFailure::Fatal(FetchPageError::Authentication { status, message })
            }
        }
        StatusCode::REQUEST_TIMEOUT => AttemptFailure::Transient {
            reason: format!("{status}: {message}"),
        },
        s if s.is_server_error() => AttemptFailure::Transient {
            reason: format!("{status}: {message}"),
        },
        _ => AttemptFailure::Fatal(FetchPageError::QueryRejected {
            status: Some(status),
            message,
        }),
    }
}

/// Shared handling of the `errors` array; `None` means the data can be used.
fn classify_errors(errors: &[GraphQLError], reset_at: Option<DateTime<Utc>>) -> Option<AttemptFailure> {
    if errors.is_empty() {
        return None;
    }

    if errors.iter().any(GraphQLError::is_rate_limited) {
        return Some(AttemptFailure::RateLimited { reset_at });
    }

    if let Some(err) = errors.iter().find(|err| err.is_validation()) {
        return Some(AttemptFailure::Fatal(FetchPageError::QueryRejected {
            status: None,
            message: err.message.clone(),
        }));
    }

    // Includes partial results: a page with errors may be missing nodes.
    let reason = errors
        .iter()
        .map(|err| err.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Some(AttemptFailure::Transient {
        reason: format!("GraphQL errors: {reason}"),
    })
}

pub(crate) fn interpret_search(
    response: GraphQLResponse<SearchData>,
    page_size: u32,
) -> Result<Page, AttemptFailure> {
    let GraphQLResponse { data, errors } = response;

    let reset_at = data
        .as_ref()
        .and_then(|data| data.rate_limit.as_ref())
        .map(|limit| limit.reset_at);
    if let Some(failure) = classify_errors(&errors, reset_at) {
        return Err(failure);
    }

    let data = data.ok_or_else(|| FetchPageError::malformed("response carries neither data nor errors"))?;
    let search = data
        .search
        .ok_or_else(|| FetchPageError::malformed("missing data.search"))?;

    let returned = search.nodes.len();
    let mut records = Vec::with_capacity(returned);
    for node in search.nodes.into_iter().flatten() {
        if let Some(record) = node_to_record(node)? {
            records.push(record);
        }
    }

    if records.len() < returned {
        debug!(skipped = returned - records.len(), "Skipped search hits without a repository id");
    }

    let page_info = search.page_info;
    let has_more =
        page_info.has_next_page && page_info.end_cursor.is_some() && returned >= page_size as usize;

    Ok(Page {
        records,
        next_cursor: page_info.end_cursor,
        has_more,
        rate_limit: data.rate_limit,
    })
}

fn interpret_rate_limit(response: GraphQLResponse<RateLimitData>) -> Result<RateLimit, AttemptFailure> {
    let GraphQLResponse { data, errors } = response;

    if let Some(failure) = classify_errors(&errors, None) {
        return Err(failure);
    }

    data.and_then(|data| data.rate_limit)
        .ok_or_else(|| FetchPageError::malformed("missing data.rateLimit").into())
}

fn node_to_record(node: SearchNode) -> Result<Option<RawRepository>, FetchPageError> {
    let Some(id) = node.database_id else {
        return Ok(None);
    };
    let missing = |field: &str| FetchPageError::malformed(format!("repository {id} is missing {field}"));

    Ok(Some(RawRepository {
        id,
        name: node.name.ok_or_else(|| missing("name"))?,
        owner: node
            .owner
            .map(|owner| owner.login)
            .ok_or_else(|| missing("owner"))?,
        full_name: node.name_with_owner.ok_or_else(|| missing("nameWithOwner"))?,
        created_at: node.created_at,
        updated_at: node.updated_at,
        stars: node.stargazer_count.ok_or_else(|| missing("stargazerCount"))?,
    }))
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn snippet(body: &str) -> String {
    const LIMIT: usize = 300;
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
