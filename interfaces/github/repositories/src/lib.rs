//! GitHub GraphQL repository search client
//!
//! - `index`: the client, `fetch_page` and `rate_limit_status`
//! - `retry`: backoff and rate-limit wait policy
//! - `clock`: time source used for every wait
//! - Expects a bearer token; where it comes from is the caller's business

pub mod clock;
pub mod error;
pub mod index;
pub mod retry;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FetchPageError, NewGitHubClientError};
pub use index::GitHubClient;
pub use retry::RetryPolicy;
pub use types::{Page, RateLimit, RawRepository, MAX_PAGE_SIZE};
