//! Repository discovery against the GitHub GraphQL API.

pub mod query;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use scout_core::{RepositoryMetadata, SearchFilters};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub use query::{build_search_query, ReadmeQueryBuilder};

pub const CRATE_NAME: &str = "scout-github";

pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";
pub const SEARCH_PAGE_SIZE: usize = 100;
pub const RATE_LIMIT_THRESHOLD: u32 = 100;
/// GitHub never returns more than this many search hits.
pub const SEARCH_RESULT_CAP: u64 = 1_000;
pub const README_BATCH_SIZE: usize = 20;
pub const MAX_README_CHARS: usize = 16_000;

pub const RESULT_CAP_WARNING: &str =
    "Results may be incomplete (GitHub caps at 1,000). Try narrowing your filters.";
pub const RATE_LIMIT_WARNING: &str = "GitHub rate limit approaching. Returning partial results.";
pub const PARTIAL_SEARCH_WARNING: &str = "GitHub search failed part-way; results may be partial.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("GitHub rejected the credentials (HTTP 401)")]
    Unauthorized,
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("graphql error: {0}")]
    GraphQl(String),
    #[error("decoding GitHub response: {0}")]
    Decode(String),
    #[error("invalid repository identifier `{0}`")]
    InvalidIdentifier(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

impl DiscoveryError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            DiscoveryError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            DiscoveryError::Request(err) => classify_reqwest_error(err),
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    /// Bad credentials; every later call would fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DiscoveryError::Unauthorized)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the base delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        delay + delay.mul_f64(rand::random::<f64>() * self.jitter.max(0.0))
    }
}

/// `owner/name` pair handed to the readme fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl From<&RepositoryMetadata> for RepoRef {
    fn from(repo: &RepositoryMetadata) -> Self {
        RepoRef::new(repo.owner.clone(), repo.name.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    pub repos: Vec<RepositoryMetadata>,
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait RepositorySource: Send + Sync {
    async fn search(&self, filters: &SearchFilters) -> Result<SearchResults, DiscoveryError>;

    /// Readme text per `owner/name`; `None` marks a repository without one.
    async fn fetch_long_text(
        &self,
        repos: &[RepoRef],
    ) -> Result<HashMap<String, Option<String>>, DiscoveryError>;
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub graphql_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub page_size: usize,
    /// Pagination stops once this many repositories have been fetched.
    pub max_total: usize,
    pub rate_limit_threshold: u32,
    pub readme_batch_size: usize,
    pub max_readme_chars: usize,
    pub backoff: BackoffPolicy,
}

impl GitHubConfig {
    /// Defaults sized for an analysis cap of `max_repos`.
    pub fn new(token: impl Into<String>, max_repos: usize) -> Self {
        Self {
            token: token.into(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            user_agent: "repo-scout/0.1".to_string(),
            timeout: Duration::from_secs(30),
            page_size: SEARCH_PAGE_SIZE,
            max_total: max_repos.saturating_mul(2),
            rate_limit_threshold: RATE_LIMIT_THRESHOLD,
            readme_batch_size: README_BATCH_SIZE,
            max_readme_chars: MAX_README_CHARS,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlErrorMessage>,
}

#[derive(Debug, Deserialize)]
struct GraphQlErrorMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    search: SearchConnection,
    #[serde(rename = "rateLimit")]
    rate_limit: Option<RateLimitInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchConnection {
    repository_count: u64,
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Option<RepoNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitInfo {
    remaining: u32,
    reset_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<Option<T>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TotalCount {
    total_count: u32,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    login: String,
}

#[derive(Debug, Deserialize)]
struct TopicNode {
    topic: Option<Named>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicenseNode {
    spdx_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RepoNode {
    database_id: Option<i64>,
    owner: Option<OwnerNode>,
    name: Option<String>,
    url: Option<String>,
    description: Option<String>,
    primary_language: Option<Named>,
    languages: Option<Nodes<Named>>,
    stargazer_count: Option<u32>,
    fork_count: Option<u32>,
    issues: Option<TotalCount>,
    repository_topics: Option<Nodes<TopicNode>>,
    license_info: Option<LicenseNode>,
    pushed_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    good_first_issues: Option<TotalCount>,
    help_wanted_issues: Option<TotalCount>,
}

fn total(count: Option<TotalCount>) -> u32 {
    count.map(|c| c.total_count).unwrap_or(0)
}

impl RepoNode {
    /// Nodes without an id, owner or name cannot be cached and are dropped.
    fn into_metadata(self) -> Option<RepositoryMetadata> {
        let host_id = self.database_id?;
        let owner = self.owner?.login;
        let name = self.name?;
        let url = self
            .url
            .unwrap_or_else(|| format!("https://github.com/{owner}/{name}"));
        Some(RepositoryMetadata {
            host_id,
            url,
            description: self.description,
            primary_language: self.primary_language.and_then(|l| l.name),
            languages: self
                .languages
                .map(|l| l.nodes.into_iter().flatten().filter_map(|n| n.name).collect())
                .unwrap_or_default(),
            star_count: self.stargazer_count.unwrap_or(0),
            fork_count: self.fork_count.unwrap_or(0),
            open_issue_count: total(self.issues),
            topics: self
                .repository_topics
                .map(|t| {
                    t.nodes
                        .into_iter()
                        .flatten()
                        .filter_map(|n| n.topic.and_then(|topic| topic.name))
                        .collect()
                })
                .unwrap_or_default(),
            license: self.license_info.and_then(|l| l.spdx_id),
            pushed_at: self.pushed_at,
            created_at: self.created_at,
            good_first_issue_count: total(self.good_first_issues),
            help_wanted_count: total(self.help_wanted_issues),
            owner,
            name,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReadmeRepo {
    object: Option<ReadmeBlob>,
}

#[derive(Debug, Deserialize)]
struct ReadmeBlob {
    #[serde(default)]
    text: Option<String>,
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text,
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    config: GitHubConfig,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    async fn post_once<T: DeserializeOwned>(&self, body: &JsonValue) -> Result<T, DiscoveryError> {
        let resp = self
            .http
            .post(&self.config.graphql_url)
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(DiscoveryError::Unauthorized);
        }
        if !status.is_success() {
            return Err(DiscoveryError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let bytes = resp.bytes().await?;
        let envelope: GraphQlEnvelope<T> =
            serde_json::from_slice(&bytes).map_err(|e| DiscoveryError::Decode(e.to_string()))?;
        match envelope.data {
            Some(data) => {
                if !envelope.errors.is_empty() {
                    debug!(errors = envelope.errors.len(), "graphql response carried partial errors");
                }
                Ok(data)
            }
            None => {
                let message = envelope
                    .errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(DiscoveryError::GraphQl(if message.is_empty() {
                    "response carried no data".to_string()
                } else {
                    message
                }))
            }
        }
    }

    /// POST a GraphQL document, retrying transient failures with jittered backoff.
    async fn execute<T: DeserializeOwned>(
        &self,
        document: &str,
        variables: JsonValue,
    ) -> Result<T, DiscoveryError> {
        let body = json!({ "query": document, "variables": variables });
        let attempts = self.config.backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match self.post_once(&body).await {
                Ok(data) => return Ok(data),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.config.backoff.jittered_delay(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %err, "transient GitHub failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn search_pages(&self, search_query: &str) -> Result<SearchResults, DiscoveryError> {
        let mut results = SearchResults::default();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        let mut cap_warned = false;

        loop {
            let variables = json!({
                "query": search_query,
                "first": self.config.page_size,
                "after": cursor,
            });
            let data: SearchData = match self.execute(query::SEARCH_QUERY, variables).await {
                Ok(data) => data,
                Err(err) if pages == 0 || err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(pages, error = %err, "search pagination failed, keeping fetched pages");
                    results.warnings.push(PARTIAL_SEARCH_WARNING.to_string());
                    break;
                }
            };
            pages += 1;

            if data.search.repository_count >= SEARCH_RESULT_CAP && !cap_warned {
                results.warnings.push(RESULT_CAP_WARNING.to_string());
                cap_warned = true;
            }
            results.repos.extend(
                data.search
                    .nodes
                    .into_iter()
                    .flatten()
                    .filter_map(RepoNode::into_metadata),
            );

            if let Some(rate) = &data.rate_limit {
                if rate.remaining < self.config.rate_limit_threshold {
                    warn!(remaining = rate.remaining, reset_at = ?rate.reset_at, "GitHub rate limit low, stopping pagination");
                    results.warnings.push(RATE_LIMIT_WARNING.to_string());
                    break;
                }
            }

            let page_info = data.search.page_info;
            if !page_info.has_next_page || results.repos.len() >= self.config.max_total {
                break;
            }
            match page_info.end_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(pages, repos = results.repos.len(), "search finished");
        Ok(results)
    }

    async fn fetch_readme_batch(
        &self,
        offset: usize,
        batch: &[RepoRef],
    ) -> Result<HashMap<String, Option<String>>, DiscoveryError> {
        let builder = ReadmeQueryBuilder::new().offset(offset);
        let document = builder.build(batch)?;
        let mut data: HashMap<String, Option<ReadmeRepo>> =
            self.execute(&document, json!({})).await?;

        Ok(batch
            .iter()
            .enumerate()
            .map(|(i, repo)| {
                let text = data
                    .remove(&builder.alias(i))
                    .flatten()
                    .and_then(|r| r.object)
                    .and_then(|blob| blob.text)
                    .map(|text| truncate_chars(text, self.config.max_readme_chars));
                (repo.key(), text)
            })
            .collect())
    }
}

#[async_trait]
impl RepositorySource for GitHubClient {
    async fn search(&self, filters: &SearchFilters) -> Result<SearchResults, DiscoveryError> {
        let search_query = build_search_query(filters, Utc::now().date_naive());
        let span = info_span!("github_search", query = %search_query);
        self.search_pages(&search_query).instrument(span).await
    }

    async fn fetch_long_text(
        &self,
        repos: &[RepoRef],
    ) -> Result<HashMap<String, Option<String>>, DiscoveryError> {
        let mut texts = HashMap::with_capacity(repos.len());
        if repos.is_empty() {
            return Ok(texts);
        }
        query::validate_all(repos)?;

        let span = info_span!("github_readmes", repos = repos.len());
        async {
            let batch_size = self.config.readme_batch_size.max(1);
            for (index, batch) in repos.chunks(batch_size).enumerate() {
                match self.fetch_readme_batch(index * batch_size, batch).await {
                    Ok(fetched) => texts.extend(fetched),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(batch = index, error = %err, "readme batch failed, treating as absent");
                        texts.extend(batch.iter().map(|repo| (repo.key(), None)));
                    }
                }
            }
            Ok(texts)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let delay = policy.jittered_delay(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn only_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
        let err = DiscoveryError::HttpStatus {
            status: 503,
            url: "x".into(),
        };
        assert!(err.is_transient());
        assert!(!DiscoveryError::Unauthorized.is_transient());
        assert!(DiscoveryError::Unauthorized.is_fatal());
        assert!(!DiscoveryError::GraphQl("bad".into()).is_transient());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld".to_string(), 7), "héllo w");
        assert_eq!(truncate_chars("short".to_string(), 16_000), "short");
    }

    #[test]
    fn repo_nodes_missing_identity_are_dropped() {
        let node: RepoNode = serde_json::from_value(json!({
            "owner": { "login": "x" },
            "name": "y"
        }))
        .unwrap();
        assert!(node.into_metadata().is_none());

        let node: RepoNode = serde_json::from_value(json!({
            "databaseId": 42,
            "owner": { "login": "x" },
            "name": "y",
            "primaryLanguage": null,
            "languages": { "nodes": [{ "name": "Rust" }, null] },
            "issues": { "totalCount": 3 },
            "repositoryTopics": { "nodes": [{ "topic": { "name": "cli" } }] },
            "licenseInfo": { "spdxId": "MIT" },
            "pushedAt": "2026-09-01T10:00:00Z",
            "goodFirstIssues": { "totalCount": 1 }
        }))
        .unwrap();
        let repo = node.into_metadata().unwrap();
        assert_eq!(repo.url, "https://github.com/x/y");
        assert_eq!(repo.languages, ["Rust"]);
        assert_eq!(repo.topics, ["cli"]);
        assert_eq!(repo.open_issue_count, 3);
        assert_eq!(repo.good_first_issue_count, 1);
        assert_eq!(repo.help_wanted_count, 0);
        assert_eq!(repo.license.as_deref(), Some("MIT"));
        assert!(repo.pushed_at.is_some());
    }
}
