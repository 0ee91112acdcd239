//! GraphQL documents and the builders that feed them.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scout_core::SearchFilters;

use crate::{DiscoveryError, RepoRef};

/// Repository search. The search string travels in `$query`.
pub const SEARCH_QUERY: &str = r#"
query($query: String!, $first: Int!, $after: String) {
  search(query: $query, type: REPOSITORY, first: $first, after: $after) {
    repositoryCount
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on Repository {
        databaseId
        owner { login }
        name
        url
        description
        primaryLanguage { name }
        languages(first: 10) { nodes { name } }
        stargazerCount
        forkCount
        issues(states: OPEN) { totalCount }
        repositoryTopics(first: 20) { nodes { topic { name } } }
        licenseInfo { spdxId }
        pushedAt
        createdAt
        goodFirstIssues: issues(labels: ["good first issue"], states: OPEN) { totalCount }
        helpWantedIssues: issues(labels: ["help wanted"], states: OPEN) { totalCount }
      }
    }
  }
  rateLimit { remaining resetAt }
}
"#;

pub const README_EXPRESSION: &str = "HEAD:README.md";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("identifier pattern compiles"));

pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

fn qualifier(key: &str, value: &str) -> String {
    if value.chars().any(char::is_whitespace) {
        format!("{key}:\"{value}\"")
    } else {
        format!("{key}:{value}")
    }
}

/// GitHub search syntax for `filters`, with the activity cutoff resolved against `today`.
pub fn build_search_query(filters: &SearchFilters, today: NaiveDate) -> String {
    let mut parts = filters
        .languages()
        .iter()
        .map(|lang| qualifier("language", lang))
        .collect::<Vec<_>>();
    parts.push(format!("stars:{}..{}", filters.min_stars(), filters.max_stars()));
    parts.push(format!(
        "pushed:>={}",
        filters.activity_cutoff(today).format("%Y-%m-%d")
    ));
    parts.extend(filters.topics().iter().map(|topic| qualifier("topic", topic)));
    if let Some(license) = filters.license() {
        parts.push(qualifier("license", license));
    }
    parts.push("archived:false".to_string());
    parts.push("fork:false".to_string());
    parts.join(" ")
}

/// Builds one multi-alias query fetching a readme blob per repository.
#[derive(Debug, Clone)]
pub struct ReadmeQueryBuilder {
    expression: String,
    offset: usize,
}

impl Default for ReadmeQueryBuilder {
    fn default() -> Self {
        Self {
            expression: README_EXPRESSION.to_string(),
            offset: 0,
        }
    }
}

impl ReadmeQueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first alias, so aliases stay unique across batches.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn alias(&self, index: usize) -> String {
        format!("repo_{}", self.offset + index)
    }

    /// Render the query. Any identifier outside `[A-Za-z0-9._-]` fails the whole batch.
    pub fn build(&self, repos: &[RepoRef]) -> Result<String, DiscoveryError> {
        validate_all(repos)?;
        let fields = repos
            .iter()
            .enumerate()
            .map(|(i, repo)| {
                format!(
                    "  {alias}: repository(owner: \"{owner}\", name: \"{name}\") {{\n    object(expression: \"{expr}\") {{ ... on Blob {{ text }} }}\n  }}",
                    alias = self.alias(i),
                    owner = repo.owner,
                    name = repo.name,
                    expr = self.expression,
                )
            })
            .collect::<Vec<_>>();
        Ok(format!("query {{\n{}\n}}", fields.join("\n")))
    }
}

pub fn validate_all(repos: &[RepoRef]) -> Result<(), DiscoveryError> {
    for repo in repos {
        for part in [&repo.owner, &repo.name] {
            if !is_valid_identifier(part) {
                return Err(DiscoveryError::InvalidIdentifier(repo.key()));
            }
        }
    }
    Ok(())
}
