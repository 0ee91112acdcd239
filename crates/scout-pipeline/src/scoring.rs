//! The scoring capability: judge how well a batch of repositories fits a developer profile.

use std::time::Duration;

use async_trait::async_trait;
use scout_core::{AnalysisResult, DeveloperProfile, RepositoryMetadata};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum ScoreError {
    /// The scorer gave up on the batch itself; the batch yields no results.
    #[error("scoring was cancelled")]
    Cancelled,
    #[error("scoring request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scoring endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed scorer output: {0}")]
    Decode(String),
}

/// One repository handed to the scorer with its readme, if any was fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringInput {
    pub repo: RepositoryMetadata,
    pub long_text: Option<String>,
}

#[async_trait]
pub trait RepoScorer: Send + Sync {
    async fn score(
        &self,
        profile: &DeveloperProfile,
        batch: &[ScoringInput],
    ) -> Result<Vec<AnalysisResult>, ScoreError>;
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("N/A")
}

/// Plain-text prompt: the profile block followed by one block per repository.
pub fn build_batch_prompt(profile: &DeveloperProfile, batch: &[ScoringInput]) -> String {
    let mut lines = vec![
        "DEVELOPER PROFILE:".to_string(),
        format!("Languages: {}", profile.languages().join(", ")),
        format!("Topics: {}", profile.topics().join(", ")),
        format!("Skill Level: {}", profile.skill_level()),
        format!("Goals: {}", profile.goals()),
        String::new(),
        "REPOSITORIES TO ANALYZE:".to_string(),
    ];

    for input in batch {
        let repo = &input.repo;
        let pushed = repo.pushed_at.map(|ts| ts.to_rfc3339());
        lines.push(String::new());
        lines.push(format!("--- {} ---", repo.repo_key()));
        lines.push(format!("URL: {}", repo.url));
        lines.push(format!("Description: {}", or_na(repo.description.as_deref())));
        lines.push(format!(
            "Primary Language: {}",
            or_na(repo.primary_language.as_deref())
        ));
        lines.push(format!("Languages: {}", repo.languages.join(", ")));
        lines.push(format!("Stars: {}", repo.star_count));
        lines.push(format!("Open Issues: {}", repo.open_issue_count));
        lines.push(format!("Good First Issues: {}", repo.good_first_issue_count));
        lines.push(format!("Help Wanted: {}", repo.help_wanted_count));
        lines.push(format!("Topics: {}", repo.topics.join(", ")));
        lines.push(format!("License: {}", or_na(repo.license.as_deref())));
        lines.push(format!("Last Pushed: {}", or_na(pushed.as_deref())));
        match input.long_text.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(text) => lines.push(format!("README (excerpt):\n{text}")),
            None => lines.push("README: Not available".to_string()),
        }
    }

    lines.join("\n")
}

const SYSTEM_PROMPT: &str = "You evaluate open-source repositories for a developer looking for \
a project to contribute to. For every repository in the input return one entry with: repo_key \
(exactly the owner/name from its header line), fit_score (0-10, how well it matches the \
developer's languages, topics, skill level and goals), reason (one or two sentences), \
contributions (a short list of concrete first contributions), reject (true for tutorials, \
lists, abandoned or otherwise unsuitable projects) and reject_reason (null unless reject is \
true). Respond with a JSON object of the form {\"results\": [...]}.";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScoredBatch {
    #[serde(default)]
    results: Vec<AnalysisResult>,
}

/// [`RepoScorer`] backed by an OpenAI-compatible chat completions endpoint in JSON mode.
#[derive(Debug, Clone)]
pub struct OpenAiScorer {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiScorer {
    pub fn new(config: OpenAiConfig) -> Result<Self, ScoreError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RepoScorer for OpenAiScorer {
    async fn score(
        &self,
        profile: &DeveloperProfile,
        batch: &[ScoringInput],
    ) -> Result<Vec<AnalysisResult>, ScoreError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.config.model,
            "temperature": 0.2,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_batch_prompt(profile, batch) },
            ],
        });

        let span = info_span!("score_batch", repos = batch.len(), model = %self.config.model);
        async {
            let resp = self
                .http
                .post(self.endpoint())
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ScoreError::Status {
                    status: status.as_u16(),
                    body: body.chars().take(300).collect(),
                });
            }

            let chat: ChatResponse = resp
                .json()
                .await
                .map_err(|e| ScoreError::Decode(e.to_string()))?;
            let choice = chat
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ScoreError::Decode("response had no choices".to_string()))?;
            if choice.finish_reason.as_deref() == Some("content_filter") {
                return Err(ScoreError::Cancelled);
            }
            let content = choice
                .message
                .content
                .ok_or_else(|| ScoreError::Decode("response had no content".to_string()))?;
            let scored: ScoredBatch =
                serde_json::from_str(&content).map_err(|e| ScoreError::Decode(e.to_string()))?;
            debug!(results = scored.results.len(), "batch scored");
            Ok(scored.results)
        }
        .instrument(span)
        .await
    }
}
