//! Run orchestration for repo scout: configuration, scoring, batched analysis, the run
//! registry and the cache-prune scheduler.

pub mod analysis;
pub mod orchestrator;
pub mod registry;
pub mod scoring;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scout_github::{GitHubClient, GitHubConfig, RepositorySource};
use scout_storage::ScoutStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub use analysis::{AnalysisConfig, AnalysisCoordinator, AnalysisProgress, BatchOutcome};
pub use orchestrator::{Orchestrator, RunContext, RunError};
pub use registry::{ActiveRun, AdmissionError, CancelToken, RunRegistry, SlidingWindowLimiter};
pub use scoring::{OpenAiConfig, OpenAiScorer, RepoScorer, ScoreError, ScoringInput};

pub const CRATE_NAME: &str = "scout-pipeline";

#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub github_token: Option<String>,
    pub github_graphql_url: String,
    pub db_path: PathBuf,
    pub max_repos: usize,
    pub batch_size: usize,
    pub analysis_timeout_secs: u64,
    pub rate_limit: usize,
    pub rate_window_secs: u64,
    pub cache_retention_days: i64,
    pub prune_scheduler_enabled: bool,
    pub prune_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secret(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            github_graphql_url: scout_github::DEFAULT_GRAPHQL_URL.to_string(),
            db_path: PathBuf::from("./data/scout.db"),
            max_repos: analysis::DEFAULT_MAX_REPOS,
            batch_size: analysis::DEFAULT_BATCH_SIZE,
            analysis_timeout_secs: analysis::DEFAULT_BATCH_TIMEOUT.as_secs(),
            rate_limit: 5,
            rate_window_secs: 3600,
            cache_retention_days: scout_storage::DEFAULT_RETENTION_DAYS,
            prune_scheduler_enabled: false,
            prune_cron: "0 0 4 * * *".to_string(),
            http_timeout_secs: 30,
            user_agent: "repo-scout/0.1".to_string(),
            web_port: 8000,
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl ScoutConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            github_token: env_secret("GITHUB_TOKEN"),
            github_graphql_url: std::env::var("GITHUB_GRAPHQL_URL")
                .unwrap_or(defaults.github_graphql_url),
            db_path: std::env::var("SCOUT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            max_repos: env_parse("SCOUT_MAX_REPOS", defaults.max_repos),
            batch_size: env_parse("SCOUT_BATCH_SIZE", defaults.batch_size),
            analysis_timeout_secs: env_parse(
                "SCOUT_ANALYSIS_TIMEOUT_SECS",
                defaults.analysis_timeout_secs,
            ),
            rate_limit: env_parse("SCOUT_RATE_LIMIT", defaults.rate_limit),
            rate_window_secs: env_parse("SCOUT_RATE_WINDOW_SECS", defaults.rate_window_secs),
            cache_retention_days: env_parse(
                "SCOUT_CACHE_RETENTION_DAYS",
                defaults.cache_retention_days,
            ),
            prune_scheduler_enabled: std::env::var("SCOUT_PRUNE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            prune_cron: std::env::var("SCOUT_PRUNE_CRON").unwrap_or(defaults.prune_cron),
            http_timeout_secs: env_parse("SCOUT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: std::env::var("SCOUT_USER_AGENT").unwrap_or(defaults.user_agent),
            web_port: env_parse("SCOUT_WEB_PORT", defaults.web_port),
            openai_api_key: env_secret("OPENAI_API_KEY"),
            openai_base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            model: std::env::var("SCOUT_MODEL").unwrap_or(defaults.model),
        }
    }

    pub fn cache_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.cache_retention_days.max(0))
    }

    pub fn analysis_config(&self) -> AnalysisConfig {
        AnalysisConfig {
            max_repos: self.max_repos.max(1),
            batch_size: self.batch_size.max(1),
            batch_timeout: Duration::from_secs(self.analysis_timeout_secs.max(1)),
        }
    }

    pub fn github_config(&self) -> Result<GitHubConfig> {
        let token = self
            .github_token
            .clone()
            .context("GITHUB_TOKEN is required for repository discovery")?;
        let mut config = GitHubConfig::new(token, self.max_repos.max(1));
        config.graphql_url = self.github_graphql_url.clone();
        config.user_agent = self.user_agent.clone();
        config.timeout = Duration::from_secs(self.http_timeout_secs);
        Ok(config)
    }

    pub fn openai_config(&self) -> Result<OpenAiConfig> {
        let api_key = self
            .openai_api_key
            .clone()
            .context("OPENAI_API_KEY is required for repository scoring")?;
        Ok(OpenAiConfig {
            api_key,
            base_url: self.openai_base_url.clone(),
            model: self.model.clone(),
            timeout: Duration::from_secs(self.analysis_timeout_secs.max(1)),
        })
    }

    pub fn registry(&self) -> RunRegistry {
        RunRegistry::new(
            self.rate_limit,
            Duration::from_secs(self.rate_window_secs),
        )
    }

    pub async fn open_store(&self) -> Result<ScoutStore> {
        ScoutStore::open(&self.db_path, self.cache_retention())
            .await
            .with_context(|| format!("opening scout database {}", self.db_path.display()))
    }
}

/// Everything a server or one-shot search needs, wired from configuration.
#[derive(Clone)]
pub struct ScoutServices {
    pub store: ScoutStore,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: RunRegistry,
}

impl ScoutServices {
    pub async fn from_config(config: &ScoutConfig) -> Result<Self> {
        let store = config.open_store().await?;
        let github = GitHubClient::new(config.github_config()?).context("building GitHub client")?;
        let scorer = OpenAiScorer::new(config.openai_config()?).context("building scorer")?;
        Ok(Self::new(
            store,
            Arc::new(github),
            Arc::new(scorer),
            config.analysis_config(),
            config.registry(),
        ))
    }

    pub fn new(
        store: ScoutStore,
        source: Arc<dyn RepositorySource>,
        scorer: Arc<dyn RepoScorer>,
        analysis: AnalysisConfig,
        registry: RunRegistry,
    ) -> Self {
        let coordinator = AnalysisCoordinator::new(scorer, analysis);
        let orchestrator = Arc::new(Orchestrator::new(source, store.clone(), coordinator));
        Self {
            store,
            orchestrator,
            registry,
        }
    }
}

/// Cron-driven cache pruning, built only when enabled in `config`.
pub async fn maybe_build_prune_scheduler(
    config: &ScoutConfig,
    store: ScoutStore,
) -> Result<Option<JobScheduler>> {
    if !config.prune_scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let retention = config.cache_retention();
    let cron = config.prune_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = store.clone();
        Box::pin(async move {
            match store.prune_stale_repositories(retention).await {
                Ok(pruned) => info!(pruned, "scheduled cache prune finished"),
                Err(err) => warn!(error = %err, "scheduled cache prune failed"),
            }
        })
    })
    .with_context(|| format!("creating prune job for cron {cron}"))?;
    sched.add(job).await.context("adding prune job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ScoutConfig::default();
        assert_eq!(config.max_repos, 50);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.analysis_timeout_secs, 120);
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.rate_window_secs, 3600);
        assert_eq!(config.cache_retention(), chrono::Duration::days(30));
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.github_graphql_url, "https://api.github.com/graphql");
        assert!(!config.prune_scheduler_enabled);
    }

    #[test]
    fn github_config_requires_token_and_scales_with_cap() {
        let mut config = ScoutConfig::default();
        assert!(config.github_config().is_err());
        config.github_token = Some("ghp_x".into());
        config.max_repos = 30;
        let github = config.github_config().unwrap();
        assert_eq!(github.max_total, 60);
        assert_eq!(github.timeout, Duration::from_secs(30));
    }

    #[test]
    fn openai_config_requires_key() {
        let mut config = ScoutConfig::default();
        assert!(config.openai_config().is_err());
        config.openai_api_key = Some("sk-x".into());
        assert_eq!(config.openai_config().unwrap().model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn scheduler_is_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScoutConfig {
            db_path: dir.path().join("scout.db"),
            ..ScoutConfig::default()
        };
        let store = config.open_store().await.unwrap();
        assert!(maybe_build_prune_scheduler(&config, store)
            .await
            .unwrap()
            .is_none());
    }
}
