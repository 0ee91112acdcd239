//! SQLite persistence for profiles, search runs, the repository cache and analysis results.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scout_core::{
    AnalysisResult, DeveloperProfile, RepositoryMetadata, RunCounters, RunStatus, SearchFilters,
    SearchOutcome, SearchRun, SkillLevel, StoredProfile,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "scout-storage";

/// Id of the installation's single developer profile.
pub const DEFAULT_PROFILE_ID: &str = "default";
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("creating database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    #[error("cannot finish a run with non-terminal status `{0}`")]
    NonTerminalStatus(RunStatus),
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS developer_profiles (
        id TEXT PRIMARY KEY,
        languages TEXT NOT NULL,
        topics TEXT NOT NULL,
        skill_level TEXT NOT NULL,
        goals TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_runs (
        id TEXT PRIMARY KEY,
        profile_id TEXT REFERENCES developer_profiles(id),
        filters TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        total_discovered INTEGER NOT NULL DEFAULT 0,
        total_filtered INTEGER NOT NULL DEFAULT 0,
        total_analyzed INTEGER NOT NULL DEFAULT 0,
        warnings TEXT NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        host_id INTEGER NOT NULL UNIQUE,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        description TEXT,
        primary_language TEXT,
        languages TEXT NOT NULL DEFAULT '[]',
        star_count INTEGER NOT NULL DEFAULT 0,
        fork_count INTEGER NOT NULL DEFAULT 0,
        open_issue_count INTEGER NOT NULL DEFAULT 0,
        topics TEXT NOT NULL DEFAULT '[]',
        license TEXT,
        pushed_at TEXT,
        created_at TEXT,
        good_first_issue_count INTEGER NOT NULL DEFAULT 0,
        help_wanted_count INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL REFERENCES search_runs(id),
        repository_id INTEGER NOT NULL REFERENCES repositories(id),
        repo_key TEXT NOT NULL,
        fit_score REAL NOT NULL,
        reason TEXT NOT NULL,
        contributions TEXT NOT NULL DEFAULT '[]',
        reject INTEGER NOT NULL DEFAULT 0,
        reject_reason TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_repositories_owner_name ON repositories(owner, name)",
    "CREATE INDEX IF NOT EXISTS idx_repositories_last_seen ON repositories(last_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_results_run_id ON analysis_results(run_id)",
    "CREATE INDEX IF NOT EXISTS idx_results_repository_id ON analysis_results(repository_id)",
];

const REPOSITORY_COLUMNS: &str = "r.host_id, r.owner, r.name, r.url, r.description, \
    r.primary_language, r.languages, r.star_count, r.fork_count, r.open_issue_count, r.topics, \
    r.license, r.pushed_at, r.created_at, r.good_first_issue_count, r.help_wanted_count";

#[derive(Debug, Clone)]
pub struct ScoutStore {
    pool: SqlitePool,
}

impl ScoutStore {
    /// Open (creating if needed) the database at `path`, apply the schema and prune the
    /// repository cache once with `retention`.
    pub async fn open(
        path: impl AsRef<Path>,
        retention: chrono::Duration,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;

        match store.prune_stale_repositories(retention).await {
            Ok(0) => {}
            Ok(pruned) => info!(pruned, "pruned stale repository cache rows"),
            Err(err) => warn!(error = %err, "startup cache prune failed"),
        }

        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create or overwrite the singleton profile.
    pub async fn save_profile(&self, profile: &DeveloperProfile) -> Result<String, StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO developer_profiles (id, languages, topics, skill_level, goals, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                languages = excluded.languages,
                topics = excluded.topics,
                skill_level = excluded.skill_level,
                goals = excluded.goals,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(DEFAULT_PROFILE_ID)
        .bind(serde_json::to_string(profile.languages())?)
        .bind(serde_json::to_string(profile.topics())?)
        .bind(profile.skill_level().as_str())
        .bind(profile.goals())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(DEFAULT_PROFILE_ID.to_string())
    }

    pub async fn get_profile(&self) -> Result<Option<StoredProfile>, StoreError> {
        let row = sqlx::query(
            "SELECT id, languages, topics, skill_level, goals, created_at, updated_at \
             FROM developer_profiles WHERE id = ?",
        )
        .bind(DEFAULT_PROFILE_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let languages: Vec<String> = serde_json::from_str(row.try_get("languages")?)?;
        let topics: Vec<String> = serde_json::from_str(row.try_get("topics")?)?;
        let skill = SkillLevel::from_str(row.try_get("skill_level")?)
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
        let goals: String = row.try_get("goals")?;
        let profile = DeveloperProfile::new(languages, topics, skill, goals)
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;

        Ok(Some(StoredProfile {
            id: row.try_get("id")?,
            profile,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    pub async fn create_run(
        &self,
        run_id: &str,
        profile_id: Option<&str>,
        filters: &SearchFilters,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO search_runs (id, profile_id, filters, status, started_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(profile_id)
        .bind(serde_json::to_string(filters)?)
        .bind(RunStatus::Running.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(run_id, "search run created");
        Ok(())
    }

    /// Record intermediate counters. Returns `false` once the run is terminal.
    pub async fn update_run_progress(
        &self,
        run_id: &str,
        counters: RunCounters,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE search_runs SET total_discovered = ?, total_filtered = ?, total_analyzed = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(i64::from(counters.discovered()))
        .bind(i64::from(counters.filtered()))
        .bind(i64::from(counters.analyzed()))
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a running run into a terminal status. Returns `false` if it was already terminal.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        counters: RunCounters,
        warnings: &[String],
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::NonTerminalStatus(status));
        }
        let result = sqlx::query(
            "UPDATE search_runs SET status = ?, finished_at = ?, total_discovered = ?, \
             total_filtered = ?, total_analyzed = ?, warnings = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(i64::from(counters.discovered()))
        .bind(i64::from(counters.filtered()))
        .bind(i64::from(counters.analyzed()))
        .bind(serde_json::to_string(warnings)?)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a running run cancelled, keeping its counters.
    pub async fn mark_cancelled(&self, run_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE search_runs SET status = 'cancelled', finished_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<SearchRun>, StoreError> {
        let row = sqlx::query(
            "SELECT id, profile_id, filters, status, started_at, finished_at, total_discovered, \
             total_filtered, total_analyzed, warnings FROM search_runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| run_from_row(&row)).transpose()
    }

    pub async fn get_run_filters(&self, run_id: &str) -> Result<Option<SearchFilters>, StoreError> {
        let filters: Option<String> = sqlx::query_scalar("SELECT filters FROM search_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        filters
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    pub async fn upsert_repositories(
        &self,
        repos: &[RepositoryMetadata],
    ) -> Result<usize, StoreError> {
        self.upsert_repositories_at(repos, Utc::now()).await
    }

    /// Insert or refresh cached repositories keyed by `host_id`, stamping `last_seen_at`.
    pub async fn upsert_repositories_at(
        &self,
        repos: &[RepositoryMetadata],
        seen_at: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        if repos.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for repo in repos {
            sqlx::query(
                r#"
                INSERT INTO repositories (
                    host_id, owner, name, url, description, primary_language, languages,
                    star_count, fork_count, open_issue_count, topics, license, pushed_at,
                    created_at, good_first_issue_count, help_wanted_count, first_seen_at, last_seen_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(host_id) DO UPDATE SET
                    owner = excluded.owner,
                    name = excluded.name,
                    url = excluded.url,
                    description = excluded.description,
                    primary_language = excluded.primary_language,
                    languages = excluded.languages,
                    star_count = excluded.star_count,
                    fork_count = excluded.fork_count,
                    open_issue_count = excluded.open_issue_count,
                    topics = excluded.topics,
                    license = excluded.license,
                    pushed_at = excluded.pushed_at,
                    created_at = excluded.created_at,
                    good_first_issue_count = excluded.good_first_issue_count,
                    help_wanted_count = excluded.help_wanted_count,
                    last_seen_at = excluded.last_seen_at
                "#,
            )
            .bind(repo.host_id)
            .bind(&repo.owner)
            .bind(&repo.name)
            .bind(&repo.url)
            .bind(&repo.description)
            .bind(&repo.primary_language)
            .bind(serde_json::to_string(&repo.languages)?)
            .bind(i64::from(repo.star_count))
            .bind(i64::from(repo.fork_count))
            .bind(i64::from(repo.open_issue_count))
            .bind(serde_json::to_string(&repo.topics)?)
            .bind(&repo.license)
            .bind(repo.pushed_at)
            .bind(repo.created_at)
            .bind(i64::from(repo.good_first_issue_count))
            .bind(i64::from(repo.help_wanted_count))
            .bind(seen_at)
            .bind(seen_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(repos.len())
    }

    /// Persist a run's results in one transaction. Results for repositories missing from the
    /// cache are skipped; returns how many rows were written.
    pub async fn save_results(
        &self,
        run_id: &str,
        results: &[AnalysisResult],
    ) -> Result<usize, StoreError> {
        if results.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let mut saved = 0usize;
        let mut tx = self.pool.begin().await?;
        for result in results {
            let Some((owner, name)) = result.repo_key.split_once('/') else {
                debug!(run_id, repo_key = %result.repo_key, "skipping result with malformed key");
                continue;
            };
            let repository_id: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM repositories WHERE owner = ? AND name = ? \
                 ORDER BY last_seen_at DESC LIMIT 1",
            )
            .bind(owner)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(repository_id) = repository_id else {
                debug!(run_id, repo_key = %result.repo_key, "skipping result for uncached repository");
                continue;
            };

            sqlx::query(
                "INSERT INTO analysis_results (run_id, repository_id, repo_key, fit_score, reason, \
                 contributions, reject, reject_reason, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(repository_id)
            .bind(&result.repo_key)
            .bind(result.fit_score)
            .bind(&result.reason)
            .bind(serde_json::to_string(&result.contributions)?)
            .bind(result.reject)
            .bind(&result.reject_reason)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            saved += 1;
        }
        tx.commit().await?;
        Ok(saved)
    }

    /// Stored outcome of a run: every result (rejected ones included) best fit first, the
    /// cached metadata of the scored repositories, counters, status and warnings.
    pub async fn get_results(&self, run_id: &str) -> Result<Option<SearchOutcome>, StoreError> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            "SELECT a.repo_key, a.fit_score, a.reason, a.contributions, a.reject, a.reject_reason, \
             {REPOSITORY_COLUMNS} FROM analysis_results a \
             JOIN repositories r ON r.id = a.repository_id \
             WHERE a.run_id = ? ORDER BY a.fit_score DESC, a.id ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = SearchOutcome::new(run.id, run.status, run.counters);
        outcome.warnings = run.warnings;
        for row in &rows {
            let contributions: String = row.try_get("contributions")?;
            outcome.results.push(AnalysisResult {
                repo_key: row.try_get("repo_key")?,
                fit_score: row.try_get("fit_score")?,
                reason: row.try_get("reason")?,
                contributions: serde_json::from_str(&contributions)?,
                reject: row.try_get("reject")?,
                reject_reason: row.try_get("reject_reason")?,
            });
            outcome.repos.push(repository_from_row(row)?);
        }
        Ok(Some(outcome))
    }

    pub async fn prune_stale_repositories(
        &self,
        retention: chrono::Duration,
    ) -> Result<u64, StoreError> {
        self.prune_before(Utc::now() - retention).await
    }

    /// Delete cache rows last seen before `cutoff` that no analysis result references.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM repositories WHERE last_seen_at < ? \
             AND id NOT IN (SELECT repository_id FROM analysis_results)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cached metadata and `last_seen_at` for one repository.
    pub async fn get_repository(
        &self,
        host_id: i64,
    ) -> Result<Option<(RepositoryMetadata, DateTime<Utc>)>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REPOSITORY_COLUMNS}, r.last_seen_at FROM repositories r WHERE r.host_id = ?"
        ))
        .bind(host_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some((repository_from_row(&row)?, row.try_get("last_seen_at")?))),
            None => Ok(None),
        }
    }

    pub async fn count_repositories(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn count(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|_| StoreError::InvalidRow(format!("{column} = {value}")))
}

fn run_from_row(row: &SqliteRow) -> Result<SearchRun, StoreError> {
    let filters: String = row.try_get("filters")?;
    let warnings: String = row.try_get("warnings")?;
    let status = RunStatus::from_str(row.try_get("status")?)
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    Ok(SearchRun {
        id: row.try_get("id")?,
        profile_id: row.try_get("profile_id")?,
        filters: serde_json::from_str(&filters)?,
        status,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        counters: RunCounters::new(
            count(row, "total_discovered")?,
            count(row, "total_filtered")?,
            count(row, "total_analyzed")?,
        ),
        warnings: serde_json::from_str(&warnings)?,
    })
}

fn repository_from_row(row: &SqliteRow) -> Result<RepositoryMetadata, StoreError> {
    let languages: String = row.try_get("languages")?;
    let topics: String = row.try_get("topics")?;
    Ok(RepositoryMetadata {
        host_id: row.try_get("host_id")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        description: row.try_get("description")?,
        primary_language: row.try_get("primary_language")?,
        languages: serde_json::from_str(&languages)?,
        star_count: count(row, "star_count")?,
        fork_count: count(row, "fork_count")?,
        open_issue_count: count(row, "open_issue_count")?,
        topics: serde_json::from_str(&topics)?,
        license: row.try_get("license")?,
        pushed_at: row.try_get("pushed_at")?,
        created_at: row.try_get("created_at")?,
        good_first_issue_count: count(row, "good_first_issue_count")?,
        help_wanted_count: count(row, "help_wanted_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> ScoutStore {
        ScoutStore::open(dir.path().join("scout.db"), chrono::Duration::days(30))
            .await
            .expect("open store")
    }

    fn repo(host_id: i64, owner: &str, name: &str) -> RepositoryMetadata {
        RepositoryMetadata {
            host_id,
            owner: owner.into(),
            name: name.into(),
            url: format!("https://github.com/{owner}/{name}"),
            description: Some("a library".into()),
            primary_language: Some("Rust".into()),
            languages: vec!["Rust".into(), "Shell".into()],
            star_count: 420,
            open_issue_count: 12,
            topics: vec!["cli".into()],
            good_first_issue_count: 2,
            ..Default::default()
        }
    }

    fn result(key: &str, score: f64, reject: bool) -> AnalysisResult {
        AnalysisResult {
            repo_key: key.into(),
            fit_score: score,
            reason: format!("reason for {key}"),
            contributions: vec!["docs".into(), "tests".into()],
            reject,
            reject_reason: reject.then(|| "archived".to_string()),
        }
    }

    fn filters() -> SearchFilters {
        SearchFilters::new(vec!["Rust".into()], 10, 5000).expect("filters")
    }

    #[tokio::test]
    async fn profile_save_then_get_keeps_latest() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        assert!(store.get_profile().await.expect("get").is_none());

        let first = DeveloperProfile::new(vec!["Python".into()], vec![], SkillLevel::Beginner, "learn")
            .expect("profile");
        let id = store.save_profile(&first).await.expect("save");
        assert_eq!(id, DEFAULT_PROFILE_ID);
        let stored = store.get_profile().await.expect("get").expect("present");
        assert_eq!(stored.profile, first);
        let created_at = stored.created_at;

        let second = DeveloperProfile::new(
            vec!["Rust".into(), "Go".into()],
            vec!["networking".into()],
            SkillLevel::Advanced,
            "systems work",
        )
        .expect("profile");
        store.save_profile(&second).await.expect("save again");
        let stored = store.get_profile().await.expect("get").expect("present");
        assert_eq!(stored.profile, second);
        assert_eq!(stored.created_at, created_at);
        assert!(stored.updated_at.expect("updated_at") >= created_at);
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_row_and_refreshes_last_seen() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let earlier = Utc::now() - chrono::Duration::days(3);
        let mut r = repo(7, "tokio-rs", "mini-redis");

        store.upsert_repositories_at(&[r.clone()], earlier).await.expect("first");
        r.star_count = 500;
        store.upsert_repositories(&[r.clone()]).await.expect("second");

        assert_eq!(store.count_repositories().await.expect("count"), 1);
        let (cached, last_seen) = store.get_repository(7).await.expect("get").expect("present");
        assert_eq!(cached, r);
        assert!(last_seen > earlier);
    }

    #[tokio::test]
    async fn empty_inputs_are_noops() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        assert_eq!(store.upsert_repositories(&[]).await.expect("upsert"), 0);
        assert_eq!(store.save_results("missing", &[]).await.expect("save"), 0);
    }

    #[tokio::test]
    async fn run_lifecycle_is_monotonic_once_terminal() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.create_run("run-1", None, &filters()).await.expect("create");

        let run = store.get_run("run-1").await.expect("get").expect("present");
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        assert!(store
            .update_run_progress("run-1", RunCounters::new(5, 3, 0))
            .await
            .expect("progress"));
        let warnings = vec!["careful".to_string()];
        assert!(store
            .finish_run("run-1", RunStatus::Partial, RunCounters::new(5, 3, 2), &warnings)
            .await
            .expect("finish"));

        assert!(!store.mark_cancelled("run-1").await.expect("cancel"));
        assert!(!store
            .finish_run("run-1", RunStatus::Completed, RunCounters::default(), &[])
            .await
            .expect("refinish"));
        assert!(!store
            .update_run_progress("run-1", RunCounters::new(9, 9, 9))
            .await
            .expect("late progress"));

        let run = store.get_run("run-1").await.expect("get").expect("present");
        assert_eq!(run.status, RunStatus::Partial);
        assert_eq!(run.counters, RunCounters::new(5, 3, 2));
        assert_eq!(run.warnings, warnings);
        assert!(run.finished_at.is_some());
        assert_eq!(store.get_run_filters("run-1").await.expect("filters"), Some(filters()));
    }

    #[tokio::test]
    async fn finishing_with_running_status_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.create_run("run-r", None, &filters()).await.expect("create");
        let err = store
            .finish_run("run-r", RunStatus::Running, RunCounters::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonTerminalStatus(RunStatus::Running)));
    }

    #[tokio::test]
    async fn cancelled_run_keeps_counters() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.create_run("run-c", None, &filters()).await.expect("create");
        store
            .update_run_progress("run-c", RunCounters::new(4, 2, 0))
            .await
            .expect("progress");
        assert!(store.mark_cancelled("run-c").await.expect("cancel"));
        let run = store.get_run("run-c").await.expect("get").expect("present");
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.counters.filtered(), 2);
    }

    #[tokio::test]
    async fn results_are_saved_joined_and_sorted() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        store.create_run("run-2", None, &filters()).await.expect("create");
        store
            .upsert_repositories(&[repo(1, "a", "one"), repo(2, "b", "two")])
            .await
            .expect("upsert");

        let saved = store
            .save_results(
                "run-2",
                &[
                    result("a/one", 6.5, false),
                    result("ghost/repo", 9.9, false),
                    result("b/two", 8.0, true),
                ],
            )
            .await
            .expect("save");
        assert_eq!(saved, 2);

        let outcome = store.get_results("run-2").await.expect("get").expect("present");
        let keys = outcome.results.iter().map(|r| r.repo_key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, ["b/two", "a/one"]);
        assert_eq!(outcome.repos[0].name, "two");
        assert_eq!(outcome.results[1].contributions, ["docs", "tests"]);
        assert_eq!(outcome.results[0].reject_reason.as_deref(), Some("archived"));
        assert_eq!(outcome.status, RunStatus::Running);

        assert!(store.get_results("nope").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn prune_removes_only_stale_unreferenced_rows() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let old = Utc::now() - chrono::Duration::days(90);
        store
            .upsert_repositories_at(&[repo(1, "a", "stale"), repo(2, "b", "kept")], old)
            .await
            .expect("old upsert");
        store.upsert_repositories(&[repo(3, "c", "fresh")]).await.expect("fresh upsert");

        store.create_run("run-3", None, &filters()).await.expect("create");
        store
            .save_results("run-3", &[result("b/kept", 5.0, false)])
            .await
            .expect("save");

        let pruned = store
            .prune_stale_repositories(chrono::Duration::days(30))
            .await
            .expect("prune");
        assert_eq!(pruned, 1);
        assert!(store.get_repository(1).await.expect("get").is_none());
        assert!(store.get_repository(2).await.expect("get").is_some());
        assert!(store.get_repository(3).await.expect("get").is_some());
    }
}
