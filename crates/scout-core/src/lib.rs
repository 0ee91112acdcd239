//! Core domain model, validation rules and the run event protocol for repo scout.

pub mod filtering;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "scout-core";

pub const MAX_GOALS_CHARS: usize = 500;
pub const DEFAULT_MIN_STARS: u32 = 10;
pub const DEFAULT_MAX_STARS: u32 = 50_000;
/// Activity cutoff applied when a search does not name one.
pub const DEFAULT_ACTIVITY_WINDOW_DAYS: i64 = 180;
pub const MAX_FIT_SCORE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("at least one language is required")]
    MissingLanguages,
    #[error("min_stars ({min}) must be <= max_stars ({max})")]
    StarRange { min: u32, max: u32 },
    #[error("goals must be at most {max} characters")]
    GoalsTooLong { max: usize },
    #[error("unknown skill level `{0}`")]
    UnknownSkillLevel(String),
    #[error("unknown run status `{0}`")]
    UnknownStatus(String),
}

/// Trim, drop blanks and remove duplicates while keeping first-seen order.
fn ordered_set(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim();
        if item.is_empty() || out.iter().any(|seen| seen == item) {
            continue;
        }
        out.push(item.to_string());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

impl SkillLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillLevel::Beginner => "beginner",
            SkillLevel::Intermediate => "intermediate",
            SkillLevel::Advanced => "advanced",
        }
    }
}

impl fmt::Display for SkillLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkillLevel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(SkillLevel::Beginner),
            "intermediate" => Ok(SkillLevel::Intermediate),
            "advanced" => Ok(SkillLevel::Advanced),
            other => Err(ValidationError::UnknownSkillLevel(other.to_string())),
        }
    }
}

/// The installation's single developer profile used to judge repository fit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProfileInput")]
pub struct DeveloperProfile {
    languages: Vec<String>,
    topics: Vec<String>,
    skill_level: SkillLevel,
    goals: String,
}

#[derive(Debug, Deserialize)]
struct ProfileInput {
    languages: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    skill_level: SkillLevel,
    #[serde(default)]
    goals: String,
}

impl TryFrom<ProfileInput> for DeveloperProfile {
    type Error = ValidationError;

    fn try_from(input: ProfileInput) -> Result<Self, Self::Error> {
        DeveloperProfile::new(input.languages, input.topics, input.skill_level, input.goals)
    }
}

impl DeveloperProfile {
    pub fn new(
        languages: Vec<String>,
        topics: Vec<String>,
        skill_level: SkillLevel,
        goals: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let languages = ordered_set(languages);
        if languages.is_empty() {
            return Err(ValidationError::MissingLanguages);
        }
        let goals = goals.into();
        if goals.chars().count() > MAX_GOALS_CHARS {
            return Err(ValidationError::GoalsTooLong {
                max: MAX_GOALS_CHARS,
            });
        }
        Ok(Self {
            languages,
            topics: ordered_set(topics),
            skill_level,
            goals,
        })
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn skill_level(&self) -> SkillLevel {
        self.skill_level
    }

    pub fn goals(&self) -> &str {
        &self.goals
    }
}

/// A persisted profile together with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredProfile {
    pub id: String,
    pub profile: DeveloperProfile,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Search filters for one run. The star window is validated on every construction path,
/// including deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FiltersInput")]
pub struct SearchFilters {
    languages: Vec<String>,
    min_stars: u32,
    max_stars: u32,
    topics: Vec<String>,
    min_activity_date: Option<NaiveDate>,
    license: Option<String>,
}

fn default_min_stars() -> u32 {
    DEFAULT_MIN_STARS
}

fn default_max_stars() -> u32 {
    DEFAULT_MAX_STARS
}

#[derive(Debug, Deserialize)]
struct FiltersInput {
    languages: Vec<String>,
    #[serde(default = "default_min_stars")]
    min_stars: u32,
    #[serde(default = "default_max_stars")]
    max_stars: u32,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    min_activity_date: Option<NaiveDate>,
    #[serde(default)]
    license: Option<String>,
}

impl TryFrom<FiltersInput> for SearchFilters {
    type Error = ValidationError;

    fn try_from(input: FiltersInput) -> Result<Self, Self::Error> {
        let mut filters = SearchFilters::new(input.languages, input.min_stars, input.max_stars)?
            .with_topics(input.topics);
        filters.min_activity_date = input.min_activity_date;
        filters.license = input
            .license
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        Ok(filters)
    }
}

impl SearchFilters {
    pub fn new(
        languages: Vec<String>,
        min_stars: u32,
        max_stars: u32,
    ) -> Result<Self, ValidationError> {
        let languages = ordered_set(languages);
        if languages.is_empty() {
            return Err(ValidationError::MissingLanguages);
        }
        if min_stars > max_stars {
            return Err(ValidationError::StarRange {
                min: min_stars,
                max: max_stars,
            });
        }
        Ok(Self {
            languages,
            min_stars,
            max_stars,
            topics: Vec::new(),
            min_activity_date: None,
            license: None,
        })
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = ordered_set(topics);
        self
    }

    pub fn with_min_activity_date(mut self, date: NaiveDate) -> Self {
        self.min_activity_date = Some(date);
        self
    }

    pub fn with_license(mut self, license: impl Into<String>) -> Self {
        self.license = Some(license.into());
        self
    }

    /// Copy of these filters with the topic qualifiers removed.
    pub fn without_topics(&self) -> Self {
        Self {
            topics: Vec::new(),
            ..self.clone()
        }
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn min_stars(&self) -> u32 {
        self.min_stars
    }

    pub fn max_stars(&self) -> u32 {
        self.max_stars
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn min_activity_date(&self) -> Option<NaiveDate> {
        self.min_activity_date
    }

    pub fn license(&self) -> Option<&str> {
        self.license.as_deref()
    }

    /// Oldest push date a repository may have, falling back to the default window before `today`.
    pub fn activity_cutoff(&self, today: NaiveDate) -> NaiveDate {
        self.min_activity_date
            .unwrap_or_else(|| today - Duration::days(DEFAULT_ACTIVITY_WINDOW_DAYS))
    }
}

/// Cached metadata for one hosted repository.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub host_id: i64,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub description: Option<String>,
    pub primary_language: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub star_count: u32,
    #[serde(default)]
    pub fork_count: u32,
    #[serde(default)]
    pub open_issue_count: u32,
    #[serde(default)]
    pub topics: Vec<String>,
    pub license: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub good_first_issue_count: u32,
    #[serde(default)]
    pub help_wanted_count: u32,
}

impl RepositoryMetadata {
    /// `owner/name`, the key analysis results refer to.
    pub fn repo_key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub repo_key: String,
    pub fit_score: f64,
    pub reason: String,
    #[serde(default)]
    pub contributions: Vec<String>,
    #[serde(default)]
    pub reject: bool,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

impl AnalysisResult {
    /// Force `fit_score` into `[0, 10]`; non-finite scores become 0.
    pub fn clamped(mut self) -> Self {
        self.fit_score = if self.fit_score.is_finite() {
            self.fit_score.clamp(0.0, MAX_FIT_SCORE)
        } else {
            0.0
        };
        self
    }
}

/// Results a caller should see: rejected entries dropped, best fit first.
pub fn rank_visible(results: &[AnalysisResult]) -> Vec<AnalysisResult> {
    let mut visible = results
        .iter()
        .filter(|r| !r.reject)
        .cloned()
        .collect::<Vec<_>>();
    visible.sort_by(|a, b| b.fit_score.total_cmp(&a.fit_score));
    visible
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// Cumulative run counters; construction keeps `analyzed <= filtered <= discovered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunCounters {
    discovered: u32,
    filtered: u32,
    analyzed: u32,
}

impl RunCounters {
    pub fn new(discovered: u32, filtered: u32, analyzed: u32) -> Self {
        let filtered = filtered.min(discovered);
        Self {
            discovered,
            filtered,
            analyzed: analyzed.min(filtered),
        }
    }

    pub fn discovered(&self) -> u32 {
        self.discovered
    }

    pub fn filtered(&self) -> u32 {
        self.filtered
    }

    pub fn analyzed(&self) -> u32 {
        self.analyzed
    }
}

/// One search run as recorded by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRun {
    pub id: String,
    pub profile_id: Option<String>,
    pub filters: SearchFilters,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub warnings: Vec<String>,
}

/// Final payload of a run: the `complete` event's data and the stored-results response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub total_discovered: u32,
    pub total_filtered: u32,
    pub total_analyzed: u32,
    pub results: Vec<AnalysisResult>,
    pub repos: Vec<RepositoryMetadata>,
    pub warnings: Vec<String>,
}

impl SearchOutcome {
    pub fn new(run_id: impl Into<String>, status: RunStatus, counters: RunCounters) -> Self {
        Self {
            run_id: run_id.into(),
            status,
            total_discovered: counters.discovered(),
            total_filtered: counters.filtered(),
            total_analyzed: counters.analyzed(),
            results: Vec::new(),
            repos: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Discovering,
    Filtering,
    FetchingReadmes,
    Analyzing,
    Finalizing,
}

/// One frame of a run's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScoutEvent {
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
    },
    Complete {
        data: SearchOutcome,
    },
    Error {
        message: String,
    },
}

impl ScoutEvent {
    pub fn status(message: impl Into<String>, phase: Phase) -> Self {
        ScoutEvent::Status {
            message: message.into(),
            phase: Some(phase),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ScoutEvent::Error {
            message: message.into(),
        }
    }

    pub fn complete(data: SearchOutcome) -> Self {
        ScoutEvent::Complete { data }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScoutEvent::Status { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inverted_star_window_is_rejected_by_constructor_and_json() {
        let err = SearchFilters::new(vec!["Rust".into()], 500, 100).unwrap_err();
        assert_eq!(err, ValidationError::StarRange { min: 500, max: 100 });

        let parsed = serde_json::from_value::<SearchFilters>(json!({
            "languages": ["Rust"],
            "min_stars": 10,
            "max_stars": 5
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn filters_json_applies_defaults_and_dedupes() {
        let filters: SearchFilters = serde_json::from_value(json!({
            "languages": ["Rust", " Rust ", "Go"],
            "topics": ["cli", "", "cli"],
            "min_activity_date": "2026-01-31",
            "license": "  "
        }))
        .unwrap();
        assert_eq!(filters.languages(), ["Rust".to_string(), "Go".to_string()]);
        assert_eq!(filters.topics(), ["cli".to_string()]);
        assert_eq!(filters.min_stars(), DEFAULT_MIN_STARS);
        assert_eq!(filters.max_stars(), DEFAULT_MAX_STARS);
        assert_eq!(filters.license(), None);
        assert_eq!(
            filters.min_activity_date(),
            NaiveDate::from_ymd_opt(2026, 1, 31)
        );
    }

    #[test]
    fn activity_cutoff_defaults_to_window_before_today() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let filters = SearchFilters::new(vec!["Go".into()], 0, 10).unwrap();
        assert_eq!(
            filters.activity_cutoff(today),
            NaiveDate::from_ymd_opt(2026, 4, 21).unwrap()
        );
        let explicit = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(
            filters.with_min_activity_date(explicit).activity_cutoff(today),
            explicit
        );
    }

    #[test]
    fn filters_survive_a_serde_round_trip() {
        let filters = SearchFilters::new(vec!["Python".into()], 100, 10_000)
            .unwrap()
            .with_topics(vec!["web".into()])
            .with_license("MIT");
        let text = serde_json::to_string(&filters).unwrap();
        let back: SearchFilters = serde_json::from_str(&text).unwrap();
        assert_eq!(back, filters);
    }

    #[test]
    fn profile_requires_languages_and_bounded_goals() {
        assert_eq!(
            DeveloperProfile::new(vec![" ".into()], vec![], SkillLevel::Beginner, "").unwrap_err(),
            ValidationError::MissingLanguages
        );
        let long_goals = "x".repeat(MAX_GOALS_CHARS + 1);
        assert!(matches!(
            DeveloperProfile::new(vec!["Rust".into()], vec![], SkillLevel::Advanced, long_goals),
            Err(ValidationError::GoalsTooLong { .. })
        ));

        let profile: DeveloperProfile =
            serde_json::from_value(json!({"languages": ["Python", "Python"]})).unwrap();
        assert_eq!(profile.languages(), ["Python".to_string()]);
        assert_eq!(profile.skill_level(), SkillLevel::Intermediate);
        assert_eq!(profile.goals(), "");
    }

    #[test]
    fn counters_never_violate_ordering() {
        let counters = RunCounters::new(3, 7, 9);
        assert_eq!(counters.discovered(), 3);
        assert_eq!(counters.filtered(), 3);
        assert_eq!(counters.analyzed(), 3);
    }

    #[test]
    fn run_status_parses_and_knows_terminality() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Partial.is_terminal());
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn rank_visible_drops_rejects_and_sorts_by_fit() {
        let mk = |key: &str, score: f64, reject: bool| AnalysisResult {
            repo_key: key.into(),
            fit_score: score,
            reason: String::new(),
            contributions: vec![],
            reject,
            reject_reason: None,
        };
        let ranked = rank_visible(&[mk("a/a", 4.0, false), mk("b/b", 9.0, true), mk("c/c", 7.5, false)]);
        let keys = ranked.iter().map(|r| r.repo_key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, ["c/c", "a/a"]);
    }

    #[test]
    fn fit_scores_are_clamped() {
        let result = AnalysisResult {
            repo_key: "a/b".into(),
            fit_score: 12.0,
            reason: "r".into(),
            contributions: vec![],
            reject: false,
            reject_reason: None,
        };
        assert_eq!(result.clone().clamped().fit_score, 10.0);
        let nan = AnalysisResult {
            fit_score: f64::NAN,
            ..result
        };
        assert_eq!(nan.clamped().fit_score, 0.0);
    }

    #[test]
    fn events_serialize_to_the_wire_shapes() {
        let status = serde_json::to_value(ScoutEvent::status("Searching GitHub...", Phase::FetchingReadmes)).unwrap();
        assert_eq!(
            status,
            json!({"type": "status", "message": "Searching GitHub...", "phase": "fetching-readmes"})
        );

        let bare = serde_json::to_value(ScoutEvent::Status {
            message: "hi".into(),
            phase: None,
        })
        .unwrap();
        assert_eq!(bare, json!({"type": "status", "message": "hi"}));

        let complete = serde_json::to_value(ScoutEvent::complete(SearchOutcome::new(
            "run-1",
            RunStatus::Completed,
            RunCounters::default(),
        )))
        .unwrap();
        assert_eq!(complete["type"], "complete");
        assert_eq!(complete["data"]["run_id"], "run-1");
        assert_eq!(complete["data"]["status"], "completed");
        assert_eq!(complete["data"]["total_analyzed"], 0);

        let error = serde_json::to_value(ScoutEvent::error("boom")).unwrap();
        assert_eq!(error, json!({"type": "error", "message": "boom"}));
    }
}
