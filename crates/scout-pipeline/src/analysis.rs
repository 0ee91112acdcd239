//! Concurrent batched scoring with per-batch timeouts, aggregated in completion order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use scout_core::{AnalysisResult, DeveloperProfile, Phase, ScoutEvent};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::registry::CancelToken;
use crate::scoring::{RepoScorer, ScoreError, ScoringInput};

pub const DEFAULT_MAX_REPOS: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct AnalysisConfig {
    pub max_repos: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_repos: DEFAULT_MAX_REPOS,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Scorer answered; `accepted` results survived sanitizing.
    Scored { accepted: usize },
    TimedOut,
    Failed(String),
    /// The scorer aborted the batch or the run was cancelled mid-call.
    Cancelled,
    /// Never started because the run was already cancelled.
    Skipped,
}

/// One item per finished batch.
#[derive(Debug, Clone)]
pub struct AnalysisProgress {
    /// Every accepted result so far, across batches.
    pub results: Vec<AnalysisResult>,
    pub progress: usize,
    pub total: usize,
    pub outcome: BatchOutcome,
    pub event: ScoutEvent,
}

#[derive(Debug)]
struct BatchReport {
    batch_len: usize,
    outcome: BatchOutcome,
    results: Vec<AnalysisResult>,
}

/// Keep results that name a repository of the batch, once each, with clamped scores.
fn sanitize(batch: &[ScoringInput], raw: Vec<AnalysisResult>) -> Vec<AnalysisResult> {
    let allowed = batch
        .iter()
        .map(|input| input.repo.repo_key())
        .collect::<HashSet<_>>();
    let mut seen = HashSet::with_capacity(allowed.len());
    raw.into_iter()
        .filter(|r| allowed.contains(&r.repo_key) && seen.insert(r.repo_key.clone()))
        .map(AnalysisResult::clamped)
        .collect()
}

async fn score_batch(
    scorer: Arc<dyn RepoScorer>,
    profile: Arc<DeveloperProfile>,
    batch: Vec<ScoringInput>,
    timeout: Duration,
    cancel: CancelToken,
) -> BatchReport {
    let batch_len = batch.len();
    let report = |outcome, results| BatchReport {
        batch_len,
        outcome,
        results,
    };

    if cancel.is_cancelled() {
        return report(BatchOutcome::Skipped, Vec::new());
    }

    let scored = tokio::select! {
        biased;
        _ = cancel.cancelled() => return report(BatchOutcome::Cancelled, Vec::new()),
        scored = tokio::time::timeout(timeout, scorer.score(&profile, &batch)) => scored,
    };

    match scored {
        Err(_elapsed) => report(BatchOutcome::TimedOut, Vec::new()),
        Ok(Err(ScoreError::Cancelled)) => report(BatchOutcome::Cancelled, Vec::new()),
        Ok(Err(err)) => report(BatchOutcome::Failed(err.to_string()), Vec::new()),
        Ok(Ok(raw)) => {
            let results = sanitize(&batch, raw);
            report(
                BatchOutcome::Scored {
                    accepted: results.len(),
                },
                results,
            )
        }
    }
}

struct CoordinatorState {
    units: JoinSet<BatchReport>,
    cancel: CancelToken,
    results: Vec<AnalysisResult>,
    progress: usize,
    total: usize,
    batch_size: usize,
}

impl CoordinatorState {
    fn advance(&mut self, report: Result<BatchReport, tokio::task::JoinError>) -> AnalysisProgress {
        let (batch_len, outcome) = match report {
            Ok(report) => {
                self.results.extend(report.results);
                (report.batch_len, report.outcome)
            }
            Err(err) => (self.batch_size, BatchOutcome::Failed(err.to_string())),
        };
        // Scored batches count what came back; the rest count as attempted.
        let step = match &outcome {
            BatchOutcome::Scored { accepted } => *accepted,
            _ => batch_len,
        };
        self.progress = (self.progress + step).min(self.total);

        let (progress, total) = (self.progress, self.total);
        let message = match &outcome {
            BatchOutcome::Scored { .. } => format!("Analyzed {progress}/{total} repos..."),
            BatchOutcome::TimedOut => format!("Batch timed out ({progress}/{total})"),
            BatchOutcome::Failed(reason) => {
                warn!(%reason, "analysis batch failed");
                format!("Batch failed ({progress}/{total})")
            }
            BatchOutcome::Cancelled => format!("Batch cancelled ({progress}/{total})"),
            BatchOutcome::Skipped => format!("Batch skipped ({progress}/{total})"),
        };

        AnalysisProgress {
            results: self.results.clone(),
            progress,
            total,
            outcome,
            event: ScoutEvent::status(message, Phase::Analyzing),
        }
    }
}

/// Splits candidates into batches and scores them concurrently.
#[derive(Clone)]
pub struct AnalysisCoordinator {
    scorer: Arc<dyn RepoScorer>,
    config: AnalysisConfig,
}

impl AnalysisCoordinator {
    pub fn new(scorer: Arc<dyn RepoScorer>, config: AnalysisConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Start scoring `candidates` (capped at `max_repos`) and stream one progress item per
    /// finished batch. The stream ends early, aborting outstanding batches, once `cancel`
    /// fires; dropping it aborts them as well.
    pub fn run(
        &self,
        profile: Arc<DeveloperProfile>,
        mut candidates: Vec<ScoringInput>,
        cancel: CancelToken,
    ) -> impl Stream<Item = AnalysisProgress> + Send + 'static {
        candidates.truncate(self.config.max_repos);
        let total = candidates.len();
        let batch_size = self.config.batch_size.max(1);

        let mut units = JoinSet::new();
        let mut remaining = candidates.into_iter().peekable();
        while remaining.peek().is_some() {
            let batch = remaining.by_ref().take(batch_size).collect::<Vec<_>>();
            units.spawn(score_batch(
                Arc::clone(&self.scorer),
                Arc::clone(&profile),
                batch,
                self.config.batch_timeout,
                cancel.clone(),
            ));
        }
        debug!(total, batches = units.len(), "analysis batches submitted");

        let state = CoordinatorState {
            units,
            cancel,
            results: Vec::new(),
            progress: 0,
            total,
            batch_size,
        };

        stream::unfold(state, |mut state| async move {
            if state.cancel.is_cancelled() {
                state.units.abort_all();
                return None;
            }
            let cancel = state.cancel.clone();
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = state.units.join_next() => Some(joined),
            };
            match joined {
                None => {
                    debug!("analysis cancelled, aborting outstanding batches");
                    state.units.abort_all();
                    None
                }
                Some(None) => None,
                Some(Some(report)) => {
                    let item = state.advance(report);
                    Some((item, state))
                }
            }
        })
    }
}
