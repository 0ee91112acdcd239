//! Sequences discovery, filtering, readme fetch, analysis and persistence for one run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use scout_core::filtering;
use scout_core::{
    rank_visible, AnalysisResult, DeveloperProfile, Phase, RepositoryMetadata, RunCounters,
    RunStatus, ScoutEvent, SearchFilters, SearchOutcome,
};
use scout_github::{DiscoveryError, RepoRef, RepositorySource, SearchResults};
use scout_storage::{ScoutStore, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::analysis::AnalysisCoordinator;
use crate::registry::CancelToken;
use crate::scoring::ScoringInput;

pub const NO_RESULTS_MESSAGE: &str = "No repositories found. Try broadening your filters.";
pub const ALL_FILTERED_MESSAGE: &str = "All repos filtered out. Try adjusting your filters.";
pub const README_FAILED_WARNING: &str =
    "README fetch failed; repositories were analyzed without README context.";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run cancelled")]
    Cancelled,
    #[error("event stream closed by the client")]
    Disconnected,
}

/// Inputs of one run, fixed when it starts.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub profile: Arc<DeveloperProfile>,
    pub filters: SearchFilters,
}

/// What a run has established so far; persisted on every exit path.
#[derive(Debug, Default)]
struct RunTracker {
    counters: RunCounters,
    warnings: Vec<String>,
    /// Terminal status already written to the store, if any.
    persisted: Option<RunStatus>,
}

struct Emitter<'a> {
    events: &'a mpsc::Sender<ScoutEvent>,
    cancel: &'a CancelToken,
}

impl Emitter<'_> {
    async fn send(&self, event: ScoutEvent) -> Result<(), RunError> {
        self.events
            .send(event)
            .await
            .map_err(|_| RunError::Disconnected)
    }

    async fn status(&self, message: impl Into<String>, phase: Phase) -> Result<(), RunError> {
        self.send(ScoutEvent::status(message, phase)).await
    }

    fn check(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if self.events.is_closed() {
            return Err(RunError::Disconnected);
        }
        Ok(())
    }

    /// Drive `fut` unless the run is cancelled or the client goes away first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, RunError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RunError::Cancelled),
            _ = self.events.closed() => Err(RunError::Disconnected),
            out = fut => Ok(out),
        }
    }
}

pub struct Orchestrator {
    source: Arc<dyn RepositorySource>,
    store: ScoutStore,
    coordinator: AnalysisCoordinator,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn RepositorySource>,
        store: ScoutStore,
        coordinator: AnalysisCoordinator,
    ) -> Self {
        Self {
            source,
            store,
            coordinator,
        }
    }

    pub fn store(&self) -> &ScoutStore {
        &self.store
    }

    /// Execute the run, sending progress to `events`. Exactly one `complete` or `error` event
    /// ends the stream (unless the receiver is gone) and the run is left in a terminal status.
    pub async fn run(
        &self,
        ctx: RunContext,
        cancel: CancelToken,
        events: mpsc::Sender<ScoutEvent>,
    ) -> RunStatus {
        let span = info_span!("scout_run", run_id = %ctx.run_id);
        async {
            let emitter = Emitter {
                events: &events,
                cancel: &cancel,
            };
            let mut tracker = RunTracker::default();
            match self.execute(&ctx, &emitter, &mut tracker).await {
                Ok(status) => status,
                Err(RunError::Cancelled) | Err(RunError::Disconnected) => {
                    if let Some(status) = tracker.persisted {
                        info!(%status, "client left after the run was finished");
                        return status;
                    }
                    info!("run cancelled");
                    self.persist_terminal(&ctx.run_id, RunStatus::Cancelled, &tracker)
                        .await;
                    let mut outcome =
                        SearchOutcome::new(&ctx.run_id, RunStatus::Cancelled, tracker.counters);
                    outcome.warnings = tracker.warnings;
                    let _ = emitter.send(ScoutEvent::complete(outcome)).await;
                    RunStatus::Cancelled
                }
                Err(err) => {
                    error!(error = %err, "run failed");
                    self.persist_terminal(&ctx.run_id, RunStatus::Failed, &tracker)
                        .await;
                    let _ = emitter
                        .send(ScoutEvent::error(format!("Scout search failed: {err}")))
                        .await;
                    RunStatus::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn persist_terminal(&self, run_id: &str, status: RunStatus, tracker: &RunTracker) {
        if let Err(err) = self
            .store
            .finish_run(run_id, status, tracker.counters, &tracker.warnings)
            .await
        {
            error!(error = %err, %status, "persisting terminal run status failed");
        }
    }

    /// A row that is no longer `running` was cancelled (or reaped) elsewhere.
    async fn record_progress(&self, run_id: &str, counters: RunCounters) -> Result<(), RunError> {
        if self.store.update_run_progress(run_id, counters).await? {
            Ok(())
        } else {
            info!("run was stopped in storage, abandoning it");
            Err(RunError::Cancelled)
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        emitter: &Emitter<'_>,
        tracker: &mut RunTracker,
    ) -> Result<RunStatus, RunError> {
        emitter.status("Searching GitHub...", Phase::Discovering).await?;
        let found = emitter.guard(self.discover(&ctx.filters)).await??;
        tracker.warnings.extend(found.warnings);
        let repos = found.repos;
        self.store.upsert_repositories(&repos).await?;
        tracker.counters = RunCounters::new(repos.len() as u32, 0, 0);
        self.record_progress(&ctx.run_id, tracker.counters).await?;
        emitter
            .status(
                format!("Discovered {} repositories", repos.len()),
                Phase::Discovering,
            )
            .await?;

        if repos.is_empty() {
            emitter.status(NO_RESULTS_MESSAGE, Phase::Finalizing).await?;
            return self.finish(ctx, emitter, tracker, Vec::new(), Vec::new(), 0).await;
        }
        emitter.check()?;

        emitter.status("Filtering candidates...", Phase::Filtering).await?;
        let discovered = repos.len();
        let filtered = filtering::apply(repos, ctx.filters.min_stars(), ctx.filters.max_stars());
        tracker.counters = RunCounters::new(discovered as u32, filtered.len() as u32, 0);
        self.record_progress(&ctx.run_id, tracker.counters).await?;
        emitter
            .status(
                format!("{} repos passed filters", filtered.len()),
                Phase::Filtering,
            )
            .await?;

        if filtered.is_empty() {
            emitter.status(ALL_FILTERED_MESSAGE, Phase::Finalizing).await?;
            return self.finish(ctx, emitter, tracker, Vec::new(), Vec::new(), 0).await;
        }
        emitter.check()?;

        let mut capped = filtered;
        capped.truncate(self.coordinator.config().max_repos);

        emitter
            .status(
                format!("Fetching READMEs for {} repos...", capped.len()),
                Phase::FetchingReadmes,
            )
            .await?;
        let refs = capped.iter().map(RepoRef::from).collect::<Vec<_>>();
        let mut readmes = match emitter.guard(self.source.fetch_long_text(&refs)).await? {
            Ok(readmes) => readmes,
            Err(err) => {
                warn!(error = %err, "readme fetch failed, continuing without readmes");
                tracker.warnings.push(README_FAILED_WARNING.to_string());
                HashMap::new()
            }
        };
        emitter.check()?;

        emitter.status("Starting AI analysis...", Phase::Analyzing).await?;
        let inputs = capped
            .iter()
            .map(|repo| ScoringInput {
                long_text: readmes.remove(&repo.repo_key()).flatten(),
                repo: repo.clone(),
            })
            .collect::<Vec<_>>();

        let mut progress = Box::pin(self.coordinator.run(
            Arc::clone(&ctx.profile),
            inputs,
            emitter.cancel.clone(),
        ));
        let mut results = Vec::new();
        while let Some(item) = emitter.guard(progress.next()).await? {
            results = item.results;
            emitter.send(item.event).await?;
        }
        emitter.check()?;

        let capped_len = capped.len();
        self.finish(ctx, emitter, tracker, results, capped, capped_len)
            .await
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        emitter: &Emitter<'_>,
        tracker: &mut RunTracker,
        results: Vec<AnalysisResult>,
        capped: Vec<RepositoryMetadata>,
        capped_len: usize,
    ) -> Result<RunStatus, RunError> {
        self.store.save_results(&ctx.run_id, &results).await?;
        tracker.counters = RunCounters::new(
            tracker.counters.discovered(),
            tracker.counters.filtered(),
            results.len() as u32,
        );

        let status = if results.len() == capped_len {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };
        if capped_len > 0 {
            let message = match status {
                RunStatus::Partial => format!(
                    "Partial results: analyzed {} of {} repos",
                    results.len(),
                    capped_len
                ),
                _ => format!("Analysis complete: {} repos analyzed", results.len()),
            };
            emitter.status(message, Phase::Finalizing).await?;
        }

        if !self
            .store
            .finish_run(&ctx.run_id, status, tracker.counters, &tracker.warnings)
            .await?
        {
            info!(%status, "run was stopped in storage before it finished");
            return Err(RunError::Cancelled);
        }
        tracker.persisted = Some(status);
        info!(%status, analyzed = results.len(), capped = capped_len, "run finished");

        let mut outcome = SearchOutcome::new(&ctx.run_id, status, tracker.counters);
        outcome.results = rank_visible(&results);
        outcome.repos = capped;
        outcome.warnings = tracker.warnings.clone();
        emitter.send(ScoutEvent::complete(outcome)).await?;
        Ok(status)
    }

    /// Search, retrying once without topic qualifiers when they match nothing.
    async fn discover(&self, filters: &SearchFilters) -> Result<SearchResults, DiscoveryError> {
        let mut found = self.source.search(filters).await?;
        if !found.repos.is_empty() || filters.topics().is_empty() {
            return Ok(found);
        }

        let relaxed = self.source.search(&filters.without_topics()).await?;
        found.warnings.extend(relaxed.warnings);
        if !relaxed.repos.is_empty() {
            info!(repos = relaxed.repos.len(), "topic filter relaxed");
            found.warnings.push(format!(
                "No repos matched topic filter ({}). Showing results without topic filter \u{2014} topics still influence AI ranking.",
                filters.topics().join(", ")
            ));
        }
        found.repos = relaxed.repos;
        Ok(found)
    }
}
