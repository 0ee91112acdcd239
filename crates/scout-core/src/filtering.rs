//! Deterministic pre-analysis filtering and ranking of discovered repositories.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::RepositoryMetadata;

const NON_SUBSTANTIVE_PATTERNS: &[&str] = &[
    r"\bawesome[-_]",
    r"\btutorial\b",
    r"\blearn[-_]",
    r"\bcheatsheet\b",
    r"\bcourse\b",
    r"\binterview[-_]prep\b",
    r"\bcurated\s+list\b",
    r"\bcoding[-_]challenge\b",
];

static NON_SUBSTANTIVE: Lazy<Regex> = Lazy::new(|| {
    let joined = NON_SUBSTANTIVE_PATTERNS.join("|");
    Regex::new(&format!("(?i){joined}")).expect("static filter patterns compile")
});

pub const MAX_CONTRIBUTION_SCORE: f64 = 45.0;

/// Lists, tutorials and course material rather than a codebase one can contribute to.
pub fn is_non_substantive(repo: &RepositoryMetadata) -> bool {
    let haystack = format!(
        "{} {}",
        repo.name,
        repo.description.as_deref().unwrap_or_default()
    );
    NON_SUBSTANTIVE.is_match(&haystack)
}

pub fn has_contribution_surface(repo: &RepositoryMetadata) -> bool {
    repo.open_issue_count > 0
}

/// Weighted "contributions welcome" signal, capped per component.
pub fn contribution_score(repo: &RepositoryMetadata) -> f64 {
    let gfi = repo.good_first_issue_count.min(10) as f64;
    let help = repo.help_wanted_count.min(10) as f64;
    let open = repo.open_issue_count.min(100) as f64;
    gfi * 2.0 + help * 1.5 + open * 0.1
}

/// Drop unsuitable repositories and order the rest by [`contribution_score`], best first.
/// Ties keep their discovery order.
pub fn apply(
    repos: Vec<RepositoryMetadata>,
    min_stars: u32,
    max_stars: u32,
) -> Vec<RepositoryMetadata> {
    let mut scored = repos
        .into_iter()
        .filter(|repo| !is_non_substantive(repo))
        .filter(has_contribution_surface)
        .filter(|repo| (min_stars..=max_stars).contains(&repo.star_count))
        .map(|repo| (contribution_score(&repo), repo))
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.into_iter().map(|(_, repo)| repo).collect()
}
