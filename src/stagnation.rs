//! Detection of open pull requests that have been waiting too long.

use crate::error::MetricsError;
use crate::github::{self, OpenPullRequest, PullRequestSource};
use crate::pool;
use crate::types::{duration_secs, RepoId};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagnantPRInfo {
    pub repository: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub age: Duration,
}

impl StagnantPRInfo {
    fn new(repo: &RepoId, pr: &OpenPullRequest, age: Duration) -> Self {
        Self {
            repository: repo.to_string(),
            number: pr.number,
            title: pr.title.clone(),
            author: pr.author.clone(),
            url: pr.url.clone(),
            created_at: pr.created_at,
            age,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagnantPRMetrics {
    #[serde(with = "duration_secs")]
    pub threshold: Duration,
    pub total_count: usize,
    #[serde(with = "duration_secs")]
    pub average_age: Duration,
    /// The oldest stagnant pull requests, oldest first.
    pub oldest: Vec<StagnantPRInfo>,
}

/// Summarizes stagnant pull requests gathered across repositories.
pub fn summarize_stagnant(
    mut stagnant: Vec<StagnantPRInfo>,
    threshold: Duration,
    top_n: usize,
) -> StagnantPRMetrics {
    let total_count = stagnant.len();
    let average_age = if total_count == 0 {
        Duration::zero()
    } else {
        let total_secs: f64 = stagnant.iter().map(|pr| pr.age.num_seconds() as f64).sum();
        Duration::seconds((total_secs / total_count as f64).round() as i64)
    };

    stagnant.sort_by(|a, b| {
        b.age
            .cmp(&a.age)
            .then_with(|| a.repository.cmp(&b.repository))
            .then_with(|| a.number.cmp(&b.number))
    });
    stagnant.truncate(top_n);

    StagnantPRMetrics {
        threshold,
        total_count,
        average_age,
        oldest: stagnant,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StagnationSettings {
    pub threshold: Duration,
    pub top_n: usize,
    pub workers: usize,
    pub max_pages: u32,
}

/// Lists a repository's open pull requests, oldest first, until one is younger than the threshold.
async fn fetch_stagnant(
    source: &dyn PullRequestSource,
    repo: &RepoId,
    settings: StagnationSettings,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<Vec<StagnantPRInfo>, MetricsError> {
    let mut stagnant = Vec::new();
    let mut page_num = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(MetricsError::Cancelled);
        }

        let page = source
            .open_pull_requests(repo, page_num)
            .await
            .map_err(|e| MetricsError::fetch(repo, e))?;

        let mut reached_recent = false;
        for pr in &page.items {
            let age = now - pr.created_at;
            if age < settings.threshold {
                reached_recent = true;
                break;
            }
            stagnant.push(StagnantPRInfo::new(repo, pr, age));
        }

        if reached_recent || !page.has_next {
            break;
        }
        if page_num >= settings.max_pages {
            github::warn_page_limit(repo, "open pull requests", settings.max_pages);
            break;
        }
        page_num += 1;
    }

    Ok(stagnant)
}

/// Finds open pull requests older than the threshold across all `repos`.
///
/// Independent of any sampling window. The first failing repository fails
/// the whole analysis.
pub async fn analyze_stagnation(
    source: Arc<dyn PullRequestSource>,
    repos: Vec<RepoId>,
    settings: StagnationSettings,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<StagnantPRMetrics, MetricsError> {
    let cancel = cancel.child_token();
    let worker_cancel = cancel.clone();

    let results = pool::spawn_pool(repos, settings.workers, &cancel, move |repo: RepoId| {
        let source = Arc::clone(&source);
        let cancel = worker_cancel.clone();
        async move { fetch_stagnant(source.as_ref(), &repo, settings, now, &cancel).await }
    });

    let per_repo = pool::try_collect(results, &cancel).await?;
    if cancel.is_cancelled() {
        return Err(MetricsError::Cancelled);
    }

    let metrics = summarize_stagnant(
        per_repo.into_iter().flatten().collect(),
        settings.threshold,
        settings.top_n,
    );
    tracing::debug!(stagnant = metrics.total_count, "Stagnation analysis finished");
    Ok(metrics)
}
