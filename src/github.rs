//! Outbound access to the GitHub API.
//!
//! The engine talks to GitHub only through [`PullRequestSource`], so the
//! worker pools can share one `Arc<dyn PullRequestSource>` and tests can swap
//! in an in-memory source. [`GitHubClient`] is the `octocrab` implementation.

use crate::types::RepoId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use octocrab::models::pulls::{PullRequest, ReviewState};
use octocrab::params::{pulls::Sort, Direction, State};
use octocrab::{Octocrab, Page};
use serde::{Deserialize, Serialize};

/// Page size used for every paginated listing.
pub const PER_PAGE: u8 = 100;

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub has_next: bool,
}

impl<T> Paged<T> {
    fn from_page<U>(page: Page<U>, f: impl FnMut(U) -> Option<T>) -> Self {
        let has_next = page.next.is_some();
        Self {
            items: page.items.into_iter().filter_map(f).collect(),
            has_next,
        }
    }
}

/// Logs that a listing stopped at the page cap while more pages remained.
pub fn warn_page_limit(repo: &RepoId, listing: &'static str, max_pages: u32) {
    tracing::warn!(
        repo = %repo,
        listing,
        max_pages,
        "Hit page limit before reaching the end of the listing. Data may be incomplete."
    );
}

/// A closed pull request as returned by the list endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClosedPullRequest {
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub base_ref: String,
}

#[derive(Debug, Clone)]
pub struct ReviewEvent {
    pub approved: bool,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// An open pull request, with size statistics when the endpoint provides them.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenPullRequest {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub body: Option<String>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub commits: Option<u64>,
    pub changed_files: Option<u64>,
}

impl OpenPullRequest {
    /// Whether the size statistics needed for quality scoring are present.
    pub fn has_size_stats(&self) -> bool {
        self.additions.is_some() && self.deletions.is_some() && self.commits.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset: DateTime<Utc>,
}

#[async_trait]
pub trait PullRequestSource: Send + Sync {
    async fn default_branch(&self, repo: &RepoId) -> Result<String>;

    /// Closed pull requests merged into `base`, most recently updated first.
    async fn closed_pull_requests(
        &self,
        repo: &RepoId,
        base: &str,
        page: u32,
    ) -> Result<Paged<ClosedPullRequest>>;

    async fn reviews(&self, repo: &RepoId, number: u64, page: u32) -> Result<Paged<ReviewEvent>>;

    /// Open pull requests, oldest first.
    async fn open_pull_requests(&self, repo: &RepoId, page: u32) -> Result<Paged<OpenPullRequest>>;

    async fn pull_request(&self, repo: &RepoId, number: u64) -> Result<OpenPullRequest>;

    async fn rate_limit(&self) -> Result<RateLimitInfo>;
}

pub struct GitHubClient {
    octocrab: Octocrab,
}

impl GitHubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token);
        }

        Ok(Self {
            octocrab: builder.build()?,
        })
    }
}

fn to_open_pull_request(pr: PullRequest) -> Option<OpenPullRequest> {
    let created_at = pr.created_at?;
    Some(OpenPullRequest {
        number: pr.number,
        title: pr.title.unwrap_or_default(),
        author: pr.user.map(|user| user.login).unwrap_or_default(),
        url: pr.html_url.map(|url| url.to_string()).unwrap_or_default(),
        created_at,
        body: pr.body,
        additions: pr.additions,
        deletions: pr.deletions,
        commits: pr.commits,
        changed_files: pr.changed_files,
    })
}

#[async_trait]
impl PullRequestSource for GitHubClient {
    async fn default_branch(&self, repo: &RepoId) -> Result<String> {
        let repository = self
            .octocrab
            .repos(&repo.owner, &repo.repo)
            .get()
            .await
            .with_context(|| format!("get repository {repo}"))?;

        repository
            .default_branch
            .with_context(|| format!("repository {repo} has no default branch"))
    }

    async fn closed_pull_requests(
        &self,
        repo: &RepoId,
        base: &str,
        page: u32,
    ) -> Result<Paged<ClosedPullRequest>> {
        let current_page = self
            .octocrab
            .pulls(&repo.owner, &repo.repo)
            .list()
            .state(State::Closed)
            .base(base)
            .sort(Sort::Updated)
            .direction(Direction::Descending)
            .per_page(PER_PAGE)
            .page(page)
            .send()
            .await
            .with_context(|| format!("list closed pull requests of {repo} (page {page})"))?;

        Ok(Paged::from_page(current_page, |pr| {
            Some(ClosedPullRequest {
                number: pr.number,
                created_at: pr.created_at?,
                merged_at: pr.merged_at,
                base_ref: pr.base.ref_field,
            })
        }))
    }

    async fn reviews(&self, repo: &RepoId, number: u64, page: u32) -> Result<Paged<ReviewEvent>> {
        let current_page = self
            .octocrab
            .pulls(&repo.owner, &repo.repo)
            .list_reviews(number)
            .per_page(PER_PAGE)
            .page(page)
            .send()
            .await
            .with_context(|| format!("list reviews of {repo}#{number} (page {page})"))?;

        Ok(Paged::from_page(current_page, |review| {
            Some(ReviewEvent {
                approved: matches!(review.state, Some(ReviewState::Approved)),
                submitted_at: review.submitted_at,
            })
        }))
    }

    async fn open_pull_requests(&self, repo: &RepoId, page: u32) -> Result<Paged<OpenPullRequest>> {
        let current_page = self
            .octocrab
            .pulls(&repo.owner, &repo.repo)
            .list()
            .state(State::Open)
            .sort(Sort::Created)
            .direction(Direction::Ascending)
            .per_page(PER_PAGE)
            .page(page)
            .send()
            .await
            .with_context(|| format!("list open pull requests of {repo} (page {page})"))?;

        Ok(Paged::from_page(current_page, to_open_pull_request))
    }

    async fn pull_request(&self, repo: &RepoId, number: u64) -> Result<OpenPullRequest> {
        let pr = self
            .octocrab
            .pulls(&repo.owner, &repo.repo)
            .get(number)
            .await
            .with_context(|| format!("get pull request {repo}#{number}"))?;

        to_open_pull_request(pr)
            .with_context(|| format!("pull request {repo}#{number} has no creation time"))
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo> {
        let rate = self
            .octocrab
            .ratelimit()
            .get()
            .await
            .context("get rate limit")?
            .rate;

        let reset = Utc
            .timestamp_opt(rate.reset as i64, 0)
            .single()
            .context("rate limit reset is out of range")?;

        Ok(RateLimitInfo {
            limit: rate.limit as u64,
            remaining: rate.remaining as u64,
            reset,
        })
    }
}
