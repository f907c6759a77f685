//! In-memory [`PullRequestSource`] for unit tests.

use crate::github::{
    ClosedPullRequest, OpenPullRequest, Paged, PullRequestSource, RateLimitInfo, ReviewEvent,
};
use crate::types::RepoId;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Collects formatted log output for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn closed_pr(
    number: u64,
    base: &str,
    created_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
) -> ClosedPullRequest {
    ClosedPullRequest {
        number,
        created_at,
        merged_at,
        base_ref: base.to_string(),
    }
}

pub fn review(approved: bool, submitted_at: Option<DateTime<Utc>>) -> ReviewEvent {
    ReviewEvent {
        approved,
        submitted_at,
    }
}

pub fn open_pr(number: u64, created_at: DateTime<Utc>) -> OpenPullRequest {
    OpenPullRequest {
        number,
        title: format!("PR #{number}"),
        author: "octocat".to_string(),
        url: format!("https://github.com/owner/repo/pull/{number}"),
        created_at,
        body: Some("A description that is comfortably longer than fifty characters.".to_string()),
        additions: Some(10),
        deletions: Some(5),
        commits: Some(2),
        changed_files: Some(1),
    }
}

#[derive(Default)]
pub struct FakeRepo {
    default_branch: String,
    closed: Vec<ClosedPullRequest>,
    reviews: HashMap<u64, Vec<ReviewEvent>>,
    failing_reviews: HashSet<u64>,
    open: Vec<OpenPullRequest>,
    details: HashMap<u64, OpenPullRequest>,
    failing: bool,
    failing_open: bool,
    closed_blocked_until: Option<CancellationToken>,
    cancels_on_open: Option<CancellationToken>,
}

impl FakeRepo {
    pub fn new(default_branch: &str) -> Self {
        Self {
            default_branch: default_branch.to_string(),
            ..Default::default()
        }
    }

    /// A repository whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new("main")
        }
    }

    pub fn with_closed(mut self, closed: Vec<ClosedPullRequest>) -> Self {
        self.closed = closed;
        self
    }

    pub fn with_reviews(mut self, number: u64, reviews: Vec<ReviewEvent>) -> Self {
        self.reviews.insert(number, reviews);
        self
    }

    pub fn with_failing_reviews(mut self, number: u64) -> Self {
        self.failing_reviews.insert(number);
        self
    }

    /// Open pull request listings fail; everything else works.
    pub fn with_failing_open(mut self) -> Self {
        self.failing_open = true;
        self
    }

    pub fn with_open(mut self, open: Vec<OpenPullRequest>) -> Self {
        self.open = open;
        self
    }

    pub fn with_detail(mut self, detail: OpenPullRequest) -> Self {
        self.details.insert(detail.number, detail);
        self
    }

    /// Closed pull request listings wait until `token` is cancelled.
    pub fn with_closed_blocked_until(mut self, token: CancellationToken) -> Self {
        self.closed_blocked_until = Some(token);
        self
    }

    /// Listing open pull requests cancels `token` first.
    pub fn with_open_cancelling(mut self, token: CancellationToken) -> Self {
        self.cancels_on_open = Some(token);
        self
    }
}

pub struct FakeSource {
    repos: HashMap<String, FakeRepo>,
    page_size: usize,
    calls: AtomicUsize,
    closed_page_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            repos: HashMap::new(),
            page_size: 100,
            calls: AtomicUsize::new(0),
            closed_page_calls: AtomicUsize::new(0),
            detail_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeSource {
    pub fn with_repo(mut self, slug: &str, repo: FakeRepo) -> Self {
        self.repos.insert(slug.to_string(), repo);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closed_page_calls(&self) -> usize {
        self.closed_page_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    fn repo(&self, repo: &RepoId) -> Result<&FakeRepo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.repos.get(&repo.to_string()) {
            Some(fake) if fake.failing => bail!("GitHub error for {repo}: server error"),
            Some(fake) => Ok(fake),
            None => bail!("GitHub error for {repo}: Not Found"),
        }
    }

    fn paginate<T: Clone>(&self, items: &[T], page: u32) -> Paged<T> {
        let start = (page.saturating_sub(1) as usize) * self.page_size;
        let end = (start + self.page_size).min(items.len());
        Paged {
            items: items.get(start..end).unwrap_or_default().to_vec(),
            has_next: end < items.len(),
        }
    }
}

#[async_trait]
impl PullRequestSource for FakeSource {
    async fn default_branch(&self, repo: &RepoId) -> Result<String> {
        Ok(self.repo(repo)?.default_branch.clone())
    }

    async fn closed_pull_requests(
        &self,
        repo: &RepoId,
        _base: &str,
        page: u32,
    ) -> Result<Paged<ClosedPullRequest>> {
        let fake = self.repo(repo)?;
        self.closed_page_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &fake.closed_blocked_until {
            token.cancelled().await;
        }
        Ok(self.paginate(&fake.closed, page))
    }

    async fn reviews(&self, repo: &RepoId, number: u64, page: u32) -> Result<Paged<ReviewEvent>> {
        let fake = self.repo(repo)?;
        if fake.failing_reviews.contains(&number) {
            bail!("reviews of {repo}#{number} unavailable");
        }
        let reviews = fake.reviews.get(&number).map(Vec::as_slice).unwrap_or_default();
        Ok(self.paginate(reviews, page))
    }

    async fn open_pull_requests(&self, repo: &RepoId, page: u32) -> Result<Paged<OpenPullRequest>> {
        let fake = self.repo(repo)?;
        if let Some(token) = &fake.cancels_on_open {
            token.cancel();
        }
        if fake.failing_open {
            bail!("open pull requests of {repo} unavailable");
        }
        Ok(self.paginate(&fake.open, page))
    }

    async fn pull_request(&self, repo: &RepoId, number: u64) -> Result<OpenPullRequest> {
        let fake = self.repo(repo)?;
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        fake.details
            .get(&number)
            .or_else(|| fake.open.iter().find(|pr| pr.number == number))
            .cloned()
            .ok_or_else(|| anyhow!("pull request {repo}#{number} not found"))
    }

    async fn rate_limit(&self) -> Result<RateLimitInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RateLimitInfo {
            limit: 5000,
            remaining: 4999,
            reset: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        })
    }
}
