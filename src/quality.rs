//! Heuristic quality findings for open pull requests.
//!
//! Each open pull request is checked against a fixed rule set. Findings are
//! ranked by severity and an internal impact score, and only the top few are
//! reported.

use crate::error::MetricsError;
use crate::github::{self, OpenPullRequest, PullRequestSource};
use crate::pool;
use crate::types::RepoId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const LARGE_PR_LINES: u64 = 500;
const SHORT_DESCRIPTION_CHARS: usize = 50;
const MANY_COMMITS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssueKind {
    LargePr,
    NoDescription,
    ShortDescription,
    ManyCommits,
    LargeSingleCommit,
}

impl QualityIssueKind {
    pub fn severity(self) -> Severity {
        match self {
            QualityIssueKind::LargePr | QualityIssueKind::NoDescription => Severity::High,
            QualityIssueKind::ShortDescription
            | QualityIssueKind::ManyCommits
            | QualityIssueKind::LargeSingleCommit => Severity::Medium,
        }
    }

    fn recommendation(self) -> &'static str {
        match self {
            QualityIssueKind::LargePr => {
                "Split the change into smaller, independently reviewable pull requests."
            }
            QualityIssueKind::NoDescription => {
                "Describe what the change does and how it was tested."
            }
            QualityIssueKind::ShortDescription => {
                "Expand the description with context and testing notes."
            }
            QualityIssueKind::ManyCommits => "Squash or regroup commits into a few logical steps.",
            QualityIssueKind::LargeSingleCommit => "Break the commit into smaller logical commits.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PRQualityIssue {
    pub repository: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub kind: QualityIssueKind,
    pub severity: Severity,
    pub reason: String,
    pub recommendation: String,
    #[serde(skip)]
    impact: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PRQualityIssues {
    /// Findings across all repositories before ranking cut the list.
    pub total_count: usize,
    pub issues: Vec<PRQualityIssue>,
}

/// Size of a change for ranking: changed lines, or a proxy from file and commit counts.
fn base_impact(pr: &OpenPullRequest) -> u64 {
    let lines = pr.additions.unwrap_or(0) + pr.deletions.unwrap_or(0);
    if lines > 0 {
        lines
    } else {
        pr.changed_files.unwrap_or(0) * 20 + pr.commits.unwrap_or(0) * 10
    }
}

/// Applies the rule set to one open pull request.
pub fn evaluate_pull_request(repo: &RepoId, pr: &OpenPullRequest) -> Vec<PRQualityIssue> {
    let lines = pr.additions.unwrap_or(0) + pr.deletions.unwrap_or(0);
    let commits = pr.commits.unwrap_or(0);
    let body = pr.body.as_deref().map(str::trim).unwrap_or("");
    let body_len = body.chars().count();
    let base = base_impact(pr);

    let mut findings: Vec<(QualityIssueKind, String, u64)> = Vec::new();

    if lines >= LARGE_PR_LINES {
        findings.push((
            QualityIssueKind::LargePr,
            format!("{lines} lines changed (threshold {LARGE_PR_LINES})"),
            base * 2,
        ));
    }
    if body.is_empty() {
        findings.push((
            QualityIssueKind::NoDescription,
            "pull request has no description".to_string(),
            base + 200,
        ));
    } else if body_len < SHORT_DESCRIPTION_CHARS {
        findings.push((
            QualityIssueKind::ShortDescription,
            format!("description is only {body_len} characters"),
            base + 100,
        ));
    }
    if commits >= MANY_COMMITS {
        findings.push((
            QualityIssueKind::ManyCommits,
            format!("{commits} commits (threshold {MANY_COMMITS})"),
            base + commits * 20,
        ));
    }
    if commits == 1 && lines >= LARGE_PR_LINES {
        findings.push((
            QualityIssueKind::LargeSingleCommit,
            format!("{lines} lines changed in a single commit"),
            base * 2 + 100,
        ));
    }

    findings
        .into_iter()
        .map(|(kind, reason, impact)| PRQualityIssue {
            repository: repo.to_string(),
            number: pr.number,
            title: pr.title.clone(),
            author: pr.author.clone(),
            url: pr.url.clone(),
            created_at: pr.created_at,
            kind,
            severity: kind.severity(),
            reason,
            recommendation: kind.recommendation().to_string(),
            impact,
        })
        .collect()
}

fn compare_issues(a: &PRQualityIssue, b: &PRQualityIssue) -> Ordering {
    a.severity
        .cmp(&b.severity)
        .then_with(|| b.impact.cmp(&a.impact))
        .then_with(|| a.repository.cmp(&b.repository))
        .then_with(|| a.number.cmp(&b.number))
}

/// Orders findings (severity, impact, repository, number) and keeps the first `top_n`.
pub fn rank_issues(mut issues: Vec<PRQualityIssue>, top_n: usize) -> PRQualityIssues {
    let total_count = issues.len();
    issues.sort_by(compare_issues);
    issues.truncate(top_n);
    PRQualityIssues {
        total_count,
        issues,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    pub top_n: usize,
    pub repo_workers: usize,
    pub detail_workers: usize,
    pub max_pages: u32,
}

async fn list_open(
    source: &dyn PullRequestSource,
    repo: &RepoId,
    max_pages: u32,
    cancel: &CancellationToken,
) -> Result<Vec<OpenPullRequest>, MetricsError> {
    let mut open = Vec::new();
    let mut page_num = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(MetricsError::Cancelled);
        }
        let page = source
            .open_pull_requests(repo, page_num)
            .await
            .map_err(|e| MetricsError::fetch(repo, e))?;
        open.extend(page.items);

        if !page.has_next {
            break;
        }
        if page_num >= max_pages {
            github::warn_page_limit(repo, "open pull requests", max_pages);
            break;
        }
        page_num += 1;
    }

    Ok(open)
}

async fn evaluate_repository(
    source: Arc<dyn PullRequestSource>,
    repo: RepoId,
    settings: QualitySettings,
    cancel: CancellationToken,
) -> Result<Vec<PRQualityIssue>, MetricsError> {
    let open = list_open(source.as_ref(), &repo, settings.max_pages, &cancel).await?;

    let (complete, partial): (Vec<_>, Vec<_>) =
        open.into_iter().partition(OpenPullRequest::has_size_stats);

    let mut issues: Vec<PRQualityIssue> = complete
        .iter()
        .flat_map(|pr| evaluate_pull_request(&repo, pr))
        .collect();

    // List endpoints omit size statistics; fetch the detail for those.
    let numbers: Vec<u64> = partial.iter().map(|pr| pr.number).collect();
    let worker_source = Arc::clone(&source);
    let worker_repo = repo.clone();
    let results = pool::spawn_pool(numbers, settings.detail_workers, &cancel, move |number| {
        let source = Arc::clone(&worker_source);
        let repo = worker_repo.clone();
        async move {
            source
                .pull_request(&repo, number)
                .await
                .map_err(|e| MetricsError::fetch(&repo, e))
        }
    });

    let details = pool::try_collect(results, &cancel).await?;
    if cancel.is_cancelled() {
        return Err(MetricsError::Cancelled);
    }
    issues.extend(details.iter().flat_map(|pr| evaluate_pull_request(&repo, pr)));

    Ok(issues)
}

/// Scores every open pull request across `repos`.
///
/// All-or-nothing: the first failing repository cancels the rest and its
/// error is returned.
pub async fn analyze_quality(
    source: Arc<dyn PullRequestSource>,
    repos: Vec<RepoId>,
    settings: QualitySettings,
    cancel: &CancellationToken,
) -> Result<PRQualityIssues, MetricsError> {
    let cancel = cancel.child_token();
    let worker_cancel = cancel.clone();

    let results = pool::spawn_pool(repos, settings.repo_workers, &cancel, move |repo: RepoId| {
        evaluate_repository(Arc::clone(&source), repo, settings, worker_cancel.clone())
    });

    let per_repo = pool::try_collect(results, &cancel).await?;
    if cancel.is_cancelled() {
        return Err(MetricsError::Cancelled);
    }

    let ranked = rank_issues(per_repo.into_iter().flatten().collect(), settings.top_n);
    tracing::debug!(findings = ranked.total_count, "Quality analysis finished");
    Ok(ranked)
}
