//! Service layer for computing lead-time metrics across repositories.
//!
//! This module implements `MetricsQuerier`, the single entry point for lead-time metrics. It:
//! 1. Parses the requested repository slugs, collecting malformed ones as errors.
//! 2. Fans repositories out to a bounded pool of samplers and fans their samples back in.
//! 3. Aggregates the complete sample set once every sampler has finished.
//! 4. Runs the stagnation and quality analyzers over the repositories' open pull requests.
//!
//! Nothing is cached between calls; every invocation starts from scratch.

use crate::config::EngineConfig;
use crate::error::{JoinedError, MetricsError};
use crate::fetcher::LeadTimeSampler;
use crate::github::{PullRequestSource, RateLimitInfo};
use crate::metrics::{AnalyzerWarning, LeadTimeMetrics, LeadTimeSample};
use crate::pool;
use crate::quality::{self, QualitySettings};
use crate::stagnation::{self, StagnationSettings};
use crate::types::RepoId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A snapshot of how far a run has progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total_repos: usize,
    pub processed_repos: usize,
    /// The repository whose result was just collected; empty before the first and after the last.
    pub current_repo: String,
}

/// Callback receiving [`Progress`] snapshots.
pub type ProgressFn<'a> = dyn Fn(Progress) + Send + Sync + 'a;

/// What a lead-time run produced.
#[derive(Debug)]
pub enum MetricsOutcome {
    /// Every repository succeeded.
    Complete(LeadTimeMetrics),
    /// Some repositories succeeded; the error joins everything that failed.
    Partial(LeadTimeMetrics, MetricsError),
    /// Nothing succeeded.
    Failed(MetricsError),
}

impl MetricsOutcome {
    pub fn metrics(&self) -> Option<&LeadTimeMetrics> {
        match self {
            MetricsOutcome::Complete(metrics) | MetricsOutcome::Partial(metrics, _) => Some(metrics),
            MetricsOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&MetricsError> {
        match self {
            MetricsOutcome::Complete(_) => None,
            MetricsOutcome::Partial(_, err) | MetricsOutcome::Failed(err) => Some(err),
        }
    }

    /// Splits the outcome into the (partial) metrics and the joined error.
    pub fn into_parts(self) -> (Option<LeadTimeMetrics>, Option<MetricsError>) {
        match self {
            MetricsOutcome::Complete(metrics) => (Some(metrics), None),
            MetricsOutcome::Partial(metrics, err) => (Some(metrics), Some(err)),
            MetricsOutcome::Failed(err) => (None, Some(err)),
        }
    }

    /// Treats any failure, even a partial one, as an error.
    pub fn into_result(self) -> Result<LeadTimeMetrics, MetricsError> {
        match self {
            MetricsOutcome::Complete(metrics) => Ok(metrics),
            MetricsOutcome::Partial(_, err) | MetricsOutcome::Failed(err) => Err(err),
        }
    }
}

/// Samples gathered by the fan-in stage.
#[derive(Default)]
struct Collected {
    samples: BTreeMap<String, Vec<LeadTimeSample>>,
    errors: Vec<MetricsError>,
    succeeded: usize,
}

#[derive(Clone)]
pub struct MetricsQuerier {
    source: Arc<dyn PullRequestSource>,
    config: EngineConfig,
}

impl MetricsQuerier {
    pub fn new(source: Arc<dyn PullRequestSource>, config: EngineConfig) -> Self {
        Self { source, config }
    }

    /// Current rate-limit window of the underlying API.
    pub async fn get_rate_limit(&self) -> anyhow::Result<RateLimitInfo> {
        self.source.rate_limit().await
    }

    /// Computes lead-time metrics for `repos` over pull requests merged since `since`.
    ///
    /// Repositories fail independently: the outcome is [`MetricsOutcome::Partial`]
    /// as long as at least one of them produced samples. Cancelling `cancel` stops
    /// the run and keeps whatever completed repositories already returned.
    pub async fn fetch_lead_time_metrics(
        &self,
        repos: &[String],
        since: DateTime<Utc>,
        on_progress: Option<&ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> MetricsOutcome {
        let now = Utc::now();
        if repos.is_empty() {
            return MetricsOutcome::Complete(LeadTimeMetrics::empty(since, now));
        }

        let (targets, mut errors) = parse_repositories(repos);
        let collected = self.collect_samples(&targets, since, on_progress, cancel).await;
        errors.extend(collected.errors);

        tracing::info!(
            repos = targets.len(),
            succeeded = collected.succeeded,
            failed = errors.len(),
            "Collected lead-time samples"
        );

        if collected.succeeded == 0 {
            record_cancellation(&mut errors, cancel);
            return match JoinedError::join(errors) {
                Some(err) => MetricsOutcome::Failed(err),
                // Each target reports a result unless cancelled, so nothing was requested.
                None => MetricsOutcome::Complete(LeadTimeMetrics::empty(since, now)),
            };
        }

        let mut metrics =
            LeadTimeMetrics::from_samples(&collected.samples, since, now, self.config.trend_days);

        if !cancel.is_cancelled() {
            self.run_analyzers(&mut metrics, targets, now, cancel).await;
        }
        record_cancellation(&mut errors, cancel);

        match JoinedError::join(errors) {
            None => MetricsOutcome::Complete(metrics),
            Some(err) => MetricsOutcome::Partial(metrics, err),
        }
    }

    /// Runs one sampler per repository on the outer pool and collects the results.
    async fn collect_samples(
        &self,
        targets: &[RepoId],
        since: DateTime<Utc>,
        on_progress: Option<&ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Collected {
        let report = |processed: usize, current: &str| {
            if let Some(on_progress) = on_progress {
                on_progress(Progress {
                    total_repos: targets.len(),
                    processed_repos: processed,
                    current_repo: current.to_string(),
                });
            }
        };
        report(0, "");

        let sampler = Arc::new(LeadTimeSampler::new(
            Arc::clone(&self.source),
            self.config.review_workers,
            self.config.max_pages,
        ));
        let worker_cancel = cancel.clone();

        let mut results = pool::spawn_pool(
            targets.to_vec(),
            self.config.repo_workers,
            cancel,
            move |repo: RepoId| {
                let sampler = Arc::clone(&sampler);
                let cancel = worker_cancel.clone();
                async move {
                    let samples = sampler.sample(&repo, since, &cancel).await;
                    (repo, samples)
                }
            },
        );

        let mut collected = Collected::default();
        let mut processed = 0;

        while let Some((repo, result)) = results.recv().await {
            processed += 1;
            match result {
                Ok(samples) => {
                    tracing::debug!(repo = %repo, samples = samples.len(), "Repository sampled");
                    collected.samples.insert(repo.to_string(), samples);
                    collected.succeeded += 1;
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::warn!(repo = %repo, "Failed to sample repository: {}", e);
                    }
                    collected.errors.push(e);
                }
            }
            report(processed, &repo.to_string());
        }

        if processed == targets.len() {
            report(processed, "");
        }

        collected
    }

    /// Fills in the stagnation and quality sections; failures become warnings.
    async fn run_analyzers(
        &self,
        metrics: &mut LeadTimeMetrics,
        repos: Vec<RepoId>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) {
        let stagnation_settings = StagnationSettings {
            threshold: self.config.stagnation_threshold,
            top_n: self.config.stagnant_top_n,
            workers: self.config.repo_workers,
            max_pages: self.config.max_pages,
        };
        let quality_settings = QualitySettings {
            top_n: self.config.quality_top_n,
            repo_workers: self.config.repo_workers,
            detail_workers: self.config.review_workers,
            max_pages: self.config.max_pages,
        };

        let (stagnant, quality) = futures::join!(
            stagnation::analyze_stagnation(
                Arc::clone(&self.source),
                repos.clone(),
                stagnation_settings,
                now,
                cancel,
            ),
            quality::analyze_quality(Arc::clone(&self.source), repos, quality_settings, cancel),
        );

        match stagnant {
            Ok(stagnant) => metrics.stagnant = Some(stagnant),
            Err(e) => metrics.warnings.push(analyzer_warning("stagnation", e)),
        }
        match quality {
            Ok(quality) => metrics.quality_issues = Some(quality),
            Err(e) => metrics.warnings.push(analyzer_warning("quality", e)),
        }
    }
}

/// Adds a cancellation error if `cancel` fired and none was reported yet.
fn record_cancellation(errors: &mut Vec<MetricsError>, cancel: &CancellationToken) {
    if cancel.is_cancelled() && !errors.iter().any(MetricsError::is_cancelled) {
        errors.push(MetricsError::Cancelled);
    }
}

fn analyzer_warning(analyzer: &'static str, source: MetricsError) -> AnalyzerWarning {
    let err = MetricsError::Analyzer {
        analyzer,
        source: Box::new(source),
    };
    tracing::warn!("{}", err);
    AnalyzerWarning {
        analyzer,
        message: err.to_string(),
    }
}

/// Parses slugs, skipping repeats, and returns the valid ones alongside parse errors.
fn parse_repositories(repos: &[String]) -> (Vec<RepoId>, Vec<MetricsError>) {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let mut errors = Vec::new();

    for raw in repos {
        match raw.parse::<RepoId>() {
            Ok(repo) => {
                if seen.insert(repo.clone()) {
                    targets.push(repo);
                }
            }
            Err(e) => errors.push(e.into()),
        }
    }

    (targets, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityIssueKind;
    use crate::testing::{closed_pr, open_pr, review, FakeRepo, FakeSource};
    use chrono::Duration;
    use std::sync::Mutex;

    fn repos(slugs: &[&str]) -> Vec<String> {
        slugs.iter().map(|s| s.to_string()).collect()
    }

    /// A repository with one merged pull request per lead time, all merged an hour ago.
    fn merged_repo(lead_times_hours: &[i64]) -> FakeRepo {
        let merged_at = Utc::now() - Duration::hours(1);
        let closed = lead_times_hours
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let created_at = merged_at - Duration::hours(*h);
                closed_pr(i as u64 + 1, "main", created_at, Some(merged_at))
            })
            .collect();
        FakeRepo::new("main").with_closed(closed)
    }

    fn querier(source: FakeSource) -> (MetricsQuerier, Arc<FakeSource>) {
        let source = Arc::new(source);
        let config = EngineConfig {
            repo_workers: 2,
            review_workers: 2,
            ..EngineConfig::default()
        };
        (MetricsQuerier::new(source.clone(), config), source)
    }

    fn since() -> DateTime<Utc> {
        Utc::now() - Duration::days(30)
    }

    #[tokio::test]
    async fn test_two_repositories_scenario() {
        let (querier, _) = querier(
            FakeSource::default()
                .with_repo("owner/repo1", merged_repo(&[1, 3]))
                .with_repo("owner/repo2", merged_repo(&[2])),
        );

        let outcome = querier
            .fetch_lead_time_metrics(
                &repos(&["owner/repo1", "owner/repo2"]),
                since(),
                None,
                &CancellationToken::new(),
            )
            .await;

        let metrics = outcome.into_result().unwrap();
        assert_eq!(metrics.overall.average, Duration::hours(2));
        assert_eq!(metrics.overall.median, Duration::hours(2));
        assert_eq!(metrics.overall.count, 3);

        let repo1 = metrics.by_repository["owner/repo1"];
        assert_eq!(repo1.average, Duration::hours(2));
        assert_eq!(repo1.median, Duration::hours(2));
        assert_eq!(repo1.count, 2);

        assert!(metrics.stagnant.is_some());
        assert!(metrics.quality_issues.is_some());
        assert!(metrics.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successful_repositories() {
        let (querier, _) = querier(
            FakeSource::default()
                .with_repo("owner/a", merged_repo(&[1, 2]))
                .with_repo("owner/b", FakeRepo::failing()),
        );

        let outcome = querier
            .fetch_lead_time_metrics(
                &repos(&["owner/a", "owner/b"]),
                since(),
                None,
                &CancellationToken::new(),
            )
            .await;

        let (metrics, err) = outcome.into_parts();
        let metrics = metrics.unwrap();
        let err = err.unwrap();
        assert_eq!(metrics.overall.count, 2);
        assert!(metrics.by_repository.contains_key("owner/a"));
        assert!(!metrics.by_repository.contains_key("owner/b"));
        assert!(err.to_string().contains("owner/b"));
    }

    #[tokio::test]
    async fn test_all_failures_yield_no_metrics() {
        let (querier, _) = querier(FakeSource::default().with_repo("owner/b", FakeRepo::failing()));

        let outcome = querier
            .fetch_lead_time_metrics(
                &repos(&["owner/b", "not-a-slug"]),
                since(),
                None,
                &CancellationToken::new(),
            )
            .await;

        let MetricsOutcome::Failed(MetricsError::Joined(joined)) = outcome else {
            panic!("expected a joined failure");
        };
        assert_eq!(joined.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let (querier, source) = querier(FakeSource::default());

        let outcome = querier
            .fetch_lead_time_metrics(&[], since(), None, &CancellationToken::new())
            .await;

        let metrics = outcome.into_result().unwrap();
        assert_eq!(metrics.overall.count, 0);
        assert_eq!(metrics.day_of_week.days.len(), 7);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_slug_does_not_stop_others() {
        let (querier, _) = querier(FakeSource::default().with_repo("owner/a", merged_repo(&[4])));

        let outcome = querier
            .fetch_lead_time_metrics(
                &repos(&["owner/a", "owner/"]),
                since(),
                None,
                &CancellationToken::new(),
            )
            .await;

        let MetricsOutcome::Partial(metrics, err) = outcome else {
            panic!("expected partial outcome");
        };
        assert_eq!(metrics.overall.count, 1);
        assert!(err.to_string().contains("owner/"));
    }

    #[tokio::test]
    async fn test_progress_reports_every_repository() {
        let (querier, _) = querier(
            FakeSource::default()
                .with_repo("owner/a", merged_repo(&[1]))
                .with_repo("owner/b", merged_repo(&[2]))
                .with_repo("owner/c", FakeRepo::failing()),
        );
        let events = Mutex::new(Vec::new());
        let record: &ProgressFn<'_> = &|p: Progress| events.lock().unwrap().push(p);

        querier
            .fetch_lead_time_metrics(
                &repos(&["owner/a", "owner/b", "owner/c"]),
                since(),
                Some(record),
                &CancellationToken::new(),
            )
            .await;

        let events = events.into_inner().unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].processed_repos, 0);
        let processed: Vec<usize> = events.iter().map(|p| p.processed_repos).collect();
        assert_eq!(processed, vec![0, 1, 2, 3, 3]);
        assert!(events.iter().all(|p| p.total_repos == 3));

        let mut seen: Vec<String> = events[1..4].iter().map(|p| p.current_repo.clone()).collect();
        seen.sort();
        assert_eq!(seen, vec!["owner/a", "owner/b", "owner/c"]);
        assert_eq!(events[4].current_repo, "");
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancellation() {
        let (querier, _) = querier(FakeSource::default().with_repo("owner/a", merged_repo(&[1])));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = querier
            .fetch_lead_time_metrics(&repos(&["owner/a"]), since(), None, &cancel)
            .await;

        assert!(outcome.metrics().is_none());
        assert!(outcome.error().unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_mid_sampling_keeps_finished_repositories() {
        let cancel = CancellationToken::new();
        let (querier, _) = querier(
            FakeSource::default()
                .with_repo("owner/a", merged_repo(&[2]))
                .with_repo(
                    "owner/b",
                    merged_repo(&[1]).with_closed_blocked_until(cancel.clone()),
                ),
        );
        let stop_after_a: &ProgressFn<'_> = &|p: Progress| {
            if p.current_repo == "owner/a" {
                cancel.cancel();
            }
        };

        let outcome = querier
            .fetch_lead_time_metrics(
                &repos(&["owner/a", "owner/b"]),
                since(),
                Some(stop_after_a),
                &cancel,
            )
            .await;

        let MetricsOutcome::Partial(metrics, err) = outcome else {
            panic!("expected partial outcome");
        };
        assert!(err.is_cancelled());
        assert_eq!(metrics.overall.count, 1);
        assert_eq!(metrics.overall.average, Duration::hours(2));
        assert!(metrics.by_repository.contains_key("owner/a"));
        assert!(!metrics.by_repository.contains_key("owner/b"));
        assert!(metrics.stagnant.is_none());
        assert!(metrics.quality_issues.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_during_analyzers_is_reported() {
        let cancel = CancellationToken::new();
        let (querier, _) = querier(FakeSource::default().with_repo(
            "owner/a",
            merged_repo(&[1])
                .with_open(vec![open_pr(1, Utc::now() - Duration::hours(1))])
                .with_open_cancelling(cancel.clone()),
        ));

        let outcome = querier
            .fetch_lead_time_metrics(&repos(&["owner/a"]), since(), None, &cancel)
            .await;

        let MetricsOutcome::Partial(metrics, err) = outcome else {
            panic!("expected partial outcome");
        };
        assert!(err.is_cancelled());
        assert_eq!(metrics.overall.count, 1);
    }

    #[tokio::test]
    async fn test_zero_worker_counts_still_sample() {
        let merged_at = Utc::now() - Duration::hours(1);
        let created_at = merged_at - Duration::hours(4);
        let repo = FakeRepo::new("main")
            .with_closed(vec![closed_pr(1, "main", created_at, Some(merged_at))])
            .with_reviews(1, vec![review(true, Some(created_at + Duration::hours(1)))]);
        let source = Arc::new(FakeSource::default().with_repo("owner/a", repo));
        let config = EngineConfig {
            repo_workers: 0,
            review_workers: 0,
            ..EngineConfig::default()
        };
        let querier = MetricsQuerier::new(source, config);

        let metrics = querier
            .fetch_lead_time_metrics(&repos(&["owner/a"]), since(), None, &CancellationToken::new())
            .await
            .into_result()
            .unwrap();

        assert_eq!(metrics.overall.count, 1);
        assert_eq!(metrics.review_phases.count, 1);
        assert!(metrics.stagnant.is_some());
    }

    #[tokio::test]
    async fn test_phase_breakdown_uses_reviews() {
        let merged_at = Utc::now() - Duration::hours(1);
        let created_at = merged_at - Duration::hours(10);
        let repo = FakeRepo::new("main")
            .with_closed(vec![closed_pr(1, "main", created_at, Some(merged_at))])
            .with_reviews(
                1,
                vec![
                    review(false, Some(created_at + Duration::hours(2))),
                    review(true, Some(created_at + Duration::hours(6))),
                ],
            );
        let (querier, _) = querier(FakeSource::default().with_repo("owner/a", repo));

        let metrics = querier
            .fetch_lead_time_metrics(&repos(&["owner/a"]), since(), None, &CancellationToken::new())
            .await
            .into_result()
            .unwrap();

        assert_eq!(metrics.review_phases.count, 1);
        assert_eq!(metrics.review_phases.time_to_first_review, Duration::hours(2));
        assert_eq!(metrics.review_phases.time_to_approval, Duration::hours(4));
        assert_eq!(metrics.review_phases.time_to_merge, Duration::hours(4));
        assert_eq!(metrics.review_phases_by_repository["owner/a"].count, 1);
    }

    #[tokio::test]
    async fn test_analyzer_failure_becomes_warning() {
        let now = Utc::now();
        let mut bad = open_pr(9, now - Duration::hours(1));
        bad.body = None;
        let (querier, _) = querier(
            FakeSource::default()
                .with_repo("owner/a", merged_repo(&[1]))
                .with_repo("owner/b", merged_repo(&[1]).with_open(vec![bad]))
                .with_repo("owner/c", merged_repo(&[1]).with_failing_open()),
        );

        let metrics = querier
            .fetch_lead_time_metrics(
                &repos(&["owner/a", "owner/b", "owner/c"]),
                since(),
                None,
                &CancellationToken::new(),
            )
            .await
            .into_result()
            .unwrap();

        assert_eq!(metrics.overall.count, 3);
        assert!(metrics.stagnant.is_none());
        assert!(metrics.quality_issues.is_none());
        let analyzers: Vec<&str> = metrics.warnings.iter().map(|w| w.analyzer).collect();
        assert_eq!(analyzers, vec!["stagnation", "quality"]);
        assert!(metrics.warnings[0].message.contains("owner/c"));
    }

    #[tokio::test]
    async fn test_quality_findings_are_reported() {
        let now = Utc::now();
        let mut pr = open_pr(3, now - Duration::hours(1));
        pr.additions = Some(600);
        pr.deletions = Some(0);
        pr.body = Some(String::new());
        pr.commits = Some(20);
        let (querier, _) = querier(
            FakeSource::default().with_repo("owner/a", merged_repo(&[1]).with_open(vec![pr])),
        );

        let metrics = querier
            .fetch_lead_time_metrics(&repos(&["owner/a"]), since(), None, &CancellationToken::new())
            .await
            .into_result()
            .unwrap();

        let quality = metrics.quality_issues.unwrap();
        let found: Vec<QualityIssueKind> = quality.issues.iter().map(|i| i.kind).collect();
        assert_eq!(found.len(), 3);
        assert_eq!(found[2], QualityIssueKind::ManyCommits);
        assert_eq!(metrics.stagnant.unwrap().total_count, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_passes_through() {
        let (querier, _) = querier(FakeSource::default());
        let info = querier.get_rate_limit().await.unwrap();
        assert_eq!(info.limit, 5000);
        assert_eq!(info.remaining, 4999);
    }
}
