//! Application configuration and environment variable parsing.
//!
//! This module handles loading configuration settings from the environment (e.g., .env file).
//! It defines the `AppConfig` struct, which lists the repositories to analyze and the
//! calculation period, and the `EngineConfig` values handed to the metrics engine.

use chrono::Duration;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration as StdDuration;

/// Tuning values for the lead-time metrics engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on repositories sampled concurrently.
    pub repo_workers: usize,
    /// Upper bound on concurrent review listings per repository.
    pub review_workers: usize,
    /// Age at which an open pull request counts as stagnant.
    pub stagnation_threshold: Duration,
    pub stagnant_top_n: usize,
    pub quality_top_n: usize,
    /// Hard limit on pages fetched by any single paginated listing.
    pub max_pages: u32,
    /// Number of days in the daily trend series.
    pub trend_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_workers: 8,
            review_workers: 12,
            stagnation_threshold: Duration::hours(72),
            stagnant_top_n: 10,
            quality_top_n: 10,
            max_pages: 50,
            trend_days: 14,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Repositories to analyze.
    /// Expected format: comma-separated string of "owner/repo" pairs.
    /// Example: "facebook/react,rust-lang/rust"
    #[serde(deserialize_with = "deserialize_repositories")]
    pub repositories: Vec<String>,

    /// Number of past days whose merged pull requests are sampled.
    pub calculation_period_days: i64,

    #[serde(default = "default_repo_worker_count")]
    pub repo_worker_count: usize,

    #[serde(default = "default_review_worker_count")]
    pub review_worker_count: usize,

    #[serde(default = "default_stagnation_threshold_hours")]
    pub stagnation_threshold_hours: i64,

    #[serde(default = "default_top_n")]
    pub stagnant_top_n: usize,

    #[serde(default = "default_top_n")]
    pub quality_top_n: usize,

    /// Hard limit on the number of paginated requests per listing.
    #[serde(default = "default_max_github_api_pages")]
    pub max_github_api_pages: u32,

    #[serde(default = "default_trend_days")]
    pub trend_days: i64,

    /// Time to live for the cached rate limit in seconds.
    #[serde(default = "default_rate_limit_cache_seconds")]
    pub rate_limit_cache_seconds: u64,

    /// Optional GitHub Personal Access Token for higher rate limits.
    pub github_token: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_repo_worker_count() -> usize {
    8
}

fn default_review_worker_count() -> usize {
    12
}

fn default_stagnation_threshold_hours() -> i64 {
    72
}

fn default_top_n() -> usize {
    10
}

fn default_max_github_api_pages() -> u32 {
    50
}

fn default_trend_days() -> i64 {
    14
}

fn default_rate_limit_cache_seconds() -> u64 {
    30
}

fn default_port() -> u16 {
    3000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn calculation_period(&self) -> Duration {
        Duration::days(self.calculation_period_days)
    }

    pub fn rate_limit_cache_ttl(&self) -> StdDuration {
        StdDuration::from_secs(self.rate_limit_cache_seconds)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            repo_workers: self.repo_worker_count.max(1),
            review_workers: self.review_worker_count.max(1),
            stagnation_threshold: Duration::hours(self.stagnation_threshold_hours),
            stagnant_top_n: self.stagnant_top_n,
            quality_top_n: self.quality_top_n,
            max_pages: self.max_github_api_pages.max(1),
            trend_days: self.trend_days,
        }
    }
}

fn deserialize_repositories<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(parse_repositories(&s))
}

/// Splits a comma-separated list, trimming entries and dropping blanks and repeats.
///
/// Entries are not validated here; malformed slugs are reported by the engine.
fn parse_repositories(s: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter(|part| seen.insert(part.to_string()))
        .map(str::to_string)
        .collect()
}
