pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod github;
pub mod metrics;
pub mod pool;
pub mod quality;
pub mod querier;
pub mod stagnation;
pub mod types;

#[cfg(test)]
mod testing;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use cache::RateLimitCache;
use chrono::Utc;
use config::AppConfig;
use github::{PullRequestSource, RateLimitInfo};
use metrics::LeadTimeMetrics;
use querier::{MetricsOutcome, MetricsQuerier, Progress, ProgressFn};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Body of the lead-time endpoint: whatever was computed plus every failure.
#[derive(Serialize)]
pub struct LeadTimeResponse {
    pub metrics: Option<LeadTimeMetrics>,
    pub errors: Vec<String>,
}

/// Shared application state accessible to all request handlers.
pub struct AppState {
    /// Entry point of the lead-time metrics engine.
    pub querier: MetricsQuerier,
    pub rate_limit: RateLimitCache,
    /// Application configuration loaded from environment variables.
    pub config: AppConfig,
    /// Cancelled on shutdown; every engine run uses a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: AppConfig, source: Arc<dyn PullRequestSource>) -> Self {
        let querier = MetricsQuerier::new(source, config.engine_config());
        let rate_limit = RateLimitCache::new(config.rate_limit_cache_ttl());
        Self {
            querier,
            rate_limit,
            config,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/repos", get(get_repos))
        .route("/api/metrics/lead-time", get(get_lead_time_metrics))
        .route("/api/rate-limit", get(get_rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "leadtime",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_repos(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.config.repositories.clone())
}

pub async fn get_lead_time_metrics(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<LeadTimeResponse>) {
    let since = Utc::now() - state.config.calculation_period();
    // Dropping the request (client went away) cancels the run.
    let cancel = state.shutdown.child_token();
    let _guard = cancel.clone().drop_guard();

    let log_progress: &ProgressFn<'_> = &|p: Progress| {
        tracing::debug!(
            processed = p.processed_repos,
            total = p.total_repos,
            repo = %p.current_repo,
            "Lead-time progress"
        );
    };

    let outcome = state
        .querier
        .fetch_lead_time_metrics(&state.config.repositories, since, Some(log_progress), &cancel)
        .await;

    let status = match &outcome {
        MetricsOutcome::Failed(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::OK,
    };
    let (metrics, error) = outcome.into_parts();
    let errors = match error {
        Some(err) => {
            tracing::error!("Lead-time metrics finished with errors: {}", err);
            err.to_string().lines().map(str::to_string).collect()
        }
        None => Vec::new(),
    };

    (status, Json(LeadTimeResponse { metrics, errors }))
}

pub async fn get_rate_limit(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RateLimitInfo>, (StatusCode, String)> {
    match state.rate_limit.get(&state.querier).await {
        Ok(info) => Ok(Json(info)),
        Err(e) => {
            tracing::error!("Failed to fetch rate limit: {:#}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                "Failed to fetch GitHub rate limit".to_string(),
            ))
        }
    }
}
