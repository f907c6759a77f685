//! Error types for the lead-time metrics engine.
//!
//! Failures of independent repository tasks are collected rather than
//! short-circuited, then folded into a single [`JoinedError`] so callers see
//! every failure while still receiving whatever succeeded.

use crate::types::{ParseRepoIdError, RepoId};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// A configured repository slug did not parse.
    #[error(transparent)]
    InvalidSlug(#[from] ParseRepoIdError),

    /// A remote call for one repository failed.
    #[error("failed to fetch {repo}: {source:#}")]
    Fetch {
        repo: RepoId,
        #[source]
        source: anyhow::Error,
    },

    /// The run was cancelled before it could finish.
    #[error("operation cancelled")]
    Cancelled,

    /// A secondary analyzer (stagnation, quality) failed as a whole.
    #[error("{analyzer} analysis failed: {source}")]
    Analyzer {
        analyzer: &'static str,
        #[source]
        source: Box<MetricsError>,
    },

    #[error(transparent)]
    Joined(JoinedError),
}

impl MetricsError {
    pub fn fetch(repo: &RepoId, source: anyhow::Error) -> Self {
        MetricsError::Fetch {
            repo: repo.clone(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            MetricsError::Cancelled => true,
            MetricsError::Analyzer { source, .. } => source.is_cancelled(),
            MetricsError::Joined(joined) => joined.is_cancelled(),
            _ => false,
        }
    }
}

/// Several independent failures reported as one error, one per line.
#[derive(Debug, Default)]
pub struct JoinedError {
    errors: Vec<MetricsError>,
}

impl JoinedError {
    pub fn errors(&self) -> &[MetricsError] {
        &self.errors
    }

    pub fn is_cancelled(&self) -> bool {
        self.errors.iter().any(MetricsError::is_cancelled)
    }

    /// Folds a list of failures into a single error, or `None` if the list is empty.
    pub fn join(errors: Vec<MetricsError>) -> Option<MetricsError> {
        if errors.is_empty() {
            None
        } else {
            Some(MetricsError::Joined(JoinedError { errors }))
        }
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for JoinedError {}
