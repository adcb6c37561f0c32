//! Call contract for the external path-computation engine.
//!
//! The graph search itself is an external collaborator; the orchestrator
//! only depends on this trait. Implementations receive the flow, the path
//! pairs whose bandwidth may be reused (reroute), the path pairs to avoid
//! (protected-path diversity), and an ordered list of strategies to try.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{Flow, PathPair};

/// Strategy used to rank candidate paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathStrategy {
    /// Minimize administrative cost.
    Cost,
    /// Minimize end-to-end latency.
    Latency,
    /// Maximize residual bandwidth.
    MaxBandwidth,
}

impl std::fmt::Display for PathStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cost => write!(f, "COST"),
            Self::Latency => write!(f, "LATENCY"),
            Self::MaxBandwidth => write!(f, "MAX_BANDWIDTH"),
        }
    }
}

/// Constraints passed to the resolver.
#[derive(Debug, Clone, Default)]
pub struct PathConstraints {
    /// Path pairs whose bandwidth the new path may reuse.
    pub reuse: Vec<PathPair>,
    /// Path pairs whose segments the new path must avoid.
    pub avoid: Vec<PathPair>,
}

/// A successfully resolved candidate path pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Forward and reverse paths.
    pub paths: PathPair,
    /// The strategy that produced the result.
    pub strategy: PathStrategy,
}

/// Errors the resolver can return.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No path satisfies the constraints. Terminal.
    #[error("no route for flow: {message}")]
    Unroutable {
        /// Description of why routing failed.
        message: String,
    },

    /// Transient failure; the whole path search may be retried.
    #[error("path computation temporarily unavailable: {message}")]
    Recoverable {
        /// Description of the transient fault.
        message: String,
    },
}

impl From<ResolveError> for crate::error::Error {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Unroutable { message } => Self::Unroutable { message },
            ResolveError::Recoverable { message } => Self::Recoverable { message },
        }
    }
}

/// Adapter to the external path-computation engine.
#[async_trait]
pub trait PathResolver: Send + Sync {
    /// Resolves a candidate path pair for the flow.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Unroutable`] when no path exists and
    /// [`ResolveError::Recoverable`] on transient engine faults.
    async fn resolve(
        &self,
        flow: &Flow,
        constraints: &PathConstraints,
        strategies: &[PathStrategy],
    ) -> std::result::Result<ResolvedPath, ResolveError>;
}
