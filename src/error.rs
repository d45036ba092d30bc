use thiserror::Error;

use crate::catalog::CatalogError;
use crate::gossip::GossipError;
use crate::request::RequestId;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("expected sampling probability in range [0.0, 1.0], got {probability}")]
    InvalidProbability { probability: f64 },

    #[error("non-zero sampling probability {probability} requires a minimum execution latency")]
    ProbabilityWithoutLatency { probability: f64 },

    #[error("sampling probability is not supported until the cluster version upgrade completes")]
    SamplingProbabilityUnsupported,

    #[error("bundle chunk size must be at least {min} bytes, got {got}")]
    ChunkSizeTooSmall { got: u64, min: u64 },

    #[error(
        "a pending request for fingerprint {fingerprint:?} already exists; \
         cancel it first and try again"
    )]
    PendingRequestExists { fingerprint: String },

    #[error("no pending request found for id {id}")]
    NoPendingRequest { id: RequestId },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Gossip(#[from] GossipError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Catalog(e) => e.transience(),
            Error::Gossip(_) => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_permanent() {
        let err = Error::InvalidProbability { probability: 2.0 };
        assert!(!err.transience().is_retryable());
    }

    #[test]
    fn catalog_outages_are_retryable() {
        let err = Error::Catalog(CatalogError::Unavailable {
            op: "stmt-diag-poll",
            message: "connection refused".to_string(),
        });
        assert!(err.transience().is_retryable());
    }
}
