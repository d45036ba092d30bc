//! Diagnostics request values.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::time::WallTime;

/// Id of a diagnostics request, assigned by the requests table on insert.
/// Always positive.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id of one completed diagnostics collection, assigned by the diagnostics
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectedId(pub i64);

impl fmt::Display for CollectedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One diagnostics request: trace a coming execution matching
/// `fingerprint`, optionally gated on execution latency and sampled by
/// probability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub fingerprint: String,
    pub sampling_probability: f64,
    /// Zero means no latency gate: the request is unconditional.
    pub min_execution_latency: Duration,
    /// `None` means the request never expires.
    pub expires_at: Option<WallTime>,
}

impl Request {
    pub fn is_expired(&self, now: WallTime) -> bool {
        matches!(self.expires_at, Some(e) if e < now)
    }

    /// Conditional requests only complete when the execution latency clears
    /// `min_execution_latency`; they stay pending until satisfied or
    /// expired.
    pub fn is_conditional(&self) -> bool {
        self.min_execution_latency > Duration::ZERO
    }
}

/// Insert-time invariants on request inputs.
pub(crate) fn validate_request(
    sampling_probability: f64,
    min_execution_latency: Duration,
) -> Result<(), Error> {
    if !(0.0..=1.0).contains(&sampling_probability) {
        return Err(Error::InvalidProbability {
            probability: sampling_probability,
        });
    }
    if sampling_probability != 0.0 && min_execution_latency.is_zero() {
        return Err(Error::ProbabilityWithoutLatency {
            probability: sampling_probability,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(min_execution_latency: Duration, expires_at: Option<WallTime>) -> Request {
        Request {
            fingerprint: "SELECT _".to_string(),
            sampling_probability: 0.0,
            min_execution_latency,
            expires_at,
        }
    }

    #[test]
    fn never_expiring_request_is_never_expired() {
        let req = request(Duration::ZERO, None);
        assert!(!req.is_expired(WallTime(u64::MAX)));
    }

    #[test]
    fn expiry_is_strict() {
        let req = request(Duration::ZERO, Some(WallTime(100)));
        assert!(!req.is_expired(WallTime(99)));
        assert!(!req.is_expired(WallTime(100)));
        assert!(req.is_expired(WallTime(101)));
    }

    #[test]
    fn latency_gate_makes_request_conditional() {
        assert!(!request(Duration::ZERO, None).is_conditional());
        assert!(request(Duration::from_millis(1), None).is_conditional());
    }

    #[test]
    fn probability_outside_unit_interval_is_rejected() {
        assert!(matches!(
            validate_request(-0.1, Duration::from_secs(1)),
            Err(Error::InvalidProbability { .. })
        ));
        assert!(matches!(
            validate_request(1.5, Duration::from_secs(1)),
            Err(Error::InvalidProbability { .. })
        ));
        assert!(matches!(
            validate_request(f64::NAN, Duration::from_secs(1)),
            Err(Error::InvalidProbability { .. })
        ));
    }

    #[test]
    fn probability_requires_latency_gate() {
        assert!(matches!(
            validate_request(0.5, Duration::ZERO),
            Err(Error::ProbabilityWithoutLatency { .. })
        ));
        assert!(validate_request(0.5, Duration::from_millis(100)).is_ok());
        assert!(validate_request(0.0, Duration::ZERO).is_ok());
    }
}
