//! In-memory view of the cluster's outstanding diagnostics requests.
//!
//! Each node caches the requests table here; the catalog stays
//! authoritative and divergence is bounded by one poll interval plus
//! gossip latency. A single coarse mutex (owned by the registry) guards
//! the whole state: the hot-path scan is O(|pending|) and |pending| stays
//! tiny, so finer locking buys nothing. The mutex must never be held
//! across catalog statements or gossip broadcasts.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::request::{Request, RequestId};
use crate::time::WallTime;

pub(crate) struct IndexState {
    /// Requests waiting for a matching execution. Conditional requests
    /// stay here until satisfied or expired; they never move to `ongoing`.
    pending: HashMap<RequestId, Request>,
    /// Unconditional requests this node is in the process of servicing.
    ongoing: HashMap<RequestId, Request>,
    /// Bumped on every local mutation a concurrent poll could lose. Polls
    /// snapshot it before reading the catalog and retry on mismatch.
    epoch: u64,
    rng: StdRng,
}

impl IndexState {
    pub fn new(seed: u64) -> Self {
        Self {
            pending: HashMap::new(),
            ongoing: HashMap::new(),
            epoch: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Inserts into pending unless the id is already known. Never
    /// overwrites.
    pub fn add_if_absent(&mut self, id: RequestId, req: Request, now: WallTime) {
        if self.find(id, now) {
            return;
        }
        self.pending.insert(id, req);
    }

    /// Whether the id is known to this node. An expired pending entry is
    /// pruned on the way out but still reported as known: callers use the
    /// answer only to decide whether a catalog re-read is needed, so true
    /// does not imply the entry is still live.
    pub fn find(&mut self, id: RequestId, now: WallTime) -> bool {
        if let Some(req) = self.pending.get(&id) {
            if req.is_expired(now) {
                self.pending.remove(&id);
            }
            return true;
        }
        self.ongoing.contains_key(&id)
    }

    pub fn cancel(&mut self, id: RequestId) {
        self.pending.remove(&id);
        self.ongoing.remove(&id);
    }

    /// Hot-path match. Returns the request to trace under, or `None`.
    ///
    /// An unconditional match moves pending -> ongoing before the sampling
    /// roll, so an unsampled roll still consumes this node's one
    /// admission. Conditional matches stay pending; the completion writer
    /// resolves races between their executions at commit time.
    pub fn match_and_admit(
        &mut self,
        fingerprint: &str,
        now: WallTime,
    ) -> Option<(RequestId, Request)> {
        if self.pending.is_empty() {
            return None;
        }

        let (id, req) = self
            .pending
            .iter()
            .find(|(_, req)| req.fingerprint == fingerprint)
            .map(|(id, req)| (*id, req.clone()))?;

        if req.is_expired(now) {
            self.pending.remove(&id);
            return None;
        }

        if !req.is_conditional() {
            self.pending.remove(&id);
            self.ongoing.insert(id, req.clone());
        }

        if req.sampling_probability == 0.0 || self.rng.gen::<f64>() < req.sampling_probability {
            return Some((id, req));
        }
        None
    }

    /// Releases an admission that will not reach the completion writer.
    pub fn remove_ongoing(&mut self, id: RequestId, req: &Request, now: WallTime) {
        if req.is_conditional() {
            if req.is_expired(now) {
                self.pending.remove(&id);
            }
        } else {
            self.ongoing.remove(&id);
        }
    }

    /// Drops pending entries the latest poll no longer reports, and any
    /// that have expired. Ongoing entries belong to the execution path
    /// that admitted them and are left alone.
    pub fn retain_polled(&mut self, seen: &HashSet<RequestId>, now: WallTime) {
        self.pending
            .retain(|id, req| seen.contains(id) && !req.is_expired(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: WallTime = WallTime(1_000_000);

    fn unconditional(fingerprint: &str) -> Request {
        Request {
            fingerprint: fingerprint.to_string(),
            sampling_probability: 0.0,
            min_execution_latency: Duration::ZERO,
            expires_at: None,
        }
    }

    fn conditional(fingerprint: &str) -> Request {
        Request {
            min_execution_latency: Duration::from_millis(100),
            ..unconditional(fingerprint)
        }
    }

    fn expiring(fingerprint: &str, at: WallTime) -> Request {
        Request {
            expires_at: Some(at),
            ..unconditional(fingerprint)
        }
    }

    #[test]
    fn add_if_absent_does_not_overwrite() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), unconditional("a"), NOW);
        index.add_if_absent(RequestId(1), unconditional("b"), NOW);

        let (_, req) = index.match_and_admit("a", NOW).expect("first request wins");
        assert_eq!(req.fingerprint, "a");
    }

    #[test]
    fn find_prunes_expired_pending_but_still_reports_known() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), expiring("a", WallTime(10)), NOW);

        assert!(index.find(RequestId(1), NOW));
        // The pruned entry can no longer match.
        assert!(index.match_and_admit("a", NOW).is_none());
        assert!(!index.find(RequestId(1), NOW));
    }

    #[test]
    fn cancel_clears_both_maps() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), unconditional("a"), NOW);
        index.match_and_admit("a", NOW).expect("admitted");
        index.cancel(RequestId(1));
        assert!(!index.find(RequestId(1), NOW));
    }

    #[test]
    fn no_match_for_unknown_fingerprint() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), unconditional("a"), NOW);
        assert!(index.match_and_admit("b", NOW).is_none());
    }

    #[test]
    fn unconditional_match_admits_once_per_node() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), unconditional("a"), NOW);

        let (id, req) = index.match_and_admit("a", NOW).expect("first execution");
        assert_eq!(id, RequestId(1));
        // The admission is consumed until completion or expiry prunes it.
        assert!(index.match_and_admit("a", NOW).is_none());
        // Releasing it does not resurrect the pending entry.
        index.remove_ongoing(id, &req, NOW);
        assert!(index.match_and_admit("a", NOW).is_none());
        assert!(!index.find(id, NOW));
    }

    #[test]
    fn conditional_match_stays_pending() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), conditional("a"), NOW);

        assert!(index.match_and_admit("a", NOW).is_some());
        assert!(index.match_and_admit("a", NOW).is_some());
    }

    #[test]
    fn expired_match_is_pruned_and_rejected() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), expiring("a", WallTime(10)), NOW);

        assert!(index.match_and_admit("a", NOW).is_none());
        assert!(!index.find(RequestId(1), NOW));
    }

    #[test]
    fn unsampled_roll_still_consumes_the_admission() {
        let mut index = IndexState::new(0);
        // A probability this small never samples, regardless of seed.
        let req = Request {
            sampling_probability: 1e-12,
            ..unconditional("a")
        };
        index.add_if_absent(RequestId(1), req, NOW);

        assert!(index.match_and_admit("a", NOW).is_none());
        // The entry moved to ongoing before the roll.
        assert!(index.find(RequestId(1), NOW));
        assert!(index.match_and_admit("a", NOW).is_none());
    }

    #[test]
    fn certain_sampling_always_collects() {
        let mut index = IndexState::new(0);
        let req = Request {
            sampling_probability: 1.0,
            ..conditional("a")
        };
        index.add_if_absent(RequestId(1), req, NOW);

        for _ in 0..64 {
            assert!(index.match_and_admit("a", NOW).is_some());
        }
    }

    #[test]
    fn remove_ongoing_prunes_expired_conditional() {
        let mut index = IndexState::new(0);
        let req = Request {
            min_execution_latency: Duration::from_millis(100),
            ..expiring("a", WallTime(10))
        };
        index.add_if_absent(RequestId(1), req.clone(), WallTime(5));

        // Not yet expired: stays pending.
        index.remove_ongoing(RequestId(1), &req, WallTime(8));
        assert!(index.find(RequestId(1), WallTime(8)));

        index.remove_ongoing(RequestId(1), &req, NOW);
        assert!(!index.find(RequestId(1), NOW));
    }

    #[test]
    fn retain_polled_drops_absent_and_expired_but_not_ongoing() {
        let mut index = IndexState::new(0);
        index.add_if_absent(RequestId(1), unconditional("gone"), NOW);
        index.add_if_absent(RequestId(2), expiring("expired", WallTime(10)), NOW);
        index.add_if_absent(RequestId(3), unconditional("kept"), NOW);
        index.add_if_absent(RequestId(4), unconditional("admitted"), NOW);
        index.match_and_admit("admitted", NOW).expect("admitted");

        let seen: HashSet<RequestId> =
            [RequestId(2), RequestId(3)].into_iter().collect();
        index.retain_polled(&seen, NOW);

        assert!(!index.find(RequestId(1), NOW));
        assert!(!index.find(RequestId(2), NOW));
        assert!(index.find(RequestId(3), NOW));
        assert!(index.find(RequestId(4), NOW));
    }

    #[test]
    fn bump_epoch_is_monotonic() {
        let mut index = IndexState::new(0);
        assert_eq!(index.epoch(), 0);
        assert_eq!(index.bump_epoch(), 1);
        assert_eq!(index.bump_epoch(), 2);
    }
}
