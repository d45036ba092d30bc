//! Cluster-version gating.

/// Answers whether every node in the cluster understands a feature.
///
/// The only gated feature here is the sampling-probability column on the
/// requests table, which older nodes neither write nor read.
pub trait VersionGate: Send + Sync {
    fn is_sampling_probability_supported(&self) -> bool;
}

/// A fixed answer, for wiring and tests.
#[derive(Clone, Copy, Debug)]
pub struct StaticVersionGate(pub bool);

impl VersionGate for StaticVersionGate {
    fn is_sampling_probability_supported(&self) -> bool {
        self.0
    }
}
