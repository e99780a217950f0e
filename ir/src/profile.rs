use crate::{DeoptimizationReason, FxHashMap};

/// Runtime profile of the method being compiled
pub trait ProfilingInfo {
    /// The number of times compiled code for this method deoptimized with `reason`
    fn deoptimization_count(&self, reason: DeoptimizationReason) -> u32;
}

/// A fixed profile, e.g. one deserialized from a previous run or constructed by a test
#[derive(Debug, Default, Clone)]
pub struct StaticProfile {
    deopts: FxHashMap<DeoptimizationReason, u32>,
}

impl StaticProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deoptimization_count(
        &mut self,
        reason: DeoptimizationReason,
        count: u32,
    ) -> &mut Self {
        self.deopts.insert(reason, count);
        self
    }
}

impl ProfilingInfo for StaticProfile {
    fn deoptimization_count(&self, reason: DeoptimizationReason) -> u32 {
        self.deopts.get(&reason).copied().unwrap_or(0)
    }
}
