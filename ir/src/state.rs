use core::fmt;

bitflags::bitflags! {
    /// The stages a graph has gone through.
    ///
    /// Stage flags are only ever added. Phases consult them to reject being run on a graph in
    /// a shape they cannot handle, e.g. loop duplication after value proxies were removed.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct StageFlags: u16 {
        const CONVERT_DEOPT_TO_GUARD = 1 << 0;
        const HIGH_TIER_LOWERING = 1 << 1;
        const LOOP_PREDICATION = 1 << 2;
        const GUARD_MOVEMENT = 1 << 3;
        /// No further loop-limit (overflow) guards may be created
        const LOOP_OVERFLOWS_CHECKED = 1 << 4;
        const SAFEPOINT_ELIMINATION = 1 << 5;
        const VALUE_PROXY_REMOVAL = 1 << 6;
        /// Frame states have been assigned to fixed nodes
        const FSA = 1 << 7;
    }
}

/// Where guards may live in the graph
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GuardsStage {
    /// Guards may float, anchored to a begin node
    #[default]
    FloatingGuards,
    /// Guards have been lowered to fixed control flow
    FixedDeopts,
    /// Frame states have been assigned; no deoptimization points may be added
    AfterFsa,
}

impl GuardsStage {
    #[inline(always)]
    pub const fn allows_floating_guards(&self) -> bool {
        matches!(self, Self::FloatingGuards)
    }
}

/// The compilation stage of a graph
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GraphState {
    stage_flags: StageFlags,
    guards_stage: GuardsStage,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub const fn stage_flags(&self) -> StageFlags {
        self.stage_flags
    }

    #[inline(always)]
    pub const fn guards_stage(&self) -> GuardsStage {
        self.guards_stage
    }

    #[inline]
    pub fn is_after_stage(&self, flag: StageFlags) -> bool {
        self.stage_flags.contains(flag)
    }

    #[inline]
    pub fn add_stage_flag(&mut self, flag: StageFlags) {
        self.stage_flags.insert(flag);
    }

    /// Advance the guards stage. Moving backwards is a bug in the caller.
    pub fn set_guards_stage(&mut self, stage: GuardsStage) {
        assert!(
            stage >= self.guards_stage,
            "cannot move guards stage from {:?} to {stage:?}",
            self.guards_stage
        );
        self.guards_stage = stage;
    }

    #[inline]
    pub fn allows_floating_guards(&self) -> bool {
        self.guards_stage.allows_floating_guards()
    }

    /// Returns true if new loop-limit guards may still be added to the graph
    #[inline]
    pub fn allows_overflow_guards(&self) -> bool {
        self.allows_floating_guards() && !self.is_after_stage(StageFlags::LOOP_OVERFLOWS_CHECKED)
    }

    /// Returns true if loops may still be duplicated
    #[inline]
    pub fn allows_loop_duplication(&self) -> bool {
        !self.stage_flags.intersects(StageFlags::VALUE_PROXY_REMOVAL | StageFlags::FSA)
    }
}

/// Why a phase cannot be applied to a graph in its current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotApplicable {
    /// The phase must run before the graph reaches the given stage
    AfterStage(StageFlags),
    /// The phase already ran, and may not be repeated
    AlreadyApplied(StageFlags),
    /// The phase requires a guards stage the graph has already left
    GuardsStage {
        required: GuardsStage,
        actual: GuardsStage,
    },
}

impl NotApplicable {
    /// Not applicable if `flag` has already been applied to the graph
    pub fn if_applied(flag: StageFlags, state: &GraphState) -> Option<Self> {
        state.is_after_stage(flag).then_some(Self::AlreadyApplied(flag))
    }

    /// Not applicable unless the graph has not yet reached any of `flags`
    pub fn unless_run_before(flags: StageFlags, state: &GraphState) -> Option<Self> {
        let reached = state.stage_flags() & flags;
        (!reached.is_empty()).then_some(Self::AfterStage(reached))
    }

    /// Not applicable unless guards may still float
    pub fn unless_floating_guards(state: &GraphState) -> Option<Self> {
        (!state.allows_floating_guards()).then_some(Self::GuardsStage {
            required: GuardsStage::FloatingGuards,
            actual: state.guards_stage(),
        })
    }

    /// The first reason found, if any
    pub fn if_any(reasons: impl IntoIterator<Item = Option<Self>>) -> Option<Self> {
        reasons.into_iter().flatten().next()
    }
}

impl fmt::Display for NotApplicable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AfterStage(flags) => write!(f, "graph is already past stage {flags:?}"),
            Self::AlreadyApplied(flags) => write!(f, "{flags:?} was already applied"),
            Self::GuardsStage { required, actual } => {
                write!(f, "requires guards stage {required:?}, but graph is at {actual:?}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplication_is_forbidden_after_proxy_removal() {
        let mut state = GraphState::new();
        assert!(state.allows_loop_duplication());
        state.add_stage_flag(StageFlags::VALUE_PROXY_REMOVAL);
        assert!(!state.allows_loop_duplication());
        assert_eq!(
            NotApplicable::unless_run_before(
                StageFlags::VALUE_PROXY_REMOVAL | StageFlags::FSA,
                &state
            ),
            Some(NotApplicable::AfterStage(StageFlags::VALUE_PROXY_REMOVAL))
        );
    }

    #[test]
    fn overflow_guards_need_floating_guards() {
        let mut state = GraphState::new();
        assert!(state.allows_overflow_guards());
        state.set_guards_stage(GuardsStage::FixedDeopts);
        assert!(!state.allows_overflow_guards());
        assert!(NotApplicable::unless_floating_guards(&state).is_some());
    }
}
