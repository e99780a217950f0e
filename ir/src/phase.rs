//! Phases, and the suites which sequence them.
//!
//! A [Phase] is a transformation of a whole [Graph]. Phases declare which graph states they
//! can be applied to; running a phase on a graph in any other state is a bug in the driver,
//! and aborts the compilation with [CompilationError::PhaseNotApplicable]. After a phase runs,
//! its driver canonicalizes the nodes it changed, advances the graph state, and optionally
//! verifies and dumps the graph.
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use crate::{
    Canonicalizer, CompilationError, FxHashMap, Graph, GraphState, NotApplicable, Options,
    ProfilingInfo, SpeculationLog, verify::verify,
};

/// Whether running a phase changed the graph
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    Changed,
    Unchanged,
}

impl PhaseStatus {
    #[inline]
    pub const fn changed_if(changed: bool) -> Self {
        if changed { Self::Changed } else { Self::Unchanged }
    }

    #[inline]
    pub const fn is_changed(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

impl core::ops::BitOr for PhaseStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::changed_if(self.is_changed() || rhs.is_changed())
    }
}

impl core::ops::BitOrAssign for PhaseStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

/// The collaborators a phase may consult while it runs
pub struct PhaseContext<'a> {
    options: &'a Options,
    speculation_log: &'a mut dyn SpeculationLog,
    profile: &'a dyn ProfilingInfo,
    canonicalizer: Canonicalizer,
    statistics: PhaseStatistics,
}

impl<'a> PhaseContext<'a> {
    pub fn new(
        options: &'a Options,
        speculation_log: &'a mut dyn SpeculationLog,
        profile: &'a dyn ProfilingInfo,
    ) -> Self {
        Self {
            options,
            speculation_log,
            profile,
            canonicalizer: Canonicalizer::default(),
            statistics: PhaseStatistics::default(),
        }
    }

    #[inline(always)]
    pub fn options(&self) -> &Options {
        self.options
    }

    /// The speculation log of the current compilation
    #[inline(always)]
    pub fn speculation_log(&mut self) -> &mut dyn SpeculationLog {
        &mut *self.speculation_log
    }

    #[inline(always)]
    pub fn profile(&self) -> &dyn ProfilingInfo {
        self.profile
    }

    #[inline(always)]
    pub fn canonicalizer(&self) -> &Canonicalizer {
        &self.canonicalizer
    }

    #[inline(always)]
    pub fn statistics(&self) -> &PhaseStatistics {
        &self.statistics
    }

    #[inline(always)]
    pub fn statistics_mut(&mut self) -> &mut PhaseStatistics {
        &mut self.statistics
    }
}

/// A transformation of a [Graph]
#[allow(unused_variables)]
pub trait Phase {
    fn name(&self) -> &'static str;

    /// Returns the reason this phase cannot be applied to a graph in `state`, if any
    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        None
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError>;

    /// Record the stage this phase completes in the graph state. Called after every
    /// successful run, whether or not the graph changed.
    fn update_graph_state(&self, state: &mut GraphState) {}

    /// Whether nodes changed by this phase should be canonicalized afterwards
    fn canonicalize_after(&self) -> bool {
        true
    }
}

impl<P: Phase + ?Sized> Phase for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        (**self).not_applicable_to(state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        (**self).run(graph, context)
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        (**self).update_graph_state(state)
    }

    fn canonicalize_after(&self) -> bool {
        (**self).canonicalize_after()
    }
}

/// Apply a single phase to `graph`: check applicability, run it, canonicalize what it
/// changed, and advance the graph state.
pub fn apply_phase<P: Phase + ?Sized>(
    phase: &mut P,
    graph: &mut Graph,
    context: &mut PhaseContext<'_>,
) -> Result<PhaseStatus, CompilationError> {
    let name = phase.name();
    if let Some(reason) = phase.not_applicable_to(graph.state()) {
        log::debug!(target: "phase-suite", "refusing to run '{name}': {reason}");
        return Err(CompilationError::PhaseNotApplicable {
            phase: name,
            reason,
        });
    }

    let outer = graph.is_tracking_changes().then(|| graph.take_changes());
    graph.track_changes();
    log::debug!(target: "phase-suite", "running '{name}' on {} nodes", graph.node_count());
    let result = phase.run(graph, context);
    let changed = graph.take_changes();
    let status = match result {
        Ok(status) => status,
        Err(err) => {
            log::debug!(target: "phase-suite", "'{name}' failed: {err}");
            return Err(err);
        }
    };

    if status.is_changed() && phase.canonicalize_after() {
        context.canonicalizer.apply(graph, changed.iter().copied());
    }
    phase.update_graph_state(graph.state_mut());
    context.statistics.record_run(name, status);
    log::debug!(target: "phase-suite", "'{name}' finished: {status:?}");

    if let Some(outer) = outer {
        graph.track_changes();
        for node in outer.into_iter().chain(changed) {
            if graph.is_alive(node) {
                graph.mark_changed(node);
            }
        }
    }

    if context.options.dump_graphs {
        log::trace!(target: "phase-suite", "graph after '{name}':\n{graph}");
    }
    if context.options.verify_graphs {
        verify(graph)?;
    }
    Ok(status)
}

/// An ordered sequence of phases, itself a phase
pub struct PhaseSuite {
    name: &'static str,
    phases: Vec<Box<dyn Phase>>,
}

impl PhaseSuite {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            phases: Vec::new(),
        }
    }

    pub fn append<P: Phase + 'static>(&mut self, phase: P) -> &mut Self {
        self.phases.push(Box::new(phase));
        self
    }

    pub fn with<P: Phase + 'static>(mut self, phase: P) -> Self {
        self.append(phase);
        self
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// The names of the phases in this suite, in order
    pub fn phase_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.phases.iter().map(|phase| phase.name())
    }

    /// Run every phase of this suite in order
    pub fn apply(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut status = PhaseStatus::Unchanged;
        for phase in self.phases.iter_mut() {
            status |= apply_phase(phase.as_mut(), graph, context)?;
        }
        Ok(status)
    }
}

impl Phase for PhaseSuite {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        self.apply(graph, context)
    }

    fn canonicalize_after(&self) -> bool {
        // Each phase of the suite has been canonicalized already
        false
    }
}

impl fmt::Debug for PhaseSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseSuite")
            .field("name", &self.name)
            .field("phases", &self.phase_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Repeats a suite of phases until none of them changes the graph
pub struct FixpointPhase {
    suite: PhaseSuite,
    max_iterations: usize,
    require_convergence: bool,
}

impl FixpointPhase {
    pub fn new(suite: PhaseSuite, max_iterations: usize) -> Self {
        Self {
            suite,
            max_iterations,
            require_convergence: false,
        }
    }

    /// Fail with [CompilationError::FixpointNotReached] if the iteration cap is reached
    pub fn require_convergence(mut self, yes: bool) -> Self {
        self.require_convergence = yes;
        self
    }
}

impl Phase for FixpointPhase {
    fn name(&self) -> &'static str {
        self.suite.name
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut status = PhaseStatus::Unchanged;
        for iteration in 0..self.max_iterations {
            if !self.suite.apply(graph, context)?.is_changed() {
                log::debug!(
                    target: "phase-suite",
                    "'{}' reached a fixed point after {} iterations",
                    self.suite.name,
                    iteration + 1
                );
                return Ok(status);
            }
            status = PhaseStatus::Changed;
        }
        if self.require_convergence {
            return Err(CompilationError::FixpointNotReached {
                phase: self.suite.name,
                iterations: self.max_iterations,
            });
        }
        log::warn!(
            target: "phase-suite",
            "'{}' did not reach a fixed point after {} iterations",
            self.suite.name,
            self.max_iterations
        );
        Ok(status)
    }

    fn canonicalize_after(&self) -> bool {
        false
    }
}

/// How often a phase ran, and how often it changed the graph
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PhaseRuns {
    pub runs: u32,
    pub changed: u32,
}

/// Counters collected while running phases
#[derive(Debug, Default, Clone)]
pub struct PhaseStatistics {
    runs: FxHashMap<&'static str, PhaseRuns>,
    counters: FxHashMap<&'static str, u64>,
}

impl PhaseStatistics {
    pub fn record_run(&mut self, phase: &'static str, status: PhaseStatus) {
        let entry = self.runs.entry(phase).or_default();
        entry.runs += 1;
        if status.is_changed() {
            entry.changed += 1;
        }
    }

    /// Add `by` to the named counter, e.g. `"loops-peeled"`
    pub fn increment(&mut self, counter: &'static str, by: u64) {
        *self.counters.entry(counter).or_default() += by;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn runs(&self, phase: &str) -> PhaseRuns {
        self.runs.get(phase).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemorySpeculationLog, MethodId, NodeKind, StageFlags, StaticProfile};

    struct MarkStage;

    impl Phase for MarkStage {
        fn name(&self) -> &'static str {
            "mark-stage"
        }

        fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
            NotApplicable::if_applied(StageFlags::HIGH_TIER_LOWERING, state)
        }

        fn run(
            &mut self,
            _graph: &mut Graph,
            _context: &mut PhaseContext<'_>,
        ) -> Result<PhaseStatus, CompilationError> {
            Ok(PhaseStatus::Unchanged)
        }

        fn update_graph_state(&self, state: &mut GraphState) {
            state.add_stage_flag(StageFlags::HIGH_TIER_LOWERING);
        }
    }

    /// Adds a dead `Add` on every run, until it has done so `limit` times
    struct AddDeadNodes {
        remaining: usize,
    }

    impl Phase for AddDeadNodes {
        fn name(&self) -> &'static str {
            "add-dead-nodes"
        }

        fn run(
            &mut self,
            graph: &mut Graph,
            _context: &mut PhaseContext<'_>,
        ) -> Result<PhaseStatus, CompilationError> {
            if self.remaining == 0 {
                return Ok(PhaseStatus::Unchanged);
            }
            self.remaining -= 1;
            let x = graph.int(1);
            let y = graph.int(2);
            graph.add(NodeKind::Add, &[x, y]);
            Ok(PhaseStatus::Changed)
        }
    }

    #[test]
    fn stage_violations_are_fatal() {
        let options = Options::default();
        let mut log = InMemorySpeculationLog::new();
        let profile = StaticProfile::new();
        let mut context = PhaseContext::new(&options, &mut log, &profile);
        let mut graph = Graph::new(MethodId(0));
        let ret = graph.add(NodeKind::Return, &[]);
        graph.set_next(graph.start(), Some(ret));

        let mut suite = PhaseSuite::new("test").with(MarkStage);
        assert_eq!(suite.apply(&mut graph, &mut context).unwrap(), PhaseStatus::Unchanged);
        assert!(graph.state().is_after_stage(StageFlags::HIGH_TIER_LOWERING));
        let err = suite.apply(&mut graph, &mut context).unwrap_err();
        assert!(matches!(err, CompilationError::PhaseNotApplicable { phase: "mark-stage", .. }));
    }

    #[test]
    fn fixpoint_stops_when_unchanged() {
        crate::init_logging();
        let options = Options::default();
        let mut log = InMemorySpeculationLog::new();
        let profile = StaticProfile::new();
        let mut context = PhaseContext::new(&options, &mut log, &profile);
        let mut graph = Graph::new(MethodId(0));
        let ret = graph.add(NodeKind::Return, &[]);
        graph.set_next(graph.start(), Some(ret));
        let baseline = graph.node_count();

        let suite = PhaseSuite::new("repeat").with(AddDeadNodes { remaining: 2 });
        let mut fixpoint = FixpointPhase::new(suite, 5);
        let status = apply_phase(&mut fixpoint, &mut graph, &mut context).unwrap();
        assert!(status.is_changed());
        assert_eq!(context.statistics().runs("add-dead-nodes"), PhaseRuns { runs: 3, changed: 2 });
        // The canonicalizer removed the dead nodes after each run
        assert_eq!(graph.node_count(), baseline);

        let suite = PhaseSuite::new("capped").with(AddDeadNodes { remaining: 10 });
        let mut capped = FixpointPhase::new(suite, 2).require_convergence(true);
        let err = apply_phase(&mut capped, &mut graph, &mut context).unwrap_err();
        assert!(matches!(err, CompilationError::FixpointNotReached { iterations: 2, .. }));
    }
}
