use alloc::vec::Vec;

use seajit_ir::{
    CompilationError, Graph, GraphState, Node, NotApplicable, Phase, PhaseContext, PhaseStatus,
    StageFlags,
};
use seajit_ir_analysis::LoopsData;

use crate::{DefaultLoopPolicies, LoopPolicies, peel};

/// A loop chosen for full unrolling, captured before it is peeled
struct Candidate {
    begin: Node,
    control: Node,
    /// The value of the exit test which leaves the loop
    exit_value: bool,
    trip_count: u64,
}

/// Replaces counted loops with a small constant trip count by that many copies of their body.
///
/// The loop is peeled once per iteration. The loop left behind would then be entered with a
/// counter which already fails the exit test, so the test is replaced with a constant, and the
/// canonicalizer removes the loop.
///
/// Only loops existing when the phase starts are considered: copies of nested loops created by
/// unrolling an outer loop are left for the next run.
pub struct LoopFullUnrollPhase<P = DefaultLoopPolicies> {
    policies: P,
}

impl LoopFullUnrollPhase {
    pub fn new() -> Self {
        Self::with_policies(DefaultLoopPolicies)
    }
}

impl Default for LoopFullUnrollPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LoopPolicies> LoopFullUnrollPhase<P> {
    pub fn with_policies(policies: P) -> Self {
        Self { policies }
    }

    fn candidates(&self, graph: &Graph, context: &PhaseContext<'_>) -> Vec<Node> {
        let mut loops = LoopsData::compute(graph);
        loops.detect_counted_loops(graph);
        loops
            .inner_first()
            .into_iter()
            .filter(|lp| self.policies.should_full_unroll(graph, &loops, *lp, context.options()))
            .map(|lp| loops.loop_ex(lp).begin())
            .collect()
    }
}

/// Check that `begin` is still a counted loop with a known trip count, whose exit test comes
/// first, so that forcing the test after peeling every iteration is sound
fn candidate(graph: &Graph, begin: Node) -> Option<Candidate> {
    let mut loops = LoopsData::compute(graph);
    loops.detect_counted_loops(graph);
    let counted = loops.loop_for_begin(begin)?.counted()?;
    if counted.is_inverted() || graph.next(begin) != Some(counted.control()) {
        return None;
    }
    if !counted.counter_never_overflows(graph) {
        return None;
    }
    let trip_count = counted.constant_max_trip_count(graph)?;
    let control = counted.control();
    Some(Candidate {
        begin,
        control,
        exit_value: graph.true_successor(control) != Some(counted.body()),
        trip_count,
    })
}

impl<P: LoopPolicies> Phase for LoopFullUnrollPhase<P> {
    fn name(&self) -> &'static str {
        "loop-full-unroll"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::unless_run_before(StageFlags::VALUE_PROXY_REMOVAL | StageFlags::FSA, state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut status = PhaseStatus::Unchanged;
        for begin in self.candidates(graph, context) {
            if !graph.is_alive(begin) {
                continue;
            }
            let Some(candidate) = candidate(graph, begin) else {
                continue;
            };
            log::debug!(
                target: "loop-full-unroll",
                "unrolling {} ({} iterations)",
                candidate.begin,
                candidate.trip_count
            );
            for _ in 0..candidate.trip_count {
                let loops = LoopsData::compute(graph);
                let Some(lp) = loops.loop_for_begin(candidate.begin).map(|lp| lp.id()) else {
                    break;
                };
                peel(graph, &loops, lp)?;
            }
            let exit = graph.logic_constant(candidate.exit_value);
            graph.set_input(candidate.control, 0, exit);
            context.canonicalizer().apply(graph, [candidate.control]);
            context.statistics_mut().increment("loops-fully-unrolled", 1);
            status = PhaseStatus::Changed;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{GraphBuilder, MethodId, NodeKind, Options};

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior, counted_sum};

    /// `sum = 0; for (i = 0; i < 3; i++) sum += x; return sum`
    fn three_times() -> Graph {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let three = b.int(3);
        let scaffold = b.loop_begin(3.0);
        let i = b.loop_phi(&scaffold, zero);
        let sum = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, three);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.75);
        let next_sum = b.add(sum, x);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i), (sum, next_sum)]);
        b.position_at(exit);
        let result = b.proxy(sum, exit);
        b.return_value(Some(result));
        graph
    }

    fn loop_count(graph: &Graph) -> usize {
        graph.nodes_matching(|kind| kind.is_loop_begin()).len()
    }

    #[test]
    fn small_loops_disappear() -> Result<(), CompilationError> {
        crate::init_logging();
        let mut graph = three_times();
        let original = graph.clone();
        let mut options = Options::none();
        options.set_full_unroll(true).set_verify_graphs(true);
        let mut harness = Harness::new(options);
        let status = harness.apply(&mut graph, &mut LoopFullUnrollPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert_eq!(loop_count(&graph), 0);
        assert!(graph.nodes_matching(|kind| matches!(kind, NodeKind::ValueProxy)).is_empty());
        for x in [-2, 0, 5] {
            assert_same_behavior(&original, &graph, &[Arg::Int(x)]);
        }
        Ok(())
    }

    #[test]
    fn loops_over_the_threshold_are_kept() -> Result<(), CompilationError> {
        let mut graph = three_times();
        let mut options = Options::none();
        options.set_full_unroll(true);
        options.full_unroll_max_iterations = 2;
        let mut harness = Harness::new(options);
        let status = harness.apply(&mut graph, &mut LoopFullUnrollPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(loop_count(&graph), 1);
        Ok(())
    }

    #[test]
    fn unknown_trip_counts_are_not_unrolled() -> Result<(), CompilationError> {
        let mut graph = counted_sum();
        let mut options = Options::none();
        options.set_full_unroll(true);
        let mut harness = Harness::new(options);
        let status = harness.apply(&mut graph, &mut LoopFullUnrollPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(loop_count(&graph), 1);
        Ok(())
    }
}
