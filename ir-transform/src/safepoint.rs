//! Safepoint poll elimination for loops.
//!
//! Every loop end and loop exit polls for a safepoint unless told otherwise, so that a thread
//! running a long loop can still be stopped for a collection or a deoptimization. A poll is
//! unnecessary on a loop end when every iteration reaching it has already performed a call,
//! which polls on its own, and may be omitted on loops which are known to run for a short time.
//! The poll on a loop exit is only dropped once none of the iterations poll.
//!
//! The decisions are collected into a [SafepointPlan] without touching the graph, and applied
//! in one go.
use alloc::vec::Vec;

use seajit_ir::{
    Block, CompilationError, ControlFlowGraph, Graph, GraphState, Loop, LoopKind, Node, NodeKind,
    NotApplicable, Phase, PhaseContext, PhaseStatus, SafepointState, SmallVec, StageFlags,
};
use seajit_ir_analysis::{CountedLoopInfo, LoopsData};

/// The safepoint changes decided for one loop
#[derive(Debug)]
struct LoopPlan {
    begin: Node,
    /// Ends preceded by a call on every path
    ends: SmallVec<[Node; 2]>,
    /// Ends which only stop polling because the loop runs briefly
    optimistic_ends: SmallVec<[Node; 2]>,
    exits: SmallVec<[Node; 2]>,
    /// The loop-limit guard the optimistic ends and the exits rely on, to be created when the
    /// plan is applied
    overflow_guard: Option<CountedLoopInfo>,
}

/// The loop ends and exits whose safepoint polls can be disabled
#[derive(Debug, Default)]
pub struct SafepointPlan {
    loops: Vec<LoopPlan>,
}

impl SafepointPlan {
    /// Decide which polls of the loops of `graph` are unnecessary.
    ///
    /// Only polls which are still required are considered, so computing the plan again after
    /// applying it yields an empty plan.
    pub fn compute(graph: &Graph, loops: &LoopsData, context: &mut PhaseContext<'_>) -> Self {
        let cfg = loops.cfg();
        let mut plan = Self::default();
        for lp in loops.outer_first() {
            let begin = loops.loop_ex(lp).begin();
            let header = cfg.loop_data(lp).header();
            let all_ends = graph.loop_ends(begin);
            let mut ends = SmallVec::<[Node; 2]>::new();
            let mut optimistic_ends = SmallVec::<[Node; 2]>::new();
            let mut silent = 0;
            for &end in all_ends {
                match graph.kind(end).safepoint_state() {
                    Some(SafepointState::MustSafepoint) => {
                        if calls_on_every_path(graph, cfg, header, end) {
                            log::trace!(target: "safepoints", "{end}: preceded by a call");
                            ends.push(end);
                            silent += 1;
                        }
                    }
                    _ => silent += 1,
                }
            }

            let mut overflow_guard = None;
            if silent < all_ends.len() && context.options().optimistic_safepoint_elimination {
                if let Some(guard) = runs_briefly(graph, loops, lp, context) {
                    log::trace!(target: "safepoints", "{begin}: runs briefly");
                    for &end in all_ends {
                        let state = graph.kind(end).safepoint_state();
                        if state.is_some_and(|s| s.can_safepoint()) && !ends.contains(&end) {
                            optimistic_ends.push(end);
                        }
                    }
                    silent = all_ends.len();
                    overflow_guard = guard;
                }
            }

            // The exit is the last chance to poll if no iteration did
            let mut exits = SmallVec::<[Node; 2]>::new();
            if silent == all_ends.len() {
                exits.extend(graph.loop_exits(begin).into_iter().filter(|exit| {
                    graph.kind(*exit).safepoint_state().is_some_and(|s| s.can_safepoint())
                }));
            }

            if !ends.is_empty() || !optimistic_ends.is_empty() || !exits.is_empty() {
                plan.loops.push(LoopPlan {
                    begin,
                    ends,
                    optimistic_ends,
                    exits,
                    overflow_guard,
                });
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// The loop ends whose polls will be disabled
    pub fn loop_ends(&self) -> impl Iterator<Item = Node> + '_ {
        self.loops
            .iter()
            .flat_map(|plan| plan.ends.iter().chain(plan.optimistic_ends.iter()).copied())
    }

    /// The loop exits whose polls will be disabled
    pub fn loop_exits(&self) -> impl Iterator<Item = Node> + '_ {
        self.loops.iter().flat_map(|plan| plan.exits.iter().copied())
    }

    /// The loops which rely on a loop-limit guard which does not exist yet
    pub fn overflow_guards(&self) -> impl Iterator<Item = Node> + '_ {
        self.loops.iter().filter(|plan| plan.overflow_guard.is_some()).map(|plan| plan.begin)
    }

    /// Disable the planned polls, creating the loop-limit guards the plan relies on first.
    ///
    /// If a loop-limit guard cannot be created, only the polls made unnecessary by calls are
    /// disabled in its loop. Returns the number of polls disabled.
    pub fn apply(self, graph: &mut Graph, context: &mut PhaseContext<'_>) -> usize {
        let mut disabled = 0;
        for plan in self.loops {
            let guarded = match plan.overflow_guard {
                Some(counted) => counted.create_overflow_guard(graph, context).is_some(),
                None => true,
            };
            disabled += disable_polls(graph, &plan.ends);
            if !guarded {
                log::debug!(
                    target: "safepoints",
                    "{}: could not create the loop-limit guard, keeping its other polls",
                    plan.begin
                );
                continue;
            }
            disabled += disable_polls(graph, &plan.optimistic_ends);
            disabled += disable_polls(graph, &plan.exits);
        }
        disabled
    }
}

fn disable_polls(graph: &mut Graph, nodes: &[Node]) -> usize {
    let mut disabled = 0;
    for &node in nodes {
        if let NodeKind::LoopEnd(state) | NodeKind::LoopExit(state) = graph.kind_mut(node) {
            if state.can_safepoint() {
                *state = SafepointState::OptimizerDisabled;
                disabled += 1;
            }
        }
    }
    disabled
}

/// Returns true if every path from the header of a loop to `end` performs a call which polls
/// for a safepoint
fn calls_on_every_path(graph: &Graph, cfg: &ControlFlowGraph, header: Block, end: Node) -> bool {
    let mut block = match cfg.block_for(end) {
        Some(block) => block,
        None => return false,
    };
    loop {
        let nodes = cfg.block(block).nodes();
        if nodes.iter().any(|node| graph.kind(*node).is_guaranteed_safepoint()) {
            return true;
        }
        if block == header {
            return false;
        }
        match cfg.dominator(block) {
            Some(dominator) => block = dominator,
            None => return false,
        }
    }
}

/// Returns `Some` if `lp` is known to run for a short time, along with the loop whose
/// loop-limit guard must be created for its counter not to overflow, if any
fn runs_briefly(
    graph: &Graph,
    loops: &LoopsData,
    lp: Loop,
    context: &mut PhaseContext<'_>,
) -> Option<Option<CountedLoopInfo>> {
    // A loop containing others may run for as long as all of them together
    if !loops.is_innermost(lp) {
        return None;
    }
    let counted = loops.loop_ex(lp).counted()?;
    let split = matches!(counted.kind(graph), LoopKind::Pre | LoopKind::Post);
    if !split && !counted.is_in_32bit_range(graph) {
        return None;
    }
    if counted.counter_never_overflows(graph) || counted.overflow_guard(graph).is_some() {
        return Some(None);
    }
    counted.may_create_overflow_guard(graph, context).then(|| Some(counted.clone()))
}

/// Disables safepoint polls on loop ends and exits where they are not needed.
///
/// Once this phase ran, no further loop-limit guards may be created.
#[derive(Debug, Default)]
pub struct LoopSafepointEliminationPhase;

impl LoopSafepointEliminationPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for LoopSafepointEliminationPhase {
    fn name(&self) -> &'static str {
        "loop-safepoint-elimination"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::if_applied(StageFlags::SAFEPOINT_ELIMINATION, state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        if !context.options().safepoint_elimination {
            return Ok(PhaseStatus::Unchanged);
        }
        let mut loops = LoopsData::compute(graph);
        loops.detect_counted_loops(graph);
        let plan = SafepointPlan::compute(graph, &loops, context);
        if plan.is_empty() {
            return Ok(PhaseStatus::Unchanged);
        }
        let disabled = plan.apply(graph, context);
        context.statistics_mut().increment("safepoints-disabled", disabled as u64);
        Ok(PhaseStatus::changed_if(disabled > 0))
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        state.add_stage_flag(StageFlags::SAFEPOINT_ELIMINATION);
        state.add_stage_flag(StageFlags::LOOP_OVERFLOWS_CHECKED);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use pretty_assertions::assert_eq;
    use seajit_ir::{
        GraphBuilder, InMemorySpeculationLog, MethodId, Options, SpeculationGroup,
        SpeculationReason,
    };

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior, counted_sum, execute};

    /// `for (i = 0; i < n; i++) invoke(i); return`
    fn call_loop() -> (Graph, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        b.invoke(1, &[i]);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);
        (graph, scaffold.begin)
    }

    fn states(graph: &Graph, begin: Node) -> (Vec<SafepointState>, Vec<SafepointState>) {
        let state = |node: &Node| graph.kind(*node).safepoint_state().unwrap();
        (
            graph.loop_ends(begin).iter().map(state).collect(),
            graph.loop_exits(begin).iter().map(state).collect(),
        )
    }

    fn elimination(optimistic: bool) -> Options {
        let mut options = Options::none();
        options.set_safepoint_elimination(true).set_verify_graphs(true);
        options.optimistic_safepoint_elimination = optimistic;
        options
    }

    #[test]
    fn calls_make_polls_unnecessary() -> Result<(), CompilationError> {
        crate::init_logging();
        let (mut graph, begin) = call_loop();
        let original = graph.clone();
        let mut harness = Harness::new(elimination(false));
        let status = harness.apply(&mut graph, &mut LoopSafepointEliminationPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        let (ends, exits) = states(&graph, begin);
        assert_eq!(ends, [SafepointState::OptimizerDisabled]);
        assert_eq!(exits, [SafepointState::OptimizerDisabled]);
        assert!(graph.state().is_after_stage(StageFlags::LOOP_OVERFLOWS_CHECKED));

        // only the calls still poll
        let execution = execute(&graph, &[Arg::Int(2)]);
        assert_eq!(execution.safepoint_polls, 2);
        assert_eq!(execute(&original, &[Arg::Int(2)]).safepoint_polls, 5);
        assert_same_behavior(&original, &graph, &[Arg::Int(2)]);
        Ok(())
    }

    #[test]
    fn loops_without_calls_keep_their_polls() -> Result<(), CompilationError> {
        let mut graph = counted_sum();
        let mut harness = Harness::new(elimination(false));
        let status = harness.apply(&mut graph, &mut LoopSafepointEliminationPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        Ok(())
    }

    #[test]
    fn conditional_calls_do_not_count() {
        // for (i = 0; i < n; i++) { if (i < 3) invoke(i) }
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let three = b.int(3);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let early = b.less_than(i, three);
        let (t, f) = b.branch(early, 0.5);
        b.position_at(t);
        b.invoke(1, &[i]);
        let t_end = b.end();
        b.position_at(f);
        let f_end = b.end();
        b.merge(&[t_end, f_end]);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);

        let mut harness = Harness::new(elimination(false));
        let mut loops = LoopsData::compute(&graph);
        loops.detect_counted_loops(&graph);
        let plan = SafepointPlan::compute(&graph, &loops, &mut harness.context());
        assert!(plan.is_empty());
    }

    /// `i = 0; sum = 0; while (i < n) { sum += i; i += 2 }; return sum`
    fn stepped_sum() -> (Graph, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let two = b.int(2);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let sum = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let next_sum = b.add(sum, i);
        let next_i = b.add(i, two);
        b.loop_end(&scaffold, &[(i, next_i), (sum, next_sum)]);
        b.position_at(exit);
        let result = b.proxy(sum, exit);
        b.return_value(Some(result));
        (graph, scaffold.begin)
    }

    /// `for (i = 0; i < n; i += 2) { if (i == 0) { invoke(i); continue } }`, with one backedge
    /// after the call and one without
    fn first_iteration_call() -> (Graph, Node, Node, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let two = b.int(2);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let next_i = b.add(i, two);
        let first = b.equals(i, zero);
        let (t, f) = b.branch(first, 0.5);
        b.position_at(t);
        b.invoke(1, &[i]);
        let call_end = b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(f);
        let quiet_end = b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);
        (graph, scaffold.begin, call_end, quiet_end)
    }

    fn plan_for(graph: &Graph, harness: &mut Harness) -> SafepointPlan {
        let mut loops = LoopsData::compute(graph);
        loops.detect_counted_loops(graph);
        SafepointPlan::compute(graph, &loops, &mut harness.context())
    }

    #[test]
    fn short_loops_lose_their_polls_optimistically() {
        let mut graph = counted_sum();
        let original = graph.clone();
        let begin = graph.nodes_matching(|kind| kind.is_loop_begin())[0];
        let mut harness = Harness::new(elimination(true));

        let plan = plan_for(&graph, &mut harness);
        assert_eq!(plan.loop_ends().count(), 1);
        assert_eq!(plan.loop_exits().count(), 1);
        // `i < n` with a unit stride stops before the counter could overflow
        assert_eq!(plan.overflow_guards().count(), 0);
        assert_eq!(plan.apply(&mut graph, &mut harness.context()), 2);
        assert!(graph.kind(begin).loop_begin_info().unwrap().overflow_guard.is_none());
        assert_eq!(
            states(&graph, begin),
            (vec![SafepointState::OptimizerDisabled], vec![SafepointState::OptimizerDisabled])
        );

        // applying the plan reaches a fixed point
        assert!(plan_for(&graph, &mut harness).is_empty());
        for n in [0, 3, 10] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n)]);
        }
    }

    #[test]
    fn stepped_counters_poll_less_behind_a_limit_guard() {
        let (mut graph, begin) = stepped_sum();
        let original = graph.clone();
        let mut harness = Harness::new(elimination(true));

        let plan = plan_for(&graph, &mut harness);
        // stepping by two past a limit close to the maximum would overflow
        assert_eq!(plan.overflow_guards().collect::<Vec<_>>(), [begin]);
        assert_eq!(plan.apply(&mut graph, &mut harness.context()), 2);
        assert!(graph.kind(begin).loop_begin_info().unwrap().overflow_guard.is_some());
        assert!(plan_for(&graph, &mut harness).is_empty());

        for n in [0, 1, 2, 7, 10] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n)]);
        }
        let execution = execute(&graph, &[Arg::Int(i32::MAX as i64)]);
        assert!(execution.outcome.is_deoptimized());
    }

    #[test]
    fn calls_still_count_without_a_limit_guard() {
        let (mut graph, begin, call_end, quiet_end) = first_iteration_call();
        let mut harness = Harness::new(elimination(true));
        let plan = plan_for(&graph, &mut harness);
        assert_eq!(plan.loop_ends().count(), 2);
        assert_eq!(plan.overflow_guards().collect::<Vec<_>>(), [begin]);

        // the loop-limit speculation failed since the plan was made
        let reason = SpeculationReason::new(
            SpeculationGroup::LoopLimitCheck,
            graph.method(),
            graph.position(begin).unwrap_or(0),
        );
        harness.log = InMemorySpeculationLog::with_failed([reason]);
        assert_eq!(plan.apply(&mut graph, &mut harness.context()), 1);
        let state = |node: Node| graph.kind(node).safepoint_state();
        assert_eq!(state(call_end), Some(SafepointState::OptimizerDisabled));
        assert_eq!(state(quiet_end), Some(SafepointState::MustSafepoint));
        let (_, exits) = states(&graph, begin);
        assert_eq!(exits, [SafepointState::MustSafepoint]);
        assert!(graph.kind(begin).loop_begin_info().unwrap().overflow_guard.is_none());
    }

    #[test]
    fn elimination_runs_once() {
        let mut graph = counted_sum();
        graph.state_mut().add_stage_flag(StageFlags::SAFEPOINT_ELIMINATION);
        let mut harness = Harness::new(elimination(true));
        let result = harness.apply(&mut graph, &mut LoopSafepointEliminationPhase::new());
        assert!(matches!(result, Err(CompilationError::PhaseNotApplicable { .. })));
    }
}
