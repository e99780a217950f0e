use alloc::vec::Vec;

use seajit_ir::{
    Block, CompilationError, ControlFlowGraph, Graph, GraphState, GuardInfo, Loop, Node,
    NodeKind, NotApplicable, Phase, PhaseContext, PhaseStatus, Speculation, SpeculationGroup,
    SpeculationReason, StageFlags,
};
use seajit_ir_analysis::{EarliestSchedule, LoopsData};

use crate::predication::{in_body, index_is_monotonic};

/// Hoists floating guards out of loops.
///
/// A guard is anchored at the begin of the block it was created in, but its check could be
/// performed as soon as its condition is available. When that point is outside of one or more
/// loops enclosing the anchor, the guard is moved to the block right before the outermost of
/// those loops. This is speculative, as the guard may not have been reached on every iteration,
/// and is recorded in the speculation log per guard and loop.
///
/// Guards which compare an induction variable against a loop-invariant bound are decomposed
/// into checks of the first and last value of the variable, which can be hoisted in its place.
/// Type checks anchored inside a loop on an object defined outside of it are re-anchored ahead
/// of the loop, so that guards on them become movable too.
///
/// Moving a guard changes what later guards may move past, so the phase iterates, recomputing
/// the control-flow graph and block frequencies once per iteration.
#[derive(Debug, Default)]
pub struct SpeculativeGuardMovementPhase;

impl SpeculativeGuardMovementPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for SpeculativeGuardMovementPhase {
    fn name(&self) -> &'static str {
        "speculative-guard-movement"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::if_any([
            NotApplicable::unless_floating_guards(state),
            NotApplicable::unless_run_before(StageFlags::FSA, state),
        ])
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        if !context.options().speculative_guard_movement {
            return Ok(PhaseStatus::Unchanged);
        }
        let mut status = PhaseStatus::Unchanged;
        for iteration in 0..context.options().guard_movement_iterations {
            let moved = GuardMovement::new(graph).run(graph, context);
            log::debug!(target: "guard-movement", "iteration {iteration}: moved {moved} guards");
            if moved == 0 {
                break;
            }
            status = PhaseStatus::Changed;
        }
        Ok(status)
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        state.add_stage_flag(StageFlags::GUARD_MOVEMENT);
    }
}

/// One iteration of guard movement, over a fixed view of the control flow
struct GuardMovement {
    loops: LoopsData,
    schedule: EarliestSchedule,
}

/// Where a guard, or the anchor of a type check, may be moved to
#[derive(Copy, Clone)]
struct Target {
    /// The outermost loop left by the move
    lp: Loop,
    /// The block right before `lp`
    block: Block,
}

impl GuardMovement {
    fn new(graph: &Graph) -> Self {
        let mut loops = LoopsData::compute(graph);
        loops.detect_counted_loops(graph);
        Self {
            loops,
            schedule: EarliestSchedule::new(),
        }
    }

    fn cfg(&self) -> &ControlFlowGraph {
        self.loops.cfg()
    }

    fn run(&mut self, graph: &mut Graph, context: &mut PhaseContext<'_>) -> usize {
        let mut moved = 0;
        for guard in graph.nodes_matching(|kind| matches!(kind, NodeKind::Guard(_))) {
            if !graph.is_alive(guard) {
                continue;
            }
            if self.move_guard(graph, guard, context) {
                context.statistics_mut().increment("guards-moved", 1);
                self.schedule.clear();
                moved += 1;
            }
        }
        moved
    }

    fn move_guard(
        &mut self,
        graph: &mut Graph,
        guard: Node,
        context: &mut PhaseContext<'_>,
    ) -> bool {
        let Some(anchor_block) = self.cfg().block_for(graph.guard_anchor(guard)) else {
            return false;
        };
        let Some(innermost) = self.cfg().loop_for(anchor_block) else {
            return false;
        };
        let reanchored = self.hoist_type_check_anchor(graph, guard, context);
        if reanchored {
            self.schedule.clear();
        }

        let earliest = self.schedule.earliest_for_guard(graph, self.loops.cfg(), guard);
        if let Some(target) = self.target(graph, guard, anchor_block, earliest, context) {
            let speculation = self.speculate(graph, guard, target.lp, context);
            let begin = self.cfg().block(target.block).begin();
            if let Some(info) = graph.kind_mut(guard).guard_info_mut() {
                info.speculation = speculation;
            }
            graph.set_guard_anchor(guard, begin);
            log::trace!(target: "guard-movement", "{guard} hoisted to {begin}");
            return true;
        }
        if self.cfg().loop_data(innermost).contains(earliest) {
            return self.decompose(graph, guard, innermost, anchor_block, context) || reanchored;
        }
        reanchored
    }

    /// The outermost loop `node` (anchored in `from`) may leave, given that its inputs are
    /// available in `earliest`
    fn target(
        &self,
        graph: &Graph,
        node: Node,
        from: Block,
        earliest: Block,
        context: &mut PhaseContext<'_>,
    ) -> Option<Target> {
        let cfg = self.cfg();
        let mut target = None;
        let mut current = cfg.loop_for(from);
        while let Some(lp) = current {
            let data = cfg.loop_data(lp);
            if data.contains(earliest) {
                break;
            }
            let Some(block) = cfg.preheader(graph, lp) else {
                break;
            };
            if !cfg.dominates(earliest, block)
                || !self.may_hoist(graph, node, lp, from, block, context)
            {
                break;
            }
            target = Some(Target { lp, block });
            current = data.parent();
        }
        target
    }

    /// Returns true if moving `node` from `from` out of `lp` to `to` is allowed by block
    /// frequencies and by the speculation log
    fn may_hoist(
        &self,
        graph: &Graph,
        node: Node,
        lp: Loop,
        from: Block,
        to: Block,
        context: &mut PhaseContext<'_>,
    ) -> bool {
        let cfg = self.cfg();
        if !context.options().ignore_guard_movement_frequency
            && cfg.frequency(to) > cfg.frequency(from)
        {
            log::trace!(
                target: "guard-movement",
                "{node}: {to} runs more often than {from} ({} > {})",
                cfg.frequency(to),
                cfg.frequency(from)
            );
            return false;
        }
        let reason = self.reason(graph, node, lp);
        if !context.speculation_log().may_speculate(&reason) {
            log::trace!(target: "guard-movement", "{node}: moving out of {lp} failed before");
            return false;
        }
        true
    }

    fn reason(&self, graph: &Graph, node: Node, lp: Loop) -> SpeculationReason {
        let header = self.cfg().block(self.cfg().loop_data(lp).header()).begin();
        SpeculationReason::new(
            SpeculationGroup::GuardMovement,
            graph.method(),
            graph.position(header).unwrap_or(0),
        )
        .with_detail(graph.position(node).unwrap_or(0))
    }

    fn speculate(
        &self,
        graph: &Graph,
        node: Node,
        lp: Loop,
        context: &mut PhaseContext<'_>,
    ) -> Speculation {
        let reason = self.reason(graph, node, lp);
        context.speculation_log().speculate(reason)
    }

    /// Re-anchor a type check used by `guard` ahead of the loops it does not depend on.
    ///
    /// The anchor of a type check marks where its profile was collected; the profile stays
    /// with the node.
    fn hoist_type_check_anchor(
        &mut self,
        graph: &mut Graph,
        guard: Node,
        context: &mut PhaseContext<'_>,
    ) -> bool {
        let check = graph.guard_condition(guard);
        let is_type_check = matches!(graph.kind(check), NodeKind::InstanceOf { .. });
        if !is_type_check || graph.inputs(check).len() < 2 {
            return false;
        }
        let anchor = graph.input(check, 1);
        let Some(anchor_block) = self.cfg().block_for(anchor) else {
            return false;
        };
        let object = self.schedule.earliest(graph, self.loops.cfg(), graph.input(check, 0));
        let Some(target) = self.target(graph, check, anchor_block, object, context) else {
            return false;
        };
        let begin = self.cfg().block(target.block).begin();
        log::trace!(target: "guard-movement", "type check {check} re-anchored at {begin}");
        graph.set_input(check, 1, begin);
        true
    }

    /// Replace a guard comparing an induction variable of `lp` with a loop-invariant bound by
    /// checks of the first and the last value of the variable, ahead of the loop
    fn decompose(
        &self,
        graph: &mut Graph,
        guard: Node,
        lp: Loop,
        anchor_block: Block,
        context: &mut PhaseContext<'_>,
    ) -> bool {
        let Some(counted) = self.loops.loop_ex(lp).counted() else {
            return false;
        };
        if !in_body(self.cfg(), counted, graph.guard_anchor(guard)) {
            return false;
        }
        let info = graph.guard_info(guard);
        let condition = graph.guard_condition(guard);
        let kind = graph.kind(condition).clone();
        let (x, y) = match kind {
            NodeKind::IntegerLessThan | NodeKind::IntegerBelow => {
                (graph.input(condition, 0), graph.input(condition, 1))
            }
            _ => return false,
        };
        let inside = self.loops.inside(graph, lp);
        let ivs = counted.ivs();
        let (iv, bound, iv_on_left) = match (ivs.lookup(x), ivs.lookup(y)) {
            (Some(iv), None) if !inside.contains(y) => (iv, y, true),
            (None, Some(iv)) if !inside.contains(x) => (iv, x, false),
            _ => return false,
        };
        // The unsigned test only holds on a contiguous range of values for a non-negative bound
        if matches!(kind, NodeKind::IntegerBelow) {
            let non_negative = graph.int_stamp(bound).is_some_and(|s| s.lower() >= 0);
            if !iv_on_left || info.negated || !non_negative {
                return false;
            }
        }
        if !index_is_monotonic(graph, counted, iv) {
            return false;
        }
        let Some(preheader) = self.cfg().preheader(graph, lp) else {
            return false;
        };
        if !self.may_hoist(graph, guard, lp, anchor_block, preheader, context) {
            return false;
        }

        // Never install checks known to deoptimize whenever the loop is entered
        let bits = graph.bits(bound);
        let constant_endpoints = [
            ivs.constant_init(graph, iv),
            counted
                .constant_max_trip_count(graph)
                .filter(|count| *count > 0)
                .and_then(|count| ivs.constant_extremum(graph, iv, count)),
        ];
        for endpoint in constant_endpoints.into_iter().flatten() {
            let Some(bound) = graph.as_constant(bound) else {
                break;
            };
            let (a, b) = if iv_on_left { (endpoint, bound) } else { (bound, endpoint) };
            if kind.fold_compare(bits, a, b).is_some_and(|value| info.fails_on(value)) {
                log::debug!(target: "guard-movement", "{guard}: the decomposed check always fails");
                return false;
            }
        }
        if !counted.ensure_no_overflow(graph, context) {
            return false;
        }

        let speculation = self.speculate(graph, guard, lp, context);
        let anchor = self.cfg().block(preheader).begin();
        let entry = counted.entry_condition(graph);
        let init = counted.ivs().init_node(graph, iv);
        let extremum = counted.extremum_node(graph, iv, true, None);
        let mut checks: Vec<Node> = Vec::with_capacity(2);
        for endpoint in [init, extremum] {
            let operands = if iv_on_left { [endpoint, bound] } else { [bound, endpoint] };
            let test = graph.unique(kind.clone(), &operands);
            let check = if graph.as_logic_constant(entry) == Some(true) {
                let info = GuardInfo::new(info.reason, info.action)
                    .negated(info.negated)
                    .with_speculation(speculation);
                graph.add_guard(test, anchor, info)
            } else {
                // !entered || test (!= negated)
                let passes = graph.unique(
                    NodeKind::ShortCircuitOr {
                        x_negated: true,
                        y_negated: info.negated,
                    },
                    &[entry, test],
                );
                let info = GuardInfo::new(info.reason, info.action).with_speculation(speculation);
                graph.add_guard(passes, anchor, info)
            };
            graph.set_position(check, graph.position(guard));
            checks.push(check);
        }
        let Some(combined) = graph.combine_guards(checks.first().copied(), checks.get(1).copied())
        else {
            return false;
        };
        log::trace!(target: "guard-movement", "{guard} decomposed into {combined} at {anchor}");
        graph.replace_at_usages(guard, combined);
        graph.delete_with_unused_inputs(guard);
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{DeoptimizationReason, GraphBuilder, InMemorySpeculationLog, MethodId, Options};

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior, execute};

    fn guard_movement() -> Options {
        let mut options = Options::none();
        options.set_speculative_guard_movement(true).set_verify_graphs(true);
        options
    }

    /// `for (i = 0; i < n; i++) { if (i < 1) { guard(c < 10) }; invoke(i) }`, where the branch
    /// holding the guard is taken with probability `p`
    fn invariant_guard_in_branch(p: f64) -> (Graph, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let c = b.int_parameter(1);
        let zero = b.int(0);
        let one = b.int(1);
        let ten = b.int(10);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let first = b.less_than(i, one);
        let (t, f) = b.branch(first, p);
        b.position_at(t);
        let small = b.less_than(c, ten);
        let guard = b.guard(small, DeoptimizationReason::RuntimeConstraint, false);
        let t_end = b.end();
        b.position_at(f);
        let f_end = b.end();
        b.merge(&[t_end, f_end]);
        b.invoke(1, &[i]);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);
        (graph, guard)
    }

    /// `for (i = 0; i < n; i += stride) { guard(i < bound); invoke(i) }`
    fn bounded_counter(bound: i32, stride: i32) -> Graph {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let stride = b.int(stride);
        let bound = b.int(bound);
        b.set_bytecode_position(Some(2));
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        b.set_bytecode_position(Some(6));
        let below_bound = b.less_than(i, bound);
        b.guard(below_bound, DeoptimizationReason::RuntimeConstraint, false);
        b.invoke(1, &[i]);
        let next_i = b.add(i, stride);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);
        graph
    }

    /// The loop depth of the block `guard` is anchored in
    fn anchor_depth(graph: &Graph, guard: Node) -> u32 {
        let cfg = ControlFlowGraph::compute(graph);
        let block = cfg.block_for(graph.guard_anchor(guard)).unwrap();
        cfg.loop_depth(block)
    }

    fn guards(graph: &Graph) -> Vec<Node> {
        graph.nodes_matching(|kind| matches!(kind, NodeKind::Guard(_)))
    }

    #[test]
    fn invariant_guards_leave_the_loop() -> Result<(), CompilationError> {
        crate::init_logging();
        let (mut graph, guard) = invariant_guard_in_branch(0.5);
        let original = graph.clone();
        let mut harness = Harness::new(guard_movement());
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert_eq!(graph.guard_anchor(guard), graph.start());
        assert!(!graph.guard_info(guard).speculation.is_none());
        assert_eq!(harness.log.speculations().len(), 1);
        assert_eq!(harness.log.speculations()[0].group, SpeculationGroup::GuardMovement);
        assert!(graph.state().is_after_stage(StageFlags::GUARD_MOVEMENT));
        for n in [0, 1, 4] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n), Arg::Int(3)]);
        }
        Ok(())
    }

    #[test]
    fn guards_never_move_to_hotter_blocks() -> Result<(), CompilationError> {
        let (mut graph, guard) = invariant_guard_in_branch(0.02);
        let mut harness = Harness::new(guard_movement());
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(anchor_depth(&graph, guard), 1);

        let mut options = guard_movement();
        options.set_ignore_guard_movement_frequency(true);
        let mut harness = Harness::new(options);
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert_eq!(anchor_depth(&graph, guard), 0);
        Ok(())
    }

    #[test]
    fn failed_movements_are_not_repeated() -> Result<(), CompilationError> {
        let (mut graph, guard) = invariant_guard_in_branch(0.5);
        let mut harness = Harness::new(guard_movement());
        // every guard movement of the method failed before
        let reason = |detail| {
            SpeculationReason::new(SpeculationGroup::GuardMovement, MethodId(0), 0)
                .with_detail(detail)
        };
        harness.log = InMemorySpeculationLog::with_failed([reason(0)]);
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(anchor_depth(&graph, guard), 1);
        Ok(())
    }

    #[test]
    fn counter_checks_are_decomposed() -> Result<(), CompilationError> {
        crate::init_logging();
        let mut graph = bounded_counter(100, 1);
        let begin = graph.nodes_matching(|kind| kind.is_loop_begin())[0];
        let original = graph.clone();
        let mut harness = Harness::new(guard_movement());
        let in_loop = guards(&graph)[0];
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert!(!graph.is_alive(in_loop));
        // only the check of the last value remains: the check of the first value is folded
        // away, and `i < n` stops before the counter could overflow
        let guards = guards(&graph);
        assert_eq!(guards.len(), 1);
        assert_eq!(anchor_depth(&graph, guards[0]), 0);
        assert!(graph.kind(begin).loop_begin_info().unwrap().overflow_guard.is_none());
        for n in [0, 1, 5, 100] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n)]);
        }
        // a loop which would fail the check deoptimizes before its first iteration
        let execution = execute(&graph, &[Arg::Int(150)]);
        assert!(execution.outcome.is_deoptimized());
        assert!(execution.calls.is_empty());
        Ok(())
    }

    #[test]
    fn stepped_counter_checks_need_a_limit_guard() -> Result<(), CompilationError> {
        let mut graph = bounded_counter(100, 2);
        let begin = graph.nodes_matching(|kind| kind.is_loop_begin())[0];
        let original = graph.clone();
        let mut harness = Harness::new(guard_movement());
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        // the check of the last value, and the loop-limit guard it relies on
        let limit_guard = graph.kind(begin).loop_begin_info().unwrap().overflow_guard;
        assert!(limit_guard.is_some_and(|guard| graph.is_alive(guard)));
        let guards = guards(&graph);
        assert_eq!(guards.len(), 2);
        for guard in guards.iter() {
            assert_eq!(anchor_depth(&graph, *guard), 0);
        }
        for n in [0, 1, 5, 100] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n)]);
        }
        assert!(execute(&graph, &[Arg::Int(150)]).outcome.is_deoptimized());
        Ok(())
    }

    #[test]
    fn checks_which_always_fail_are_kept_in_place() -> Result<(), CompilationError> {
        // for (i = 0; i < 10; i++) guard(i < 5)
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let zero = b.int(0);
        let one = b.int(1);
        let five = b.int(5);
        let ten = b.int(10);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, ten);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let small = b.less_than(i, five);
        let guard = b.guard(small, DeoptimizationReason::RuntimeConstraint, false);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);

        let mut harness = Harness::new(guard_movement());
        let status = harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert!(graph.is_alive(guard));
        assert_eq!(anchor_depth(&graph, guard), 1);
        Ok(())
    }

    #[test]
    fn type_checks_are_re_anchored() -> Result<(), CompilationError> {
        // for (i = 0; i < n; i++) { guard(o instanceof T); invoke(i) }
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let object = b.array_parameter(0);
        let n = b.int_parameter(1);
        let zero = b.int(0);
        let one = b.int(1);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let anchor = b.current_begin();
        let check = b.instance_of(object, 1, Some(anchor));
        let guard = b.guard(check, DeoptimizationReason::TypeCheckedInliningViolated, false);
        b.invoke(1, &[i]);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);
        let original = graph.clone();

        let mut harness = Harness::new(guard_movement());
        harness.apply(&mut graph, &mut SpeculativeGuardMovementPhase::new())?;
        assert_eq!(graph.input(check, 1), graph.start());
        assert_eq!(graph.guard_anchor(guard), graph.start());
        for n in [0, 3] {
            assert_same_behavior(&original, &graph, &[Arg::Array(&[1, 2]), Arg::Int(n)]);
        }
        Ok(())
    }
}
