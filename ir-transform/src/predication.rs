use alloc::vec::Vec;

use seajit_ir::{
    CompilationError, ControlFlowGraph, DeoptimizationAction, Graph, GraphState, GuardInfo, Loop,
    Node, NodeKind, NotApplicable, Phase, PhaseContext, PhaseStatus, SpeculationGroup,
    SpeculationReason, StageFlags,
};
use seajit_ir_analysis::{CountedLoopInfo, IvId, LoopsData};

/// A range check of a loop which can be replaced by checks of the first and last index
struct RangeCheck {
    guard: Node,
    index: IvId,
    length: Node,
}

/// Replaces range checks in counted loops by a pair of checks ahead of the loop.
///
/// A floating guard on `index |<| length`, with `length` loop-invariant and non-negative and
/// `index` an induction variable moving monotonically with the loop's counter, passes on every
/// iteration exactly when it passes for the first and the last index. Both are checked before
/// the loop, conditional on the loop being entered at all, and the in-loop guard is replaced
/// by the combination of the two.
///
/// The hoisted checks are speculative: they may deoptimize before the loop runs an iteration
/// which would have deoptimized in the original. Each predicated guard is registered in the
/// speculation log, so a method that fails one is recompiled without it.
#[derive(Debug, Default)]
pub struct LoopPredicationPhase;

impl LoopPredicationPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for LoopPredicationPhase {
    fn name(&self) -> &'static str {
        "loop-predication"
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
        if !context.options().loop_predication {
            return Ok(PhaseStatus::Unchanged);
        }
        let mut loops = LoopsData::compute(graph);
        loops.detect_counted_loops(graph);
        let mut predicated = 0;
        for lp in loops.inner_first() {
            if !loops.is_innermost(lp) {
                continue;
            }
            predicated += predicate_loop(graph, &loops, lp, context);
        }
        context.statistics_mut().increment("guards-predicated", predicated as u64);
        Ok(PhaseStatus::changed_if(predicated > 0))
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        state.add_stage_flag(StageFlags::LOOP_PREDICATION);
    }
}

/// Predicate the range checks of `lp`, returning how many were replaced
fn predicate_loop(
    graph: &mut Graph,
    loops: &LoopsData,
    lp: Loop,
    context: &mut PhaseContext<'_>,
) -> usize {
    let Some(counted) = loops.loop_ex(lp).counted() else {
        return 0;
    };
    let begin = counted.loop_begin();
    let header_position = graph.position(begin).unwrap_or(0);
    let checks: Vec<(RangeCheck, SpeculationReason)> = range_checks(graph, loops, lp, counted)
        .into_iter()
        .map(|check| {
            let reason = SpeculationReason::new(
                SpeculationGroup::LoopPredication,
                graph.method(),
                header_position,
            )
            .with_detail(graph.position(check.guard).unwrap_or(0));
            (check, reason)
        })
        .filter(|(check, reason)| {
            let allowed = context.speculation_log().may_speculate(reason);
            if !allowed {
                log::debug!(
                    target: "loop-predication",
                    "{}: predication failed before",
                    check.guard
                );
            }
            allowed
        })
        .collect();
    // A loop-limit guard is only worth its deoptimization if some check relies on it
    if checks.is_empty() {
        return 0;
    }
    if !counted.ensure_no_overflow(graph, context) {
        log::debug!(target: "loop-predication", "{begin}: the counter may overflow");
        return 0;
    }

    let anchor = graph.prev_begin(graph.forward_end(begin));
    let entry = counted.entry_condition(graph);
    let mut predicated = 0;
    for (check, reason) in checks {
        let speculation = context.speculation_log().speculate(reason);
        let deopt_reason = graph.guard_info(check.guard).reason;
        let info = GuardInfo::new(deopt_reason, DeoptimizationAction::InvalidateRecompile)
            .with_speculation(speculation);

        let lower = counted.ivs().init_node(graph, check.index);
        let upper = counted.extremum_node(graph, check.index, true, None);
        let guards = [lower, upper].map(|bound| {
            let in_bounds = graph.unique(NodeKind::IntegerBelow, &[bound, check.length]);
            let condition = if graph.as_logic_constant(entry) == Some(true) {
                in_bounds
            } else {
                // !entered || bound |<| length
                let kind = NodeKind::ShortCircuitOr {
                    x_negated: true,
                    y_negated: false,
                };
                graph.unique(kind, &[entry, in_bounds])
            };
            graph.add_guard(condition, anchor, info)
        });
        if let Some(position) = graph.position(check.guard) {
            for guard in guards {
                graph.set_position(guard, Some(position));
            }
        }
        let Some(combined) = graph.combine_guards(Some(guards[0]), Some(guards[1])) else {
            continue;
        };
        log::trace!(
            target: "loop-predication",
            "{}: replaced by {combined} ahead of {begin}",
            check.guard
        );
        graph.replace_at_usages(check.guard, combined);
        graph.delete_with_unused_inputs(check.guard);
        predicated += 1;
    }
    predicated
}

/// The guards of `lp` which qualify for predication
fn range_checks(
    graph: &Graph,
    loops: &LoopsData,
    lp: Loop,
    counted: &CountedLoopInfo,
) -> Vec<RangeCheck> {
    let inside = loops.inside(graph, lp);
    let ivs = counted.ivs();
    let mut guards: Vec<Node> = inside
        .iter()
        .filter(|node| matches!(graph.kind(*node), NodeKind::Guard(_)))
        .collect();
    guards.sort_unstable();

    let mut checks = Vec::new();
    for guard in guards {
        if !in_body(loops.cfg(), counted, graph.guard_anchor(guard)) {
            continue;
        }
        let info = graph.guard_info(guard);
        let condition = graph.guard_condition(guard);
        // Only the unsigned form checks both ends of the range at once
        if info.negated || !matches!(graph.kind(condition), NodeKind::IntegerBelow) {
            continue;
        }
        let (index, length) = (graph.input(condition, 0), graph.input(condition, 1));
        if inside.contains(length) || !graph.int_stamp(length).is_some_and(|s| s.lower() >= 0) {
            continue;
        }
        let Some(index) = ivs.lookup(index) else {
            continue;
        };
        if !index_is_monotonic(graph, counted, index) {
            log::trace!(target: "loop-predication", "{guard}: the index may wrap around");
            continue;
        }
        checks.push(RangeCheck {
            guard,
            index,
            length,
        });
    }
    checks
}

/// Returns true if `node` only runs on iterations which passed the exit test of the loop, and
/// therefore only sees counter values between the initial value and the extremum
pub(crate) fn in_body(cfg: &ControlFlowGraph, counted: &CountedLoopInfo, node: Node) -> bool {
    match (cfg.block_for(counted.body()), cfg.block_for(node)) {
        (Some(body), Some(block)) => cfg.dominates(body, block),
        _ => false,
    }
}

/// Returns true if `index` is an affine function of the loop's counter with a constant stride,
/// which cannot wrap around while the loop runs
pub(crate) fn index_is_monotonic(graph: &Graph, counted: &CountedLoopInfo, index: IvId) -> bool {
    let ivs = counted.ivs();
    if ivs.constant_stride(graph, index).is_none() {
        return false;
    }
    let Some(relation) = ivs.relation_to(graph, index, counted.iv()) else {
        return false;
    };
    let bits = graph.bits(ivs[index].value());
    let fits_constant_range = counted
        .constant_max_trip_count(graph)
        .is_some_and(|trip_count| ivs.value_range_fits(graph, index, trip_count, bits));
    let unit = relation.scale.abs() == 1
        && (relation.offset_is_zero() || counted.is_in_32bit_range(graph));
    fits_constant_range || unit
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{DeoptimizationReason, GraphBuilder, InMemorySpeculationLog, MethodId, Options};

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior, execute};

    /// `sum = 0; for (i = 0; i < limit; i += stride) sum += a[i]; return sum`, where the limit
    /// is either `a.length` or the parameter `n`
    fn array_sum(limit_is_length: bool, stride: i32) -> (Graph, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let array = b.array_parameter(0);
        let n = b.int_parameter(1);
        let zero = b.int(0);
        let stride = b.int(stride);
        let length = b.array_length(array);
        let limit = if limit_is_length { length } else { n };
        b.set_bytecode_position(Some(4));
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let sum = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, limit);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        b.set_bytecode_position(Some(9));
        let in_bounds = b.below(i, length);
        let guard = b.guard(in_bounds, DeoptimizationReason::BoundsCheckException, false);
        let element = b.load_indexed(array, i, Some(guard));
        let next_sum = b.add(sum, element);
        let next_i = b.add(i, stride);
        b.loop_end(&scaffold, &[(i, next_i), (sum, next_sum)]);
        b.position_at(exit);
        let result = b.proxy(sum, exit);
        b.return_value(Some(result));
        (graph, scaffold.begin)
    }

    fn predication() -> Options {
        let mut options = Options::none();
        options.set_loop_predication(true).set_verify_graphs(true);
        options
    }

    /// Range-check guards anchored inside the loop of `begin`
    fn guards_in_loop(graph: &Graph, begin: Node) -> usize {
        let loops = LoopsData::compute(graph);
        let lp = loops.loop_for_begin(begin).unwrap().id();
        loops
            .inside(graph, lp)
            .iter()
            .filter(|node| matches!(graph.kind(*node), NodeKind::Guard(_)))
            .count()
    }

    #[test]
    fn range_checks_are_hoisted_in_pairs() -> Result<(), CompilationError> {
        crate::init_logging();
        let (mut graph, begin) = array_sum(true, 1);
        let original = graph.clone();
        let mut harness = Harness::new(predication());
        let status = harness.apply(&mut graph, &mut LoopPredicationPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert_eq!(harness.statistics.counter("guards-predicated"), 1);
        assert_eq!(guards_in_loop(&graph, begin), 0);

        let multi = graph.nodes_matching(|kind| matches!(kind, NodeKind::MultiGuard));
        assert_eq!(multi.len(), 1);
        let hoisted = graph.inputs(multi[0]).to_vec();
        assert_eq!(hoisted.len(), 2);
        for guard in hoisted {
            assert_eq!(graph.guard_anchor(guard), graph.start());
            assert!(!graph.guard_info(guard).speculation.is_none());
        }
        assert_eq!(harness.log.speculations().len(), 1);
        assert_eq!(harness.log.speculations()[0].position, 4);
        assert_eq!(harness.log.speculations()[0].detail, 9);
        assert!(graph.state().is_after_stage(StageFlags::LOOP_PREDICATION));

        for array in [&[][..], &[5], &[1, 2, 3, 4]] {
            assert_same_behavior(&original, &graph, &[Arg::Array(array), Arg::Int(0)]);
        }
        Ok(())
    }

    #[test]
    fn predicated_checks_pass_for_exact_lengths() -> Result<(), CompilationError> {
        let (mut graph, _) = array_sum(false, 1);
        let mut harness = Harness::new(predication());
        harness.apply(&mut graph, &mut LoopPredicationPhase::new())?;
        assert_eq!(harness.statistics.counter("guards-predicated"), 1);

        let elements: Vec<i64> = (1..=6).collect();
        for n in 0..=6usize {
            let execution = execute(&graph, &[Arg::Array(&elements[..n]), Arg::Int(n as i64)]);
            assert!(!execution.outcome.is_deoptimized(), "deoptimized for n = {n}");
            let expected: i64 = elements[..n].iter().sum();
            assert_eq!(execution.outcome.value().and_then(|v| v.as_int()), Some(expected));
        }
        // the hoisted pair still catches loops running past the end of the array
        let execution = execute(&graph, &[Arg::Array(&elements[..2]), Arg::Int(3)]);
        assert!(execution.outcome.is_deoptimized());
        Ok(())
    }

    #[test]
    fn failed_predications_are_not_repeated() -> Result<(), CompilationError> {
        let (mut graph, begin) = array_sum(true, 1);
        let failed = SpeculationReason::new(SpeculationGroup::LoopPredication, MethodId(0), 4)
            .with_detail(9);
        let mut harness = Harness::new(predication());
        harness.log = InMemorySpeculationLog::with_failed([failed]);
        let status = harness.apply(&mut graph, &mut LoopPredicationPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(guards_in_loop(&graph, begin), 1);
        Ok(())
    }

    #[test]
    fn refused_checks_leave_no_limit_guard_behind() -> Result<(), CompilationError> {
        // stepping by 2 towards `n` needs a loop-limit guard before the checks can be hoisted
        let (mut graph, begin) = array_sum(false, 2);
        let original = graph.clone();
        let failed = SpeculationReason::new(SpeculationGroup::LoopPredication, MethodId(0), 4)
            .with_detail(9);
        let mut harness = Harness::new(predication());
        harness.log = InMemorySpeculationLog::with_failed([failed]);
        let status = harness.apply(&mut graph, &mut LoopPredicationPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert!(graph.kind(begin).loop_begin_info().unwrap().overflow_guard.is_none());
        assert_eq!(graph.nodes_matching(|kind| matches!(kind, NodeKind::Guard(_))).len(), 1);
        assert!(harness.log.speculations().is_empty());

        harness.log = InMemorySpeculationLog::new();
        let status = harness.apply(&mut graph, &mut LoopPredicationPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert!(graph.kind(begin).loop_begin_info().unwrap().overflow_guard.is_some());
        assert_eq!(guards_in_loop(&graph, begin), 0);
        let elements: Vec<i64> = (1..=6).collect();
        for n in [0, 1, 2, 5, 6] {
            assert_same_behavior(&original, &graph, &[Arg::Array(&elements), Arg::Int(n)]);
        }
        Ok(())
    }

    #[test]
    fn signed_checks_are_left_alone() -> Result<(), CompilationError> {
        // for (i = 0; i < n; i++) guard(i < 10)
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let ten = b.int(10);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let small = b.less_than(i, ten);
        b.guard(small, DeoptimizationReason::RuntimeConstraint, false);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i)]);
        b.position_at(exit);
        b.return_value(None);

        let mut harness = Harness::new(predication());
        let status = harness.apply(&mut graph, &mut LoopPredicationPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(guards_in_loop(&graph, scaffold.begin), 1);
        Ok(())
    }
}
