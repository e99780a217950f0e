use alloc::vec::Vec;

use seajit_ir::{
    CompilationError, DeoptInfo, Graph, GraphState, GuardInfo, Node, NodeKind, NotApplicable,
    Phase, PhaseContext, PhaseStatus, SmallVec, StageFlags,
};

/// Turns control flow which only leads to a `Deoptimize` into fixed guards.
///
/// Starting at each `Deoptimize`, the phase walks up the control-flow chain as long as nothing
/// observable happens on the way. When it reaches the `If` deciding whether the deoptimization
/// happens, the `If` is replaced by a `FixedGuard` on the same condition, which deoptimizes on
/// the branch that led to the `Deoptimize`, and that branch is removed. When it reaches a
/// merge instead, each predecessor of the merge gets its own `Deoptimize`, and is handled
/// separately.
///
/// The walk stops at side effects, loop boundaries, and OSR entries: moving a deoptimization
/// above any of them would change what the interpreter observes when it resumes.
///
/// Before converting, a single sweep looks for fixed guards directly following a merge, whose
/// condition is known to fail for the constant values some predecessors supply to the merge's
/// phis. Those predecessors deoptimize right away, which gives the conversion more to work
/// with.
#[derive(Debug, Default)]
pub struct ConvertDeoptimizeToGuardPhase;

impl ConvertDeoptimizeToGuardPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for ConvertDeoptimizeToGuardPhase {
    fn name(&self) -> &'static str {
        "convert-deoptimize-to-guard"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::unless_run_before(StageFlags::FSA, state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut changed = false;
        for guard in graph.nodes_matching(|kind| matches!(kind, NodeKind::FixedGuard(_))) {
            if graph.is_alive(guard) {
                let split = deoptimize_failing_predecessors(graph, guard);
                context.statistics_mut().increment("merge-predecessors-deoptimized", split as u64);
                changed |= split > 0;
            }
        }

        let mut worklist = graph.nodes_matching(|kind| matches!(kind, NodeKind::Deoptimize(_)));
        worklist.reverse();
        while let Some(deopt) = worklist.pop() {
            if !graph.is_alive(deopt) {
                continue;
            }
            match convert(graph, deopt) {
                Conversion::Unchanged => (),
                Conversion::Guarded(guard) => {
                    log::debug!(target: "convert-deopt", "{deopt} became fixed guard {guard}");
                    context.statistics_mut().increment("deopts-converted", 1);
                    changed = true;
                }
                Conversion::Split(deopts) => {
                    log::trace!(target: "convert-deopt", "{deopt} split into {deopts:?}");
                    worklist.extend(deopts);
                    changed = true;
                }
            }
        }
        Ok(PhaseStatus::changed_if(changed))
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        state.add_stage_flag(StageFlags::CONVERT_DEOPT_TO_GUARD);
    }
}

enum Conversion {
    Unchanged,
    /// The deoptimization is now performed by this fixed guard
    Guarded(Node),
    /// The deoptimization was duplicated into each predecessor of a merge
    Split(SmallVec<[Node; 2]>),
}

/// Walk up from `deopt` to the control-flow decision it depends on, and rewrite that decision
fn convert(graph: &mut Graph, deopt: Node) -> Conversion {
    let NodeKind::Deoptimize(info) = *graph.kind(deopt) else {
        return Conversion::Unchanged;
    };
    let mut current = deopt;
    loop {
        let kind = graph.kind(current);
        if kind.has_side_effect() {
            return Conversion::Unchanged;
        }
        match kind {
            NodeKind::Begin => {
                let Some(pred) = graph.predecessor(current) else {
                    return Conversion::Unchanged;
                };
                if graph.kind(pred).is_control_split() {
                    let position = graph.position(deopt);
                    return Conversion::Guarded(replace_split(graph, pred, current, info, position));
                }
                current = pred;
            }
            NodeKind::Merge => return split_at_merge(graph, current, info),
            NodeKind::Start | NodeKind::LoopBegin(_) | NodeKind::LoopExit(_) => {
                return Conversion::Unchanged;
            }
            _ => match graph.predecessor(current) {
                Some(pred) => current = pred,
                None => return Conversion::Unchanged,
            },
        }
    }
}

/// Replace the `If` `split` by a fixed guard, where `dead` is the successor of `split` which
/// leads to a deoptimization described by `deopt_info`.
///
/// The guard takes the source position of the deoptimization, if it has one.
fn replace_split(
    graph: &mut Graph,
    split: Node,
    dead: Node,
    deopt_info: DeoptInfo,
    position: Option<u32>,
) -> Node {
    let condition = graph.input(split, 0);
    let dead_is_true = graph.true_successor(split) == Some(dead);
    let survivor = if dead_is_true {
        graph.false_successor(split)
    } else {
        graph.true_successor(split)
    };
    let info = GuardInfo::new(deopt_info.reason, deopt_info.action)
        .negated(dead_is_true)
        .with_speculation(deopt_info.speculation);
    let guard = graph.add(NodeKind::FixedGuard(info), &[condition]);
    graph.set_position(guard, position.or(graph.position(split)));

    graph.set_successor(split, 0, None);
    graph.set_successor(split, 1, None);
    graph.replace_at_predecessor(split, Some(guard));
    graph.set_next(guard, survivor);
    graph.delete(split);
    graph.kill_cfg(dead);
    guard
}

/// Move the deoptimization after `merge` into each of its predecessors
fn split_at_merge(graph: &mut Graph, merge: Node, info: DeoptInfo) -> Conversion {
    let ends: SmallVec<[Node; 2]> = SmallVec::from_slice(graph.ends(merge));
    let mut deopts = SmallVec::new();
    for end in ends {
        deopts.push(deoptimize_end(graph, merge, end, info));
    }
    graph.kill_cfg(merge);
    Conversion::Split(deopts)
}

/// Replace `end` of `merge` by a `Deoptimize`, and remove it from the merge
fn deoptimize_end(graph: &mut Graph, merge: Node, end: Node, info: DeoptInfo) -> Node {
    let deopt = graph.add(NodeKind::Deoptimize(info), &[]);
    graph.set_position(deopt, graph.position(merge));
    graph.replace_at_predecessor(end, Some(deopt));
    graph.remove_end(merge, end);
    graph.delete(end);
    deopt
}

/// If `guard` directly follows a merge, deoptimize in every predecessor of the merge for
/// which the guard's condition is a constant that fails the guard. Returns the number of
/// predecessors rewritten.
fn deoptimize_failing_predecessors(graph: &mut Graph, guard: Node) -> usize {
    let NodeKind::FixedGuard(info) = *graph.kind(guard) else {
        return 0;
    };
    let Some(merge) = graph.predecessor(guard) else {
        return 0;
    };
    if !matches!(graph.kind(merge), NodeKind::Merge) {
        return 0;
    }
    let condition = graph.input(guard, 0);
    if !graph.kind(condition).is_compare() {
        return 0;
    }
    let (x, y) = (graph.input(condition, 0), graph.input(condition, 1));
    let bits = graph.bits(x);
    let view: &Graph = graph;
    let value_on = |node: Node, index: usize| {
        if matches!(view.kind(node), NodeKind::Phi) && view.phi_merge(node) == merge {
            view.as_constant(view.phi_value_at(node, index))
        } else {
            view.as_constant(node)
        }
    };
    let failing: Vec<Node> = view
        .ends(merge)
        .iter()
        .enumerate()
        .filter(|(index, _)| {
            let (Some(x), Some(y)) = (value_on(x, *index), value_on(y, *index)) else {
                return false;
            };
            view.kind(condition).fold_compare(bits, x, y).is_some_and(|value| info.fails_on(value))
        })
        .map(|(_, end)| *end)
        .collect();
    if failing.is_empty() {
        return 0;
    }

    let deopt_info = DeoptInfo {
        reason: info.reason,
        action: info.action,
        speculation: info.speculation,
    };
    for &end in failing.iter() {
        let deopt = deoptimize_end(graph, merge, end, deopt_info);
        log::trace!(target: "convert-deopt", "{guard} always fails coming from {end}, now {deopt}");
    }
    if graph.ends(merge).is_empty() {
        graph.kill_cfg(merge);
    }
    failing.len()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{
        DeoptimizationAction, DeoptimizationReason, GraphBuilder, MethodId, Options, verify,
    };

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior};

    fn count(graph: &Graph, predicate: impl Fn(&NodeKind) -> bool) -> usize {
        graph.nodes_matching(predicate).len()
    }

    fn is_deopt(kind: &NodeKind) -> bool {
        matches!(kind, NodeKind::Deoptimize(_))
    }

    /// `for (i = 0; i < n; i++) { if (x < 0) deoptimize(); sum += i }; return sum`
    fn deopt_in_loop() -> (Graph, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let n = b.int_parameter(1);
        let zero = b.int(0);
        let one = b.int(1);
        let negative = b.less_than(x, zero);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let sum = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let (t, f) = b.branch(negative, 0.01);
        b.position_at(t);
        b.set_bytecode_position(Some(17));
        b.deoptimize(
            DeoptimizationReason::RuntimeConstraint,
            DeoptimizationAction::InvalidateReprofile,
        );
        b.set_bytecode_position(None);
        b.position_at(f);
        let next_sum = b.add(sum, i);
        let next_i = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next_i), (sum, next_sum)]);
        b.position_at(exit);
        let result = b.proxy(sum, exit);
        b.return_value(Some(result));
        (graph, negative)
    }

    #[test]
    fn deoptimizing_branches_become_guards() -> Result<(), CompilationError> {
        crate::init_logging();
        let (mut graph, negative) = deopt_in_loop();
        let original = graph.clone();
        let mut options = Options::none();
        options.set_verify_graphs(true);
        let mut harness = Harness::new(options);
        let status = harness.apply(&mut graph, &mut ConvertDeoptimizeToGuardPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert_eq!(count(&graph, is_deopt), 0);
        assert!(graph.state().is_after_stage(StageFlags::CONVERT_DEOPT_TO_GUARD));

        let guards = graph.nodes_matching(|kind| matches!(kind, NodeKind::FixedGuard(_)));
        assert_eq!(guards.len(), 1);
        let guard = guards[0];
        assert_eq!(graph.input(guard, 0), negative);
        let info = graph.guard_info(guard);
        assert!(info.negated);
        assert_eq!(info.reason, DeoptimizationReason::RuntimeConstraint);
        assert_eq!(graph.position(guard), Some(17));
        for (x, n) in [(1, 0), (1, 4), (-1, 0), (-1, 4)] {
            assert_same_behavior(&original, &graph, &[Arg::Int(x), Arg::Int(n)]);
        }
        Ok(())
    }

    #[test]
    fn deopts_after_merges_are_split() -> Result<(), CompilationError> {
        // if (x < 0) { invoke(1) } else { }; deoptimize()
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let zero = b.int(0);
        let negative = b.less_than(x, zero);
        let (t, f) = b.branch(negative, 0.5);
        b.position_at(t);
        b.invoke(1, &[x]);
        let t_end = b.end();
        b.position_at(f);
        let f_end = b.end();
        b.merge(&[t_end, f_end]);
        b.deoptimize(
            DeoptimizationReason::UnreachedCode,
            DeoptimizationAction::InvalidateReprofile,
        );
        let original = graph.clone();

        let mut harness = Harness::new(Options::none());
        harness.apply(&mut graph, &mut ConvertDeoptimizeToGuardPhase::new())?;
        verify::verify(&graph)?;
        assert_eq!(count(&graph, |kind| matches!(kind, NodeKind::Merge)), 0);
        // the call must still be made before deoptimizing
        assert_eq!(count(&graph, is_deopt), 1);
        assert_eq!(count(&graph, |kind| matches!(kind, NodeKind::FixedGuard(_))), 1);
        for x in [-3, 3] {
            assert_same_behavior(&original, &graph, &[Arg::Int(x)]);
        }
        Ok(())
    }

    #[test]
    fn constant_phi_inputs_deoptimize_early() -> Result<(), CompilationError> {
        // p = x < 0 ? 1 : 2; guard(p != 1); return x
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let two = b.int(2);
        let negative = b.less_than(x, zero);
        let (t, f) = b.branch(negative, 0.5);
        b.position_at(t);
        let t_end = b.end();
        b.position_at(f);
        let f_end = b.end();
        let merge = b.merge(&[t_end, f_end]);
        let p = b.phi(merge, &[one, two]);
        let is_one = b.equals(p, one);
        b.fixed_guard(is_one, DeoptimizationReason::ClassCastException, true);
        b.return_value(Some(x));
        let original = graph.clone();

        let mut harness = Harness::new(Options::none());
        harness.apply(&mut graph, &mut ConvertDeoptimizeToGuardPhase::new())?;
        verify::verify(&graph)?;
        assert_eq!(harness.statistics.counter("merge-predecessors-deoptimized"), 1);
        assert_eq!(count(&graph, is_deopt), 0);
        let on_negative = graph
            .nodes_matching(|kind| matches!(kind, NodeKind::FixedGuard(_)))
            .into_iter()
            .filter(|guard| graph.input(*guard, 0) == negative)
            .collect::<Vec<_>>();
        assert_eq!(on_negative.len(), 1);
        assert!(graph.guard_info(on_negative[0]).negated);
        for x in [-3, 0, 3] {
            assert_same_behavior(&original, &graph, &[Arg::Int(x)]);
        }
        Ok(())
    }

    #[test]
    fn osr_entries_stop_the_walk() -> Result<(), CompilationError> {
        // if (x < 0) { monitor_enter(osr); deoptimize() }
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let zero = b.int(0);
        let negative = b.less_than(x, zero);
        let (t, f) = b.branch(negative, 0.5);
        b.position_at(t);
        b.monitor_enter(x, true);
        b.deoptimize(DeoptimizationReason::TransferToInterpreter, DeoptimizationAction::None);
        b.position_at(f);
        b.return_value(Some(x));

        let mut harness = Harness::new(Options::none());
        let status = harness.apply(&mut graph, &mut ConvertDeoptimizeToGuardPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert_eq!(count(&graph, is_deopt), 1);
        Ok(())
    }
}
