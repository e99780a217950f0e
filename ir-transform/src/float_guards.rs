use alloc::vec::Vec;

use seajit_ir::{
    CompilationError, Graph, GraphState, Node, NodeKind, NodeSet, NotApplicable, Phase,
    PhaseContext, PhaseStatus, StageFlags,
};

/// Lowers fixed guards to floating guards anchored at the begin of their block.
///
/// A floating guard is checked as soon as control enters its anchor, so a fixed guard is only
/// floated if that does not make a difference: nothing with a side effect may run between the
/// begin and the guard, and the guard's condition may not depend on a fixed node of the same
/// block. Users of the fixed guard are moved to the floating one.
#[derive(Debug, Default)]
pub struct FloatFixedGuardsPhase;

impl FloatFixedGuardsPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for FloatFixedGuardsPhase {
    fn name(&self) -> &'static str {
        "float-fixed-guards"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::if_any([
            NotApplicable::unless_floating_guards(state),
            NotApplicable::if_applied(StageFlags::HIGH_TIER_LOWERING, state),
        ])
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut changed = false;
        for fixed in graph.nodes_matching(|kind| matches!(kind, NodeKind::FixedGuard(_))) {
            if !graph.is_alive(fixed) {
                continue;
            }
            if let Some(guard) = float_guard(graph, fixed) {
                log::trace!(target: "float-guards", "{fixed} is now floating guard {guard}");
                context.statistics_mut().increment("guards-floated", 1);
                changed = true;
            }
        }
        Ok(PhaseStatus::changed_if(changed))
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        state.add_stage_flag(StageFlags::HIGH_TIER_LOWERING);
    }
}

/// Replace the fixed guard `fixed` by a floating guard anchored at its block's begin, if the
/// check may be performed on entry to the block
fn float_guard(graph: &mut Graph, fixed: Node) -> Option<Node> {
    let info = *graph.kind(fixed).guard_info()?;
    let anchor = graph.prev_begin(fixed);
    let mut current = graph.predecessor(fixed)?;
    while current != anchor {
        if graph.kind(current).has_side_effect() {
            return None;
        }
        current = graph.predecessor(current)?;
    }
    let condition = graph.input(fixed, 0);
    if depends_on_block(graph, condition, anchor) {
        return None;
    }

    let guard = graph.add_guard(condition, anchor, info);
    if let Some(position) = graph.position(fixed) {
        graph.set_position(guard, Some(position));
    }
    graph.replace_at_usages(fixed, guard);
    graph.remove_fixed(fixed);
    graph.delete(fixed);
    Some(guard)
}

/// Returns true if computing `value` requires a fixed node of the block starting at `begin`,
/// other than `begin` itself
fn depends_on_block(graph: &Graph, value: Node, begin: Node) -> bool {
    let mut visited = NodeSet::new();
    let mut worklist: Vec<Node> = alloc::vec![value];
    while let Some(node) = worklist.pop() {
        if !visited.insert(node) {
            continue;
        }
        let kind = graph.kind(node);
        if kind.is_fixed() {
            if !kind.is_begin() && graph.prev_begin(node) == begin {
                return true;
            }
            continue;
        }
        // Phi and proxy values are available when their merge or exit is entered
        if matches!(kind, NodeKind::Phi | NodeKind::ValueProxy) {
            continue;
        }
        worklist.extend(graph.inputs(node).iter().copied());
    }
    false
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{DeoptimizationReason, GraphBuilder, GuardsStage, MethodId, Options};

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior};

    fn floating_guards(graph: &Graph) -> Vec<Node> {
        graph.nodes_matching(|kind| matches!(kind, NodeKind::Guard(_)))
    }

    #[test]
    fn guards_float_to_their_block() -> Result<(), CompilationError> {
        crate::init_logging();
        // guard(i |<| a.length); a[i] = 1; return
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let array = b.array_parameter(0);
        let i = b.int_parameter(1);
        let one = b.int(1);
        let length = b.array_length(array);
        let in_bounds = b.below(i, length);
        let fixed = b.fixed_guard(in_bounds, DeoptimizationReason::BoundsCheckException, false);
        let store = b.store_indexed(array, i, one, Some(fixed));
        b.return_value(None);
        let original = graph.clone();

        let mut harness = Harness::new(Options::none());
        let status = harness.apply(&mut graph, &mut FloatFixedGuardsPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert!(!graph.is_alive(fixed));
        let guards = floating_guards(&graph);
        assert_eq!(guards.len(), 1);
        assert_eq!(graph.guard_anchor(guards[0]), graph.start());
        assert_eq!(graph.input(store, 3), guards[0]);
        assert!(graph.state().is_after_stage(StageFlags::HIGH_TIER_LOWERING));
        for index in [-1, 0, 2, 3] {
            assert_same_behavior(&original, &graph, &[Arg::Array(&[1, 2, 3]), Arg::Int(index)]);
        }
        Ok(())
    }

    #[test]
    fn side_effects_keep_guards_fixed() -> Result<(), CompilationError> {
        // invoke(x); guard(x < 10); return
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let ten = b.int(10);
        b.invoke(3, &[x]);
        let small = b.less_than(x, ten);
        let fixed = b.fixed_guard(small, DeoptimizationReason::RuntimeConstraint, false);
        b.return_value(None);

        let mut harness = Harness::new(Options::none());
        let status = harness.apply(&mut graph, &mut FloatFixedGuardsPhase::new())?;
        assert_eq!(status, PhaseStatus::Unchanged);
        assert!(graph.is_alive(fixed));
        assert!(floating_guards(&graph).is_empty());
        Ok(())
    }

    #[test]
    fn guards_on_loaded_values_stay_fixed() -> Result<(), CompilationError> {
        // v = a[0]; guard(v < 10); return v
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let array = b.array_parameter(0);
        let zero = b.int(0);
        let ten = b.int(10);
        let value = b.load_indexed(array, zero, None);
        let small = b.less_than(value, ten);
        let fixed = b.fixed_guard(small, DeoptimizationReason::RuntimeConstraint, false);
        b.return_value(Some(value));

        let mut harness = Harness::new(Options::none());
        harness.apply(&mut graph, &mut FloatFixedGuardsPhase::new())?;
        assert!(graph.is_alive(fixed));
        Ok(())
    }

    #[test]
    fn floating_requires_the_floating_guards_stage() {
        let mut graph = Graph::new(MethodId(0));
        graph.state_mut().set_guards_stage(GuardsStage::FixedDeopts);
        let mut harness = Harness::new(Options::none());
        let result = harness.apply(&mut graph, &mut FloatFixedGuardsPhase::new());
        assert!(matches!(result, Err(CompilationError::PhaseNotApplicable { .. })));
    }
}
