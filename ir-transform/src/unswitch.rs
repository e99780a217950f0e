use alloc::{format, vec::Vec};

use seajit_ir::{
    CompilationError, Graph, GraphState, Loop, Node, NodeKind, NotApplicable, Phase, PhaseContext,
    PhaseStatus, SmallVec, StageFlags,
};
use seajit_ir_analysis::LoopsData;

use crate::{
    DefaultLoopPolicies, LoopFragment, LoopPolicies, fragment::merge_exit_paths,
    peel::check_duplication_allowed,
};

/// The `If` nodes of `lp` which branch on a loop-invariant condition without leaving the loop,
/// grouped by condition, in node order
fn invariant_splits(
    graph: &Graph,
    loops: &LoopsData,
    lp: Loop,
) -> Vec<(Node, SmallVec<[Node; 2]>)> {
    let inside = loops.inside(graph, lp);
    let mut groups: Vec<(Node, SmallVec<[Node; 2]>)> = Vec::new();
    let mut controls: Vec<Node> = inside
        .iter()
        .filter(|node| matches!(graph.kind(*node), NodeKind::If { .. }))
        .collect();
    controls.sort_unstable();
    for control in controls {
        let condition = graph.input(control, 0);
        if inside.contains(condition) || graph.as_logic_constant(condition).is_some() {
            continue;
        }
        let stays = graph.successors(control).all(|succ| inside.contains(succ));
        if !stays {
            continue;
        }
        match groups.iter_mut().find(|(c, _)| *c == condition) {
            Some((_, group)) => group.push(control),
            None => groups.push((condition, SmallVec::from_slice(&[control]))),
        }
    }
    groups
}

/// Unswitch `lp` on the shared condition of `controls`.
///
/// The loop is duplicated, and the condition tested once before entering either copy: the
/// original loop runs when it holds, the copy when it does not. In each copy, `controls` are
/// left branching on a constant, for the canonicalizer to fold. The exits of both copies are
/// merged. Returns the loop begin of the copy.
pub fn unswitch(
    graph: &mut Graph,
    loops: &LoopsData,
    lp: Loop,
    controls: &[Node],
) -> Result<Node, CompilationError> {
    const TRANSFORMATION: &str = "loop unswitching";

    check_duplication_allowed(graph.state(), TRANSFORMATION)?;
    let Some(&first) = controls.first() else {
        return Err(CompilationError::precondition(TRANSFORMATION, "no control to unswitch on"));
    };
    let condition = graph.input(first, 0);
    let inside = loops.inside(graph, lp);
    if inside.contains(condition) {
        return Err(CompilationError::precondition(
            TRANSFORMATION,
            format!("the condition of {first} is not loop-invariant"),
        ));
    }
    for &control in controls {
        if !inside.contains(control)
            || !matches!(graph.kind(control), NodeKind::If { .. })
            || graph.input(control, 0) != condition
        {
            return Err(CompilationError::precondition(
                TRANSFORMATION,
                format!("{control} is not an `If` of the loop on {condition}"),
            ));
        }
    }

    let fragment = LoopFragment::new(graph, loops, lp);
    let begin = fragment.begin();
    let true_probability = match graph.kind(first) {
        NodeKind::If { true_probability } => *true_probability,
        _ => 0.5,
    };
    log::debug!(
        target: "loop-unswitch",
        "unswitching {begin} on {condition} ({} splits)",
        controls.len()
    );

    // Test the condition once, ahead of the loop
    let forward_end = graph.forward_end(begin);
    let split = graph.add(NodeKind::If { true_probability }, &[condition]);
    graph.set_position(split, graph.position(first));
    let on_true = graph.add(NodeKind::Begin, &[]);
    let on_false = graph.add(NodeKind::Begin, &[]);
    graph.replace_at_predecessor(forward_end, Some(split));
    graph.set_successor(split, 0, Some(on_true));
    graph.set_successor(split, 1, Some(on_false));
    graph.set_next(on_true, Some(forward_end));

    let copy_entry = graph.add(NodeKind::End, &[]);
    graph.set_next(on_false, Some(copy_entry));
    let copy = fragment.duplicate(graph, copy_entry);

    let yes = graph.logic_constant(true);
    let no = graph.logic_constant(false);
    for &control in controls {
        graph.set_input(control, 0, yes);
        graph.set_input(copy.mapped(control), 0, no);
    }

    for &exit in fragment.exits() {
        merge_exit_paths(graph, exit, copy.mapped(exit), copy.map());
    }

    for node in [begin, copy.begin()] {
        if let Some(info) = graph.kind_mut(node).loop_begin_info_mut() {
            info.unswitches += 1;
        }
    }
    Ok(copy.begin())
}

/// Unswitches loops on loop-invariant conditions, as chosen by a [LoopPolicies].
///
/// Every loop is considered once per run, on the first of its invariant conditions the
/// policies approve of. Copies created by the run are not considered again until the next.
pub struct LoopUnswitchingPhase<P = DefaultLoopPolicies> {
    policies: P,
}

impl LoopUnswitchingPhase {
    pub fn new() -> Self {
        Self::with_policies(DefaultLoopPolicies)
    }
}

impl Default for LoopUnswitchingPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LoopPolicies> LoopUnswitchingPhase<P> {
    pub fn with_policies(policies: P) -> Self {
        Self { policies }
    }
}

impl<P: LoopPolicies> Phase for LoopUnswitchingPhase<P> {
    fn name(&self) -> &'static str {
        "loop-unswitching"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::unless_run_before(StageFlags::VALUE_PROXY_REMOVAL | StageFlags::FSA, state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let begins: Vec<Node> = {
            let loops = LoopsData::compute(graph);
            loops.inner_first().into_iter().map(|lp| loops.loop_ex(lp).begin()).collect()
        };
        let mut status = PhaseStatus::Unchanged;
        for begin in begins {
            if !graph.is_alive(begin) {
                continue;
            }
            let loops = LoopsData::compute(graph);
            let Some(lp) = loops.loop_for_begin(begin).map(|lp| lp.id()) else {
                continue;
            };
            let chosen = invariant_splits(graph, &loops, lp).into_iter().find(|(_, controls)| {
                self.policies.should_unswitch(graph, &loops, lp, controls, context.options())
            });
            let Some((_, controls)) = chosen else {
                continue;
            };
            unswitch(graph, &loops, lp, &controls)?;
            context.statistics_mut().increment("loops-unswitched", 1);
            status = PhaseStatus::Changed;
        }
        Ok(status)
    }
}
