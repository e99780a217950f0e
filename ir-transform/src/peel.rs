use alloc::{format, vec::Vec};

use seajit_ir::{
    CompilationError, FxHashMap, Graph, GraphState, Loop, NodeKind, NotApplicable, Phase,
    PhaseContext, PhaseStatus, SmallVec, StageFlags,
};
use seajit_ir_analysis::LoopsData;

use crate::{
    DefaultLoopPolicies, LoopFragment, LoopPolicies,
    fragment::{clone_nodes, link_nodes, merge_exit_paths},
};

/// Peel the first iteration of `lp` off the loop.
///
/// A copy of the loop body is placed in front of the loop, with the loop header replaced by a
/// plain begin, every loop phi replaced by the value it has on entry, and every loop end
/// replaced by an `End` which now enters the loop. The loop phis are re-initialized with the
/// values computed by the peeled iteration. Each exit of the peeled iteration is merged with
/// the corresponding exit of the loop.
///
/// Peeling never changes the shape of the loop itself, so a counted loop stays counted: only
/// its initial values change.
///
/// Fails if the graph is past the point where loops may be duplicated.
pub fn peel(graph: &mut Graph, loops: &LoopsData, lp: Loop) -> Result<(), CompilationError> {
    check_duplication_allowed(graph.state(), "loop peeling")?;
    let fragment = LoopFragment::new(graph, loops, lp);
    let begin = fragment.begin();
    let first = graph
        .next(begin)
        .ok_or_else(|| CompilationError::InvalidGraph(format!("loop {begin} has no body")))?;
    let loop_ends: SmallVec<[_; 2]> = SmallVec::from_slice(graph.loop_ends(begin));
    let phis = graph.phis(begin);
    log::debug!(target: "loop-peeling", "peeling {begin} ({} nodes)", fragment.len());

    let mut map = FxHashMap::default();
    let entry = graph.add(NodeKind::Begin, &[]);
    graph.set_position(entry, graph.position(begin));
    map.insert(begin, entry);
    for phi in phis.iter() {
        map.insert(*phi, graph.phi_value_at(*phi, 0));
    }
    let mut exits: SmallVec<[_; 2]> = SmallVec::new();
    for &exit in fragment.exits() {
        let copy = graph.add(NodeKind::Begin, &[]);
        graph.set_position(copy, graph.position(exit));
        map.insert(exit, copy);
        exits.push((exit, copy));
    }
    let mut backedges: SmallVec<[_; 2]> = SmallVec::new();
    for &loop_end in loop_ends.iter() {
        let end = graph.add(NodeKind::End, &[]);
        map.insert(loop_end, end);
        backedges.push(end);
    }

    let body: Vec<_> = fragment.nodes().iter().copied().filter(|n| !map.contains_key(n)).collect();
    clone_nodes(graph, &body, &mut map);
    link_nodes(graph, &body, &map);
    graph.set_next(entry, Some(map[&first]));

    // Run the peeled iteration instead of entering the loop...
    let forward_end = graph.forward_end(begin);
    graph.replace_at_predecessor(forward_end, Some(entry));

    // ...and enter the loop with the values it computed
    let mapped = |node| map.get(&node).copied().unwrap_or(node);
    let entry_end = if let [single] = backedges.as_slice() {
        for phi in phis.iter() {
            let value = mapped(graph.phi_value_at(*phi, 1));
            graph.set_phi_value(*phi, 0, value);
        }
        *single
    } else {
        let merge = graph.add(NodeKind::Merge, &backedges);
        for phi in phis.iter() {
            let mut inputs: SmallVec<[_; 4]> = SmallVec::new();
            inputs.push(merge);
            inputs.extend(graph.phi_values(*phi)[1..].iter().map(|value| mapped(*value)));
            let value = graph.add(NodeKind::Phi, &inputs);
            graph.set_phi_value(*phi, 0, value);
        }
        let end = graph.add(NodeKind::End, &[]);
        graph.set_next(merge, Some(end));
        end
    };
    graph.set_input(begin, 0, entry_end);
    graph.delete(forward_end);

    for (exit, copy) in exits {
        merge_exit_paths(graph, exit, copy, &map);
    }

    if let Some(info) = graph.kind_mut(begin).loop_begin_info_mut() {
        info.peeled += 1;
        info.loop_frequency = (info.loop_frequency - 1.0).max(1.0);
    }
    Ok(())
}

pub(crate) fn check_duplication_allowed(
    state: &GraphState,
    transformation: &'static str,
) -> Result<(), CompilationError> {
    if state.allows_loop_duplication() {
        Ok(())
    } else {
        Err(CompilationError::precondition(
            transformation,
            format!("loops may not be duplicated after {:?}", state.stage_flags()),
        ))
    }
}

/// Peels the first iteration of loops chosen by a [LoopPolicies].
///
/// Every pass recomputes the loops of the graph and peels each loop the policies approve of; the
/// number of passes is capped by [seajit_ir::Options::peeling_iterations].
pub struct LoopPeelingPhase<P = DefaultLoopPolicies> {
    policies: P,
}

impl LoopPeelingPhase {
    pub fn new() -> Self {
        Self::with_policies(DefaultLoopPolicies)
    }
}

impl Default for LoopPeelingPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LoopPolicies> LoopPeelingPhase<P> {
    pub fn with_policies(policies: P) -> Self {
        Self { policies }
    }
}

impl<P: LoopPolicies> Phase for LoopPeelingPhase<P> {
    fn name(&self) -> &'static str {
        "loop-peeling"
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
        for iteration in 0..context.options().peeling_iterations {
            let loops = LoopsData::compute(graph);
            let candidates: Vec<_> = loops
                .inner_first()
                .into_iter()
                .filter(|lp| self.policies.should_peel(graph, &loops, *lp, context.options()))
                .map(|lp| loops.loop_ex(lp).begin())
                .collect();
            if candidates.is_empty() {
                break;
            }
            log::debug!(
                target: "loop-peeling",
                "pass {iteration}: {} candidates",
                candidates.len()
            );
            for begin in candidates {
                // Each peel adds blocks, so the loops are recomputed for every candidate
                let mut loops = LoopsData::compute(graph);
                let Some(lp) = loops.loop_for_begin(begin).map(|lp| lp.id()) else {
                    continue;
                };
                loops.detect_counted_loops(graph);
                peel(graph, &loops, lp)?;
                context.statistics_mut().increment("loops-peeled", 1);
                status = PhaseStatus::Changed;
            }
        }
        Ok(status)
    }
}
