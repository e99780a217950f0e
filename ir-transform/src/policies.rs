use seajit_ir::{Graph, Loop, LoopKind, Node, Options};
use seajit_ir_analysis::LoopsData;

/// The decisions of whether a loop transformation is worth its code size.
///
/// Loop phases only ask these questions about loops they have already proven the
/// transformation to be legal for.
pub trait LoopPolicies {
    fn should_peel(&self, graph: &Graph, loops: &LoopsData, lp: Loop, options: &Options) -> bool;

    fn should_full_unroll(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        options: &Options,
    ) -> bool;

    fn should_partial_unroll(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        options: &Options,
    ) -> bool;

    /// Whether unswitching `lp` on the condition controlling each of `controls` pays off
    fn should_unswitch(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        controls: &[Node],
        options: &Options,
    ) -> bool;
}

/// Size- and count-based policies, with every threshold taken from [Options]
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultLoopPolicies;

impl LoopPolicies for DefaultLoopPolicies {
    /// Peel innermost loops with a phi which is loop-invariant after the first iteration: all of
    /// its backedge values are computed outside the loop. Such a phi is typically a "first
    /// iteration" flag, or a value cached on the first iteration, and peeling makes every
    /// later iteration see a single value.
    fn should_peel(&self, graph: &Graph, loops: &LoopsData, lp: Loop, options: &Options) -> bool {
        if !options.loop_peeling || !loops.is_innermost(lp) {
            return false;
        }
        let begin = loops.loop_ex(lp).begin();
        let Some(info) = graph.kind(begin).loop_begin_info() else {
            return false;
        };
        if info.peeled >= options.max_peel_count || info.kind != LoopKind::Regular {
            return false;
        }
        let size = loops.inside(graph, lp).len();
        if size > options.peeling_max_nodes {
            log::trace!(target: "loop-policies", "{begin}: too large to peel ({size} nodes)");
            return false;
        }
        graph.phis(begin).iter().any(|phi| {
            graph.phi_values(*phi)[1..]
                .iter()
                .all(|value| *value != *phi && loops.is_invariant(graph, lp, *value))
        })
    }

    fn should_full_unroll(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        options: &Options,
    ) -> bool {
        if !options.full_unroll {
            return false;
        }
        let Some(counted) = loops.loop_ex(lp).counted() else {
            return false;
        };
        let Some(trip_count) = counted.constant_max_trip_count(graph) else {
            return false;
        };
        if trip_count > options.full_unroll_max_iterations {
            return false;
        }
        let size = loops.inside(graph, lp).len();
        (size as u64).saturating_mul(trip_count.max(1)) <= options.full_unroll_max_nodes as u64
    }

    fn should_partial_unroll(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        options: &Options,
    ) -> bool {
        if !options.partial_unroll || options.unroll_factor < 2 || !loops.is_innermost(lp) {
            return false;
        }
        let Some(counted) = loops.loop_ex(lp).counted() else {
            return false;
        };
        // A loop known to run only a few times gains nothing from a main loop
        if let Some(trip_count) = counted.constant_max_trip_count(graph) {
            if trip_count <= options.unroll_factor as u64 {
                return false;
            }
        }
        let size = loops.inside(graph, lp).len();
        size.saturating_mul(options.unroll_factor as usize) <= options.partial_unroll_max_nodes
    }

    fn should_unswitch(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        controls: &[Node],
        options: &Options,
    ) -> bool {
        if !options.loop_unswitch || controls.is_empty() {
            return false;
        }
        let begin = loops.loop_ex(lp).begin();
        let unswitches = graph.kind(begin).loop_begin_info().map_or(0, |info| info.unswitches);
        if unswitches >= options.max_unswitches {
            return false;
        }
        let size = loops.inside(graph, lp).len();
        log::trace!(
            target: "loop-policies",
            "{begin}: unswitching on {} splits would copy {size} nodes",
            controls.len()
        );
        size <= options.unswitch_max_nodes
    }
}
