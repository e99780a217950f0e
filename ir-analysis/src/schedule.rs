use seajit_ir::{Block, ControlFlowGraph, FxHashMap, Graph, Node, NodeKind};

/// Computes the earliest block each floating node may be scheduled in: the deepest block,
/// in the dominator tree, among the blocks its inputs are available in.
///
/// Results are cached, so the schedule must be cleared (or the affected nodes invalidated)
/// when nodes are rewired. A schedule is only meaningful together with the [ControlFlowGraph]
/// it was computed against.
#[derive(Default)]
pub struct EarliestSchedule {
    cache: FxHashMap<Node, Block>,
}

impl EarliestSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Forget the block computed for `node`, e.g. after one of its inputs changed.
    ///
    /// Cached results of nodes using `node` are not affected.
    pub fn invalidate(&mut self, node: Node) {
        self.cache.remove(&node);
    }

    pub fn earliest(&mut self, graph: &Graph, cfg: &ControlFlowGraph, node: Node) -> Block {
        if let Some(block) = self.cache.get(&node) {
            return *block;
        }
        let block = self.compute(graph, cfg, node);
        self.cache.insert(node, block);
        block
    }

    /// The earliest block the check of `guard` could be performed in, i.e. where its
    /// condition becomes available, regardless of where it is currently anchored.
    pub fn earliest_for_guard(
        &mut self,
        graph: &Graph,
        cfg: &ControlFlowGraph,
        guard: Node,
    ) -> Block {
        self.earliest(graph, cfg, graph.guard_condition(guard))
    }

    fn compute(&mut self, graph: &Graph, cfg: &ControlFlowGraph, node: Node) -> Block {
        let block_of = |node: Node| cfg.block_for(node).unwrap_or(cfg.entry());
        if graph.is_fixed(node) {
            return block_of(node);
        }
        match graph.kind(node) {
            NodeKind::Phi => block_of(graph.phi_merge(node)),
            NodeKind::ValueProxy => block_of(graph.input(node, 1)),
            NodeKind::Guard(_) => block_of(graph.guard_anchor(node)),
            NodeKind::InstanceOf { .. } if graph.inputs(node).len() > 1 => {
                let object = self.earliest(graph, cfg, graph.input(node, 0));
                cfg.deeper(object, block_of(graph.input(node, 1)))
            }
            _ => {
                let mut earliest = cfg.entry();
                for &input in graph.inputs(node) {
                    let block = self.earliest(graph, cfg, input);
                    earliest = cfg.deeper(earliest, block);
                }
                earliest
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{DeoptimizationReason, GraphBuilder, MethodId};

    use super::*;

    #[test]
    fn floating_nodes_follow_their_inputs() {
        crate::init_logging();
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let invariant = b.less_than(zero, n);
        let guard = b.guard(invariant, DeoptimizationReason::RuntimeConstraint, false);
        let next = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next)]);
        b.position_at(exit);
        b.return_value(None);

        let cfg = ControlFlowGraph::compute(&graph);
        let mut schedule = EarliestSchedule::new();
        let header = cfg.block_for(scaffold.begin).unwrap();
        assert_eq!(schedule.earliest(&graph, &cfg, n), cfg.entry());
        assert_eq!(schedule.earliest(&graph, &cfg, invariant), cfg.entry());
        assert_eq!(schedule.earliest(&graph, &cfg, next), header);
        assert_eq!(schedule.earliest(&graph, &cfg, cond), header);
        // The guard itself stays where it is anchored, but its check could move to the entry
        let anchor = cfg.block_for(graph.guard_anchor(guard)).unwrap();
        assert_eq!(schedule.earliest(&graph, &cfg, guard), anchor);
        assert_ne!(anchor, cfg.entry());
        assert_eq!(schedule.earliest_for_guard(&graph, &cfg, guard), cfg.entry());
    }
}
