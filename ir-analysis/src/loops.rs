//! Loop-level views over a [ControlFlowGraph].
//!
//! [LoopsData] pairs each natural loop of the control-flow graph with the node-level facts loop
//! transformations need: which nodes belong to the loop body, its induction variables, and
//! whether it is counted. Body sets and induction variables are computed lazily on first use,
//! and must be invalidated (or the whole structure recomputed) after the graph changes.
use alloc::vec::Vec;
use core::cell::OnceCell;

use cranelift_entity::EntityRef;
use seajit_ir::{
    ControlFlowGraph, FxHashMap, Graph, Loop, LoopKind, Node, NodeKind, NodeSet, SmallVec,
};

use crate::{CountedLoopInfo, InductionVariables};

/// A loop of the control-flow graph, extended with lazily computed node-level information
pub struct LoopEx {
    lp: Loop,
    begin: Node,
    inside: OnceCell<NodeSet>,
    ivs: OnceCell<InductionVariables>,
    counted: Option<CountedLoopInfo>,
}

impl LoopEx {
    #[inline]
    pub fn id(&self) -> Loop {
        self.lp
    }

    #[inline]
    pub fn begin(&self) -> Node {
        self.begin
    }

    /// The counted-loop facts of this loop, if [LoopsData::detect_counted_loops] proved it
    /// counted
    #[inline]
    pub fn counted(&self) -> Option<&CountedLoopInfo> {
        self.counted.as_ref()
    }

    #[inline]
    pub fn is_counted(&self) -> bool {
        self.counted.is_some()
    }

    pub fn loop_ends<'g>(&self, graph: &'g Graph) -> &'g [Node] {
        graph.loop_ends(self.begin)
    }

    pub fn exits(&self, graph: &Graph) -> SmallVec<[Node; 2]> {
        graph.loop_exits(self.begin)
    }

    pub fn kind(&self, graph: &Graph) -> LoopKind {
        graph.kind(self.begin).loop_begin_info().map(|info| info.kind).unwrap_or_default()
    }
}

/// Every loop of a graph, with node-level information
pub struct LoopsData {
    cfg: ControlFlowGraph,
    loops: Vec<LoopEx>,
    by_begin: FxHashMap<Node, Loop>,
}

impl LoopsData {
    /// Compute the control-flow graph of `graph` and the loops it contains
    pub fn compute(graph: &Graph) -> Self {
        let cfg = ControlFlowGraph::compute(graph);
        let mut loops = Vec::with_capacity(cfg.num_loops());
        let mut by_begin = FxHashMap::default();
        for lp in cfg.loops() {
            let begin = cfg.block(cfg.loop_data(lp).header()).begin();
            debug_assert_eq!(lp.index(), loops.len());
            by_begin.insert(begin, lp);
            loops.push(LoopEx {
                lp,
                begin,
                inside: OnceCell::new(),
                ivs: OnceCell::new(),
                counted: None,
            });
        }
        log::trace!(target: "loops", "found {} loops", loops.len());
        Self {
            cfg,
            loops,
            by_begin,
        }
    }

    #[inline]
    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// All loops, outermost first
    pub fn loops(&self) -> impl ExactSizeIterator<Item = &LoopEx> + '_ {
        self.loops.iter()
    }

    #[inline]
    pub fn loop_ex(&self, lp: Loop) -> &LoopEx {
        &self.loops[lp.index()]
    }

    pub fn loop_for_begin(&self, begin: Node) -> Option<&LoopEx> {
        self.by_begin.get(&begin).map(|lp| self.loop_ex(*lp))
    }

    /// Loops ordered so that every loop comes before the loops nested in it
    pub fn outer_first(&self) -> Vec<Loop> {
        self.cfg.loops().collect()
    }

    /// Loops ordered so that every loop comes after the loops nested in it
    pub fn inner_first(&self) -> Vec<Loop> {
        let mut order = Vec::with_capacity(self.loops.len());
        let mut stack: Vec<(Loop, bool)> = self
            .cfg
            .loops()
            .filter(|lp| self.parent(*lp).is_none())
            .map(|lp| (lp, false))
            .collect();
        stack.reverse();
        while let Some((lp, visited)) = stack.pop() {
            if visited {
                order.push(lp);
                continue;
            }
            stack.push((lp, true));
            stack.extend(self.children(lp).iter().rev().map(|child| (*child, false)));
        }
        order
    }

    #[inline]
    pub fn parent(&self, lp: Loop) -> Option<Loop> {
        self.cfg.loop_data(lp).parent()
    }

    #[inline]
    pub fn children(&self, lp: Loop) -> &[Loop] {
        self.cfg.loop_data(lp).children()
    }

    #[inline]
    pub fn depth(&self, lp: Loop) -> u32 {
        self.cfg.loop_data(lp).depth()
    }

    #[inline]
    pub fn is_innermost(&self, lp: Loop) -> bool {
        self.children(lp).is_empty()
    }

    /// The nodes of the body of `lp`, including nested loops.
    ///
    /// This is every fixed node of the loop's blocks, plus every floating node which
    /// transitively depends on one of them without leaving the loop through a phi of an outer
    /// merge or a proxy of one of its exits.
    pub fn inside(&self, graph: &Graph, lp: Loop) -> &NodeSet {
        self.loop_ex(lp).inside.get_or_init(|| compute_inside(graph, &self.cfg, lp))
    }

    /// Returns true if `node` has the same value on every iteration of `lp`
    pub fn is_invariant(&self, graph: &Graph, lp: Loop, node: Node) -> bool {
        !self.inside(graph, lp).contains(node)
    }

    pub fn ivs(&self, graph: &Graph, lp: Loop) -> &InductionVariables {
        let begin = self.loop_ex(lp).begin;
        self.loop_ex(lp)
            .ivs
            .get_or_init(|| InductionVariables::detect(graph, begin, self.inside(graph, lp)))
    }

    /// Try to prove each loop counted, replacing the results of any earlier detection
    pub fn detect_counted_loops(&mut self, graph: &Graph) {
        let results: Vec<Option<CountedLoopInfo>> = self
            .cfg
            .loops()
            .map(|lp| {
                let begin = self.loop_ex(lp).begin;
                CountedLoopInfo::detect(graph, begin, self.ivs(graph, lp), self.inside(graph, lp))
            })
            .collect();
        for (lp, counted) in self.loops.iter_mut().zip(results) {
            if counted.is_some() {
                log::trace!(target: "loops", "{} is counted", lp.begin);
            }
            lp.counted = counted;
        }
    }

    pub fn counted_loops(&self) -> impl Iterator<Item = &LoopEx> + '_ {
        self.loops.iter().filter(|lp| lp.is_counted())
    }

    /// Forget every lazily computed body set and induction variable, e.g. after a
    /// transformation added nodes to a loop without changing the shape of the control flow
    pub fn invalidate_fragments_and_ivs(&mut self) {
        for lp in self.loops.iter_mut() {
            lp.inside = OnceCell::new();
            lp.ivs = OnceCell::new();
        }
    }
}

fn compute_inside(graph: &Graph, cfg: &ControlFlowGraph, lp: Loop) -> NodeSet {
    let data = cfg.loop_data(lp);
    let mut inside = NodeSet::with_capacity(graph.capacity());
    let mut worklist = Vec::new();
    for block in data.blocks() {
        for &node in cfg.block(*block).nodes() {
            if inside.insert(node) {
                worklist.push(node);
            }
        }
    }
    let leaves_loop = |user: Node| match graph.kind(user) {
        NodeKind::Phi => cfg
            .block_for(graph.phi_merge(user))
            .is_none_or(|block| !data.contains(block)),
        NodeKind::ValueProxy => cfg
            .block_for(graph.input(user, 1))
            .is_none_or(|block| !data.contains(block)),
        _ => false,
    };
    while let Some(node) = worklist.pop() {
        for &user in graph.usages(node) {
            if graph.is_fixed(user) || inside.contains(user) || leaves_loop(user) {
                continue;
            }
            inside.insert(user);
            worklist.push(user);
        }
    }
    inside
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::{GraphBuilder, MethodId};

    use super::*;

    /// Two nested counted loops: `for (i = 0; i < n; i++) for (j = 0; j < i; j++) use(i + j)`
    fn nested() -> (Graph, Node, Node, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let outer = b.loop_begin(10.0);
        let i = b.loop_phi(&outer, zero);
        let cond = b.less_than(i, n);
        let outer_exit = b.loop_exit_if(&outer, cond, true, 0.9);
        let inner = b.loop_begin(5.0);
        let j = b.loop_phi(&inner, zero);
        let cond = b.less_than(j, i);
        let inner_exit = b.loop_exit_if(&inner, cond, true, 0.8);
        let sum = b.add(i, j);
        b.invoke(0, &[sum]);
        let next_j = b.add(j, one);
        b.loop_end(&inner, &[(j, next_j)]);
        b.position_at(inner_exit);
        let next_i = b.add(i, one);
        b.loop_end(&outer, &[(i, next_i)]);
        b.position_at(outer_exit);
        b.return_value(None);
        (graph, outer.begin, inner.begin, sum)
    }

    #[test]
    fn nesting_and_order() {
        crate::init_logging();
        let (graph, outer, inner, _) = nested();
        let loops = LoopsData::compute(&graph);
        assert_eq!(loops.len(), 2);
        let outer = loops.loop_for_begin(outer).unwrap().id();
        let inner = loops.loop_for_begin(inner).unwrap().id();
        assert_eq!(loops.parent(inner), Some(outer));
        assert_eq!(loops.children(outer), &[inner]);
        assert_eq!(loops.depth(inner), 2);
        assert!(loops.is_innermost(inner));
        assert!(!loops.is_innermost(outer));
        assert_eq!(loops.outer_first(), [outer, inner]);
        assert_eq!(loops.inner_first(), [inner, outer]);
    }

    #[test]
    fn invariance() {
        let (graph, outer, inner, sum) = nested();
        let loops = LoopsData::compute(&graph);
        let outer_lp = loops.loop_for_begin(outer).unwrap().id();
        let inner_lp = loops.loop_for_begin(inner).unwrap().id();
        let i = graph.phis(outer)[0];
        let n = graph.nodes_matching(|k| matches!(k, NodeKind::Parameter(_)))[0];
        // i varies in the outer loop, but not in the inner one
        assert!(!loops.is_invariant(&graph, outer_lp, i));
        assert!(loops.is_invariant(&graph, inner_lp, i));
        assert!(loops.is_invariant(&graph, outer_lp, n));
        assert!(!loops.is_invariant(&graph, inner_lp, sum));
        assert!(loops.inside(&graph, outer_lp).contains(sum));
        assert!(loops.inside(&graph, outer_lp).contains(inner));
    }

    #[test]
    fn counted_detection_covers_nested_loops() {
        let (graph, outer, inner, _) = nested();
        let mut loops = LoopsData::compute(&graph);
        assert_eq!(loops.counted_loops().count(), 0);
        loops.detect_counted_loops(&graph);
        assert_eq!(loops.counted_loops().count(), 2);
        assert!(loops.loop_for_begin(outer).unwrap().is_counted());
        let inner = loops.loop_for_begin(inner).unwrap();
        let counted = inner.counted().unwrap();
        // the inner limit is the outer counter, which is invariant in the inner loop
        assert_eq!(counted.limit(), graph.phis(outer)[0]);
        assert_eq!(inner.kind(&graph), LoopKind::Regular);
        assert_eq!(inner.loop_ends(&graph).len(), 1);
        assert_eq!(inner.exits(&graph).len(), 1);
    }
}
