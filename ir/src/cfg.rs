use alloc::vec::Vec;

use cranelift_entity::{PrimaryMap, SecondaryMap, entity_impl, packed_option::PackedOption};
use smallvec::SmallVec;

use crate::{EntitySet, FxHashMap, Graph, Node, NodeKind};

/// A basic block of a [ControlFlowGraph]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "b");

/// A natural loop of a [ControlFlowGraph]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

pub struct BlockData {
    /// The fixed nodes of this block, starting with its begin node
    nodes: Vec<Node>,
    predecessors: SmallVec<[Block; 2]>,
    successors: SmallVec<[Block; 2]>,
    dominator: PackedOption<Block>,
    dom_children: SmallVec<[Block; 2]>,
    dom_depth: u32,
    dom_pre: u32,
    dom_post: u32,
    rpo_index: u32,
    innermost_loop: PackedOption<Loop>,
    frequency: f64,
}

impl BlockData {
    #[inline]
    pub fn begin(&self) -> Node {
        self.nodes[0]
    }

    /// The last fixed node of the block
    #[inline]
    pub fn end(&self) -> Node {
        *self.nodes.last().expect("blocks are never empty")
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn predecessors(&self) -> &[Block] {
        &self.predecessors
    }

    #[inline]
    pub fn successors(&self) -> &[Block] {
        &self.successors
    }

    #[inline]
    pub fn frequency(&self) -> f64 {
        self.frequency
    }
}

/// A natural loop: the header block, plus every block that can reach one of the header's
/// backedges without passing through the header.
pub struct LoopData {
    header: Block,
    blocks: EntitySet<Block>,
    block_list: Vec<Block>,
    exits: SmallVec<[Block; 2]>,
    parent: PackedOption<Loop>,
    children: SmallVec<[Loop; 2]>,
    depth: u32,
}

impl LoopData {
    #[inline]
    pub fn header(&self) -> Block {
        self.header
    }

    /// The blocks of the loop, including those of nested loops, in reverse post-order
    #[inline]
    pub fn blocks(&self) -> &[Block] {
        &self.block_list
    }

    #[inline]
    pub fn contains(&self, block: Block) -> bool {
        self.blocks.contains(block)
    }

    /// The blocks starting with a `LoopExit` of this loop
    #[inline]
    pub fn exits(&self) -> &[Block] {
        &self.exits
    }

    #[inline]
    pub fn parent(&self) -> Option<Loop> {
        self.parent.expand()
    }

    #[inline]
    pub fn children(&self) -> &[Loop] {
        &self.children
    }

    /// The nesting depth of this loop; outermost loops have depth 1
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

/// The block-level view of a [Graph].
///
/// Blocks begin at the begin-kind nodes (`Start`, `Begin`, `Merge`, `LoopBegin`, `LoopExit`)
/// and follow the single-successor chain of fixed nodes until the next block boundary. The
/// structure is a snapshot: it is computed from the graph as it is, and must be recomputed
/// after the control flow of the graph changes.
pub struct ControlFlowGraph {
    blocks: PrimaryMap<Block, BlockData>,
    rpo: Vec<Block>,
    node_to_block: SecondaryMap<Node, PackedOption<Block>>,
    loops: PrimaryMap<Loop, LoopData>,
    loop_by_header: FxHashMap<Block, Loop>,
}

impl ControlFlowGraph {
    /// Compute blocks, dominators, loops and relative frequencies for `graph`
    pub fn compute(graph: &Graph) -> Self {
        let mut cfg = Self {
            blocks: PrimaryMap::new(),
            rpo: Vec::new(),
            node_to_block: SecondaryMap::new(),
            loops: PrimaryMap::new(),
            loop_by_header: FxHashMap::default(),
        };
        cfg.identify_blocks(graph);
        cfg.connect_blocks(graph);
        cfg.compute_rpo();
        cfg.compute_dominators();
        cfg.compute_loops(graph);
        cfg.compute_frequencies(graph);
        log::trace!(
            target: "cfg",
            "computed cfg with {} blocks and {} loops",
            cfg.blocks.len(),
            cfg.loops.len()
        );
        cfg
    }

    fn identify_blocks(&mut self, graph: &Graph) {
        let mut worklist: Vec<Node> = alloc::vec![graph.start()];
        while let Some(begin) = worklist.pop() {
            if self.node_to_block[begin].is_some() {
                continue;
            }
            let mut nodes = alloc::vec![begin];
            let mut current = begin;
            loop {
                let kind = graph.kind(current);
                if kind.is_fixed_with_next() {
                    match graph.next(current) {
                        Some(next) if graph.kind(next).is_begin() => {
                            worklist.push(next);
                            break;
                        }
                        Some(next) => {
                            nodes.push(next);
                            current = next;
                        }
                        None => break,
                    }
                } else {
                    match kind {
                        NodeKind::If { .. } => {
                            // Push the false successor first, so the true successor is visited
                            // first
                            worklist.extend(graph.false_successor(current));
                            worklist.extend(graph.true_successor(current));
                        }
                        NodeKind::End | NodeKind::LoopEnd(_) => {
                            worklist.extend(graph.merge_of(current))
                        }
                        _ => (),
                    }
                    break;
                }
            }
            let block = self.blocks.push(BlockData {
                nodes,
                predecessors: SmallVec::new(),
                successors: SmallVec::new(),
                dominator: PackedOption::default(),
                dom_children: SmallVec::new(),
                dom_depth: 0,
                dom_pre: 0,
                dom_post: 0,
                rpo_index: u32::MAX,
                innermost_loop: PackedOption::default(),
                frequency: 0.0,
            });
            for &node in self.blocks[block].nodes.iter() {
                self.node_to_block[node] = block.into();
            }
        }
    }

    fn connect_blocks(&mut self, graph: &Graph) {
        let blocks: Vec<Block> = self.blocks.keys().collect();
        for block in blocks.iter().copied() {
            let end = self.blocks[block].end();
            let mut successors = SmallVec::<[Block; 2]>::new();
            let kind = graph.kind(end);
            if kind.is_fixed_with_next() {
                successors.extend(graph.next(end).and_then(|next| self.block_for(next)));
            } else if kind.is_control_split() {
                successors.extend(graph.true_successor(end).and_then(|s| self.block_for(s)));
                successors.extend(graph.false_successor(end).and_then(|s| self.block_for(s)));
            } else if kind.is_end() {
                successors.extend(graph.merge_of(end).and_then(|m| self.block_for(m)));
            }
            self.blocks[block].successors = successors;
        }
        for block in blocks {
            let begin = self.blocks[block].begin();
            let predecessors: SmallVec<[Block; 2]> = if graph.kind(begin).is_merge() {
                graph.ends(begin).iter().filter_map(|end| self.block_for(*end)).collect()
            } else {
                graph.predecessor(begin).and_then(|pred| self.block_for(pred)).into_iter().collect()
            };
            self.blocks[block].predecessors = predecessors;
        }
    }

    fn compute_rpo(&mut self) {
        let Some(entry) = self.blocks.keys().next() else {
            return;
        };
        let mut visited = EntitySet::<Block>::with_capacity(self.blocks.len());
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(Block, usize)> = alloc::vec![(entry, 0)];
        visited.insert(entry);
        while let Some((block, index)) = stack.pop() {
            if let Some(&succ) = self.blocks[block].successors.get(index) {
                stack.push((block, index + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
            }
        }
        postorder.reverse();
        for (index, block) in postorder.iter().enumerate() {
            self.blocks[*block].rpo_index = index as u32;
        }
        self.rpo = postorder;
    }

    /// Cooper, Harvey & Kennedy, "A Simple, Fast Dominance Algorithm"
    fn compute_dominators(&mut self) {
        let Some(&entry) = self.rpo.first() else {
            return;
        };
        let mut idom: SecondaryMap<Block, PackedOption<Block>> = SecondaryMap::new();
        idom[entry] = entry.into();
        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.rpo.iter().skip(1) {
                let mut new_idom: Option<Block> = None;
                for &pred in self.blocks[block].predecessors.iter() {
                    if idom[pred].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => self.intersect(&idom, pred, current),
                    });
                }
                if let Some(new_idom) = new_idom {
                    if idom[block].expand() != Some(new_idom) {
                        idom[block] = new_idom.into();
                        changed = true;
                    }
                }
            }
        }
        for &block in self.rpo.iter().skip(1) {
            let dominator = idom[block];
            self.blocks[block].dominator = dominator;
            if let Some(dominator) = dominator.expand() {
                self.blocks[dominator].dom_children.push(block);
            }
        }

        // Number the dominator tree for constant-time dominance queries
        let mut counter = 0u32;
        let mut stack: Vec<(Block, bool)> = alloc::vec![(entry, false)];
        while let Some((block, done)) = stack.pop() {
            if done {
                self.blocks[block].dom_post = counter;
                counter += 1;
                continue;
            }
            self.blocks[block].dom_pre = counter;
            counter += 1;
            let depth = self.blocks[block].dom_depth;
            stack.push((block, true));
            let children = self.blocks[block].dom_children.clone();
            for child in children.into_iter().rev() {
                self.blocks[child].dom_depth = depth + 1;
                stack.push((child, false));
            }
        }
    }

    fn intersect(
        &self,
        idom: &SecondaryMap<Block, PackedOption<Block>>,
        a: Block,
        b: Block,
    ) -> Block {
        let mut finger1 = a;
        let mut finger2 = b;
        while finger1 != finger2 {
            while self.blocks[finger1].rpo_index > self.blocks[finger2].rpo_index {
                finger1 = idom[finger1].expect("processed blocks have a dominator");
            }
            while self.blocks[finger2].rpo_index > self.blocks[finger1].rpo_index {
                finger2 = idom[finger2].expect("processed blocks have a dominator");
            }
        }
        finger1
    }

    fn compute_loops(&mut self, graph: &Graph) {
        for &header in self.rpo.iter() {
            let begin = self.blocks[header].begin();
            if !graph.kind(begin).is_loop_begin() {
                continue;
            }
            let mut blocks = EntitySet::<Block>::with_capacity(self.blocks.len());
            blocks.insert(header);
            let mut worklist: Vec<Block> =
                graph.loop_ends(begin).iter().filter_map(|end| self.block_for(*end)).collect();
            while let Some(block) = worklist.pop() {
                if blocks.insert(block) {
                    worklist.extend(self.blocks[block].predecessors.iter().copied());
                }
            }
            let mut block_list: Vec<Block> = blocks.iter().collect();
            block_list.sort_by_key(|b| self.blocks[*b].rpo_index);
            let exits = graph
                .loop_exits(begin)
                .iter()
                .filter_map(|exit| self.block_for(*exit))
                .collect();
            let lp = self.loops.push(LoopData {
                header,
                blocks,
                block_list,
                exits,
                parent: PackedOption::default(),
                children: SmallVec::new(),
                depth: 1,
            });
            self.loop_by_header.insert(header, lp);
        }

        // Loops were discovered in reverse post-order, so a parent is always discovered (and
        // assigned its depth) before its children. The innermost enclosing loop is the smallest.
        let loops: Vec<Loop> = self.loops.keys().collect();
        for &lp in loops.iter() {
            let header = self.loops[lp].header;
            let parent = loops
                .iter()
                .copied()
                .filter(|other| *other != lp && self.loops[*other].contains(header))
                .min_by_key(|other| self.loops[*other].block_list.len());
            if let Some(parent) = parent {
                self.loops[lp].parent = parent.into();
                self.loops[lp].depth = self.loops[parent].depth + 1;
                self.loops[parent].children.push(lp);
            }
        }
        for &lp in loops.iter() {
            for index in 0..self.loops[lp].block_list.len() {
                let block = self.loops[lp].block_list[index];
                let replace = match self.blocks[block].innermost_loop.expand() {
                    None => true,
                    Some(current) => self.loops[lp].depth > self.loops[current].depth,
                };
                if replace {
                    self.blocks[block].innermost_loop = lp.into();
                }
            }
        }
    }

    fn compute_frequencies(&mut self, graph: &Graph) {
        for index in 0..self.rpo.len() {
            let block = self.rpo[index];
            let begin = self.blocks[block].begin();
            let frequency = match graph.kind(begin) {
                NodeKind::Start => 1.0,
                NodeKind::LoopBegin(info) => {
                    let forward = graph.forward_end(begin);
                    let entry =
                        self.block_for(forward).map(|b| self.blocks[b].frequency).unwrap_or(1.0);
                    entry * info.loop_frequency
                }
                NodeKind::Merge => graph
                    .ends(begin)
                    .iter()
                    .filter_map(|end| self.block_for(*end))
                    .map(|b| self.blocks[b].frequency)
                    .sum(),
                _ => match self.blocks[block].predecessors.first().copied() {
                    Some(pred) => {
                        let pred_end = self.blocks[pred].end();
                        let pred_frequency = self.blocks[pred].frequency;
                        match graph.kind(pred_end) {
                            NodeKind::If { true_probability } => {
                                if graph.true_successor(pred_end) == Some(begin) {
                                    pred_frequency * true_probability
                                } else {
                                    pred_frequency * (1.0 - true_probability)
                                }
                            }
                            _ => pred_frequency,
                        }
                    }
                    None => 1.0,
                },
            };
            self.blocks[block].frequency = frequency;
        }
    }

    // Queries
    // ---------------------------------------------------------------------------------------

    #[inline]
    pub fn entry(&self) -> Block {
        self.rpo[0]
    }

    #[inline]
    pub fn block(&self, block: Block) -> &BlockData {
        &self.blocks[block]
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The block containing the fixed node `node`
    #[inline]
    pub fn block_for(&self, node: Node) -> Option<Block> {
        self.node_to_block.get(node).and_then(|b| b.expand())
    }

    /// Blocks in reverse post-order
    #[inline]
    pub fn reverse_post_order(&self) -> &[Block] {
        &self.rpo
    }

    #[inline]
    pub fn rpo_index(&self, block: Block) -> u32 {
        self.blocks[block].rpo_index
    }

    #[inline]
    pub fn dominator(&self, block: Block) -> Option<Block> {
        self.blocks[block].dominator.expand()
    }

    #[inline]
    pub fn dom_depth(&self, block: Block) -> u32 {
        self.blocks[block].dom_depth
    }

    /// Returns true if `a` dominates `b`. Every block dominates itself.
    #[inline]
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let a = &self.blocks[a];
        let b = &self.blocks[b];
        a.dom_pre <= b.dom_pre && b.dom_post <= a.dom_post
    }

    #[inline]
    pub fn strictly_dominates(&self, a: Block, b: Block) -> bool {
        a != b && self.dominates(a, b)
    }

    /// The nearest block dominating both `a` and `b`
    pub fn common_dominator(&self, a: Block, b: Block) -> Block {
        let mut a = a;
        while !self.dominates(a, b) {
            match self.dominator(a) {
                Some(dom) => a = dom,
                None => return a,
            }
        }
        a
    }

    /// Of two blocks on one dominator chain, the one deeper in the dominator tree
    pub fn deeper(&self, a: Block, b: Block) -> Block {
        if self.dom_depth(a) >= self.dom_depth(b) { a } else { b }
    }

    #[inline]
    pub fn frequency(&self, block: Block) -> f64 {
        self.blocks[block].frequency
    }

    /// Loops, outermost first
    pub fn loops(&self) -> impl ExactSizeIterator<Item = Loop> + '_ {
        self.loops.keys()
    }

    #[inline]
    pub fn loop_data(&self, lp: Loop) -> &LoopData {
        &self.loops[lp]
    }

    #[inline]
    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    /// The innermost loop containing `block`
    #[inline]
    pub fn loop_for(&self, block: Block) -> Option<Loop> {
        self.blocks[block].innermost_loop.expand()
    }

    /// The loop whose header is `block`
    #[inline]
    pub fn loop_with_header(&self, block: Block) -> Option<Loop> {
        self.loop_by_header.get(&block).copied()
    }

    /// The loop nesting depth of `block`, 0 if not in a loop
    pub fn loop_depth(&self, block: Block) -> u32 {
        self.loop_for(block).map(|lp| self.loops[lp].depth).unwrap_or(0)
    }

    /// The block holding the forward end of a loop, i.e. the block executed immediately before
    /// entering the loop. It dominates the whole loop.
    pub fn preheader(&self, graph: &Graph, lp: Loop) -> Option<Block> {
        let begin = self.blocks[self.loops[lp].header].begin();
        self.block_for(graph.forward_end(begin))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{GraphBuilder, MethodId};

    /// `for (i = 0; i < n; i++) {}` followed by a return of `i`
    fn counted_loop() -> (Graph, Node, Node) {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let one = b.int(1);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let next = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next)]);
        b.position_at(exit);
        let result = b.proxy(i, exit);
        b.return_value(Some(result));
        (graph, scaffold.begin, exit)
    }

    #[test]
    fn blocks_and_loops() {
        crate::init_logging();
        let (graph, begin, exit) = counted_loop();
        let cfg = ControlFlowGraph::compute(&graph);
        assert_eq!(cfg.num_blocks(), 4);
        assert_eq!(cfg.num_loops(), 1);
        let header = cfg.block_for(begin).unwrap();
        let exit_block = cfg.block_for(exit).unwrap();
        let lp = cfg.loop_with_header(header).unwrap();
        let data = cfg.loop_data(lp);
        assert_eq!(data.blocks().len(), 2);
        assert!(!data.contains(exit_block));
        assert_eq!(data.exits(), &[exit_block]);
        assert_eq!(data.depth(), 1);
        assert!(cfg.dominates(cfg.entry(), exit_block));
        assert!(cfg.strictly_dominates(header, exit_block));
        assert_eq!(cfg.preheader(&graph, lp), Some(cfg.entry()));
        assert_eq!(cfg.loop_depth(exit_block), 0);
    }

    #[test]
    fn frequencies_follow_probabilities() {
        let (graph, begin, exit) = counted_loop();
        let cfg = ControlFlowGraph::compute(&graph);
        let header = cfg.block_for(begin).unwrap();
        let exit_block = cfg.block_for(exit).unwrap();
        assert_eq!(cfg.frequency(cfg.entry()), 1.0);
        assert!((cfg.frequency(header) - 10.0).abs() < 1e-9);
        assert!((cfg.frequency(exit_block) - 1.0).abs() < 1e-9);
    }
}
