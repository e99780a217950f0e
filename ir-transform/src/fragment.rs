use alloc::vec::Vec;

use seajit_ir::{FxHashMap, Graph, Loop, Node, NodeKind, SmallVec};
use seajit_ir_analysis::LoopsData;

/// The nodes making up one loop, captured before a transformation starts rewriting it.
///
/// The fragment holds the loop's body as computed by [LoopsData::inside]: the loop begin, its
/// phis and loop ends, every fixed node of the loop's blocks (nested loops included), and the
/// floating nodes computed from them. The loop exits and their proxies are not part of the body,
/// but are duplicated along with it by [LoopFragment::duplicate].
#[derive(Debug, Clone)]
pub struct LoopFragment {
    begin: Node,
    nodes: Vec<Node>,
    exits: SmallVec<[Node; 2]>,
}

impl LoopFragment {
    pub fn new(graph: &Graph, loops: &LoopsData, lp: Loop) -> Self {
        let begin = loops.loop_ex(lp).begin();
        Self {
            begin,
            nodes: loops.inside(graph, lp).iter().collect(),
            exits: graph.loop_exits(begin),
        }
    }

    #[inline]
    pub fn begin(&self) -> Node {
        self.begin
    }

    /// The body of the loop
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn exits(&self) -> &[Node] {
        &self.exits
    }

    /// The size of the loop body, in nodes
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a complete copy of the loop, entered through the unlinked `End` node
    /// `forward_end`.
    ///
    /// The copy has its own loop begin, phis, loop ends and exits, along with a copy of every
    /// proxy of the original exits. The copied exits are left without a successor: the caller
    /// decides where control goes when the copy is left.
    pub fn duplicate(&self, graph: &mut Graph, forward_end: Node) -> DuplicatedLoop {
        debug_assert!(matches!(graph.kind(forward_end), NodeKind::End));
        let mut nodes = self.nodes.clone();
        for &exit in self.exits.iter() {
            nodes.push(exit);
            nodes.extend(graph.proxies(exit));
        }
        let mut map = FxHashMap::default();
        map.insert(graph.forward_end(self.begin), forward_end);
        clone_nodes(graph, &nodes, &mut map);
        link_nodes(graph, &nodes, &map);
        let begin = map[&self.begin];
        log::trace!(target: "loop-fragment", "duplicated loop {} as {begin}", self.begin);
        DuplicatedLoop { begin, map }
    }
}

/// The result of duplicating a loop: the copy's loop begin, and the original-to-copy mapping
#[derive(Debug)]
pub struct DuplicatedLoop {
    begin: Node,
    map: FxHashMap<Node, Node>,
}

impl DuplicatedLoop {
    /// The loop begin of the copy
    #[inline]
    pub fn begin(&self) -> Node {
        self.begin
    }

    /// The copy of `original`, if it was duplicated
    #[inline]
    pub fn get(&self, original: Node) -> Option<Node> {
        self.map.get(&original).copied()
    }

    /// The node standing for `original` in the copy: its copy if it was duplicated, or
    /// `original` itself if it is shared with the copy
    #[inline]
    pub fn mapped(&self, original: Node) -> Node {
        self.get(original).unwrap_or(original)
    }

    #[inline]
    pub(crate) fn map(&self) -> &FxHashMap<Node, Node> {
        &self.map
    }
}

/// Create an unlinked copy of each of `nodes` which is not already mapped
pub(crate) fn clone_nodes(graph: &mut Graph, nodes: &[Node], map: &mut FxHashMap<Node, Node>) {
    for &node in nodes {
        if !map.contains_key(&node) {
            let copy = graph.clone_node(node);
            map.insert(node, copy);
        }
    }
}

/// Give the copy of each of `nodes` the edges of its original, translated through `map`.
///
/// Inputs which are not mapped are shared with the original. Successors which are not mapped
/// are left unset, for the caller to wire.
pub(crate) fn link_nodes(graph: &mut Graph, nodes: &[Node], map: &FxHashMap<Node, Node>) {
    let mapped = |node: Node| map.get(&node).copied().unwrap_or(node);
    for &node in nodes {
        let copy = map[&node];
        let inputs: SmallVec<[Node; 4]> = graph.inputs(node).iter().map(|n| mapped(*n)).collect();
        graph.set_inputs(copy, &inputs);
        for index in 0..graph.successor_count(node) {
            let Some(successor) = graph.successor(node, index) else {
                continue;
            };
            if let Some(successor) = map.get(&successor) {
                graph.set_successor(copy, index, Some(*successor));
            }
        }
        graph.kind_mut(copy).remap_references(mapped);
    }
}

/// Join the paths leaving the loop through `exit` and through `other`, a copy of it.
///
/// Both are routed into a new merge which takes over the old successor of `exit`. Each proxy
/// of `exit` is replaced, outside the loop, by a phi of the proxy and the value reaching the
/// merge from `other`, which `map` gives as either a copy of the proxy or a copy of the proxied
/// value. Everything else anchored at `exit` is moved to the merge, so it is checked on both
/// paths. Returns the merge.
pub(crate) fn merge_exit_paths(
    graph: &mut Graph,
    exit: Node,
    other: Node,
    map: &FxHashMap<Node, Node>,
) -> Node {
    let next = graph.next(exit);
    graph.set_next(exit, None);
    let end = graph.add(NodeKind::End, &[]);
    graph.set_next(exit, Some(end));
    let other_end = graph.add(NodeKind::End, &[]);
    graph.set_next(other, Some(other_end));
    let merge = graph.add(NodeKind::Merge, &[end, other_end]);
    graph.set_position(merge, graph.position(exit));
    graph.set_next(merge, next);

    graph.replace_at_usages_where(exit, merge, |g, user| !is_proxy_of(g, user, exit));
    for proxy in graph.proxies(exit) {
        let value = graph.input(proxy, 0);
        let incoming = map
            .get(&proxy)
            .or_else(|| map.get(&value))
            .copied()
            .unwrap_or(value);
        let phi = graph.add(NodeKind::Phi, &[merge, proxy, incoming]);
        graph.replace_at_usages(proxy, phi);
    }
    merge
}

#[inline]
pub(crate) fn is_proxy_of(graph: &Graph, node: Node, exit: Node) -> bool {
    matches!(graph.kind(node), NodeKind::ValueProxy) && graph.input(node, 1) == exit
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_eval::{Evaluator, Heap, Value};
    use seajit_ir::{GraphBuilder, MethodId, verify};

    use super::*;

    /// `i = 0; while (i < n) i += 2; return i`
    fn counting_loop() -> Graph {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let n = b.int_parameter(0);
        let zero = b.int(0);
        let two = b.int(2);
        let scaffold = b.loop_begin(10.0);
        let i = b.loop_phi(&scaffold, zero);
        let cond = b.less_than(i, n);
        let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
        let next = b.add(i, two);
        b.loop_end(&scaffold, &[(i, next)]);
        b.position_at(exit);
        let result = b.proxy(i, exit);
        b.return_value(Some(result));
        graph
    }

    #[test]
    fn duplicated_loops_run_in_sequence() -> Result<(), seajit_ir::CompilationError> {
        crate::init_logging();
        let mut graph = counting_loop();
        let loops = LoopsData::compute(&graph);
        let lp = loops.outer_first()[0];
        let fragment = LoopFragment::new(&graph, &loops, lp);
        let exit = fragment.exits()[0];

        // Run the copy first, then the original, continuing from where the copy left off
        let original_entry = graph.add(NodeKind::End, &[]);
        let forward_end = graph.forward_end(fragment.begin());
        graph.set_input(fragment.begin(), 0, original_entry);
        let copy = fragment.duplicate(&mut graph, forward_end);
        let copy_exit = copy.get(exit).unwrap();
        graph.set_next(copy_exit, Some(original_entry));
        let phi = graph.phis(fragment.begin())[0];
        let proxy = graph.add(NodeKind::ValueProxy, &[copy.mapped(phi), copy_exit]);
        graph.set_phi_value(phi, 0, proxy);
        verify::verify(&graph)?;

        assert_eq!(graph.loop_exits(copy.begin()).as_slice(), &[copy_exit]);
        assert_eq!(graph.phis(copy.begin()).len(), 1);
        let copy_phi = copy.get(phi).unwrap();
        assert_eq!(graph.as_constant(graph.phi_value_at(copy_phi, 0)), Some(0));
        assert_eq!(graph.phi_value_at(copy_phi, 1), copy.mapped(graph.phi_value_at(phi, 1)));
        for n in [0, 1, 7] {
            let mut heap = Heap::new();
            let execution = Evaluator::new(&graph).run(&[Value::Int(n)], &mut heap).unwrap();
            let expected = if n <= 0 { 0 } else { (n + 1) / 2 * 2 };
            assert_eq!(execution.outcome.value(), Some(Value::Int(expected)));
        }
        Ok(())
    }
}
