mod control;

use alloc::vec::Vec;
use core::fmt;

use cranelift_entity::{PrimaryMap, packed_option::PackedOption};
use smallvec::SmallVec;

use crate::{
    FxHashMap, GraphState, IntegerStamp, MethodId, Node, NodeKind, NodeSet, Stamp,
    node::default_stamp,
};

/// The storage for a single node of a [Graph]
#[derive(Clone)]
pub struct NodeData {
    kind: NodeKind,
    inputs: SmallVec<[Node; 3]>,
    successors: SmallVec<[PackedOption<Node>; 2]>,
    predecessor: PackedOption<Node>,
    usages: SmallVec<[Node; 4]>,
    stamp: Stamp,
    position: Option<u32>,
    alive: bool,
}

impl NodeData {
    #[inline(always)]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[inline(always)]
    pub fn inputs(&self) -> &[Node] {
        &self.inputs
    }

    #[inline(always)]
    pub fn usages(&self) -> &[Node] {
        &self.usages
    }

    #[inline(always)]
    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    #[inline(always)]
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    #[inline(always)]
    pub fn is_alive(&self) -> bool {
        self.alive
    }
}

/// The number of successor slots a node of the given kind has
fn successor_slots(kind: &NodeKind) -> usize {
    if kind.is_fixed_with_next() {
        1
    } else if kind.is_control_split() {
        2
    } else {
        0
    }
}

#[derive(Clone, Default)]
struct ChangeLog {
    seen: NodeSet,
    nodes: Vec<Node>,
}

/// A sea-of-nodes graph for a single method.
///
/// Nodes live in an arena and refer to each other by [Node] index. Every node has ordered
/// inputs, and the graph maintains the reverse edges (usages) for all of them. Fixed nodes are
/// additionally linked into a control-flow chain through their successors and predecessor.
///
/// The graph is owned by exactly one compilation, and is never shared across threads.
#[derive(Clone)]
pub struct Graph {
    nodes: PrimaryMap<Node, NodeData>,
    start: Node,
    method: MethodId,
    state: GraphState,
    constants: FxHashMap<(i64, u8), Node>,
    logic_constants: [PackedOption<Node>; 2],
    changes: Option<ChangeLog>,
    live: usize,
}

impl Graph {
    pub fn new(method: MethodId) -> Self {
        let mut nodes = PrimaryMap::new();
        let start = nodes.push(NodeData {
            kind: NodeKind::Start,
            inputs: SmallVec::new(),
            successors: smallvec::smallvec![PackedOption::default()],
            predecessor: PackedOption::default(),
            usages: SmallVec::new(),
            stamp: Stamp::Void,
            position: None,
            alive: true,
        });
        Self {
            nodes,
            start,
            method,
            state: GraphState::default(),
            constants: FxHashMap::default(),
            logic_constants: [PackedOption::default(); 2],
            changes: None,
            live: 1,
        }
    }

    #[inline(always)]
    pub fn start(&self) -> Node {
        self.start
    }

    #[inline(always)]
    pub fn method(&self) -> MethodId {
        self.method
    }

    #[inline(always)]
    pub fn state(&self) -> &GraphState {
        &self.state
    }

    #[inline(always)]
    pub fn state_mut(&mut self) -> &mut GraphState {
        &mut self.state
    }

    /// The number of live nodes
    #[inline]
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// The number of nodes ever allocated, i.e. one past the largest node index
    #[inline]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn data(&self, node: Node) -> &NodeData {
        &self.nodes[node]
    }

    #[inline]
    pub fn is_alive(&self, node: Node) -> bool {
        self.nodes.get(node).is_some_and(|data| data.alive)
    }

    #[inline]
    pub fn kind(&self, node: Node) -> &NodeKind {
        &self.nodes[node].kind
    }

    /// Mutable access to a node's attributes. Changing the kind of a node to one with a
    /// different input or successor layout is not allowed.
    pub fn kind_mut(&mut self, node: Node) -> &mut NodeKind {
        self.record_change(node);
        &mut self.nodes[node].kind
    }

    #[inline]
    pub fn inputs(&self, node: Node) -> &[Node] {
        &self.nodes[node].inputs
    }

    #[inline]
    pub fn input(&self, node: Node, index: usize) -> Node {
        self.nodes[node].inputs[index]
    }

    #[inline]
    pub fn usages(&self, node: Node) -> &[Node] {
        &self.nodes[node].usages
    }

    #[inline]
    pub fn has_usages(&self, node: Node) -> bool {
        !self.nodes[node].usages.is_empty()
    }

    #[inline]
    pub fn stamp(&self, node: Node) -> &Stamp {
        &self.nodes[node].stamp
    }

    #[inline]
    pub fn int_stamp(&self, node: Node) -> Option<IntegerStamp> {
        self.nodes[node].stamp.as_int().copied()
    }

    pub fn set_stamp(&mut self, node: Node, stamp: Stamp) {
        self.nodes[node].stamp = stamp;
    }

    #[inline]
    pub fn position(&self, node: Node) -> Option<u32> {
        self.nodes[node].position
    }

    pub fn set_position(&mut self, node: Node, position: Option<u32>) {
        self.nodes[node].position = position;
    }

    #[inline]
    pub fn is_fixed(&self, node: Node) -> bool {
        self.nodes[node].kind.is_fixed()
    }

    #[inline]
    pub fn is_floating(&self, node: Node) -> bool {
        self.nodes[node].kind.is_floating()
    }

    /// Returns the value of `node` if it is an integer constant
    pub fn as_constant(&self, node: Node) -> Option<i64> {
        match self.nodes[node].kind {
            NodeKind::Constant { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Returns the value of `node` if it is a logic constant
    pub fn as_logic_constant(&self, node: Node) -> Option<bool> {
        match self.nodes[node].kind {
            NodeKind::LogicConstant(value) => Some(value),
            _ => None,
        }
    }

    /// The bit width of an integer value, defaulting to 32
    pub fn bits(&self, node: Node) -> u8 {
        self.int_stamp(node).map(|stamp| stamp.bits()).unwrap_or(32)
    }

    /// A snapshot of all live nodes.
    ///
    /// Phases mutate the graph while visiting nodes, so they always iterate over a snapshot
    /// and check [Graph::is_alive] before touching a node from it.
    pub fn node_snapshot(&self) -> Vec<Node> {
        self.nodes.iter().filter(|(_, data)| data.alive).map(|(node, _)| node).collect()
    }

    /// A snapshot of all live nodes whose kind satisfies `predicate`
    pub fn nodes_matching(&self, predicate: impl Fn(&NodeKind) -> bool) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|(_, data)| data.alive && predicate(&data.kind))
            .map(|(node, _)| node)
            .collect()
    }

    // Creation
    // ---------------------------------------------------------------------------------------

    /// Create a new node with the given inputs.
    ///
    /// Fixed nodes are created unlinked: they must be wired into the control-flow chain with
    /// [Graph::set_next] and friends.
    pub fn add(&mut self, kind: NodeKind, inputs: &[Node]) -> Node {
        let stamp = self.infer_stamp(&kind, inputs);
        let successors = (0..successor_slots(&kind)).map(|_| PackedOption::default()).collect();
        let node = self.nodes.push(NodeData {
            kind,
            inputs: SmallVec::from_slice(inputs),
            successors,
            predecessor: PackedOption::default(),
            usages: SmallVec::new(),
            stamp,
            position: None,
            alive: true,
        });
        for &input in inputs {
            debug_assert!(self.is_alive(input), "{node} created with dead input {input}");
            self.nodes[input].usages.push(node);
        }
        match self.nodes[node].kind {
            NodeKind::Constant { value, bits } => {
                self.constants.insert((value, bits), node);
            }
            NodeKind::LogicConstant(value) => {
                self.logic_constants[value as usize] = node.into();
            }
            _ => (),
        }
        self.live += 1;
        self.record_change(node);
        node
    }

    /// Like [Graph::add], but returns an existing node equal to the one requested, if the kind
    /// is value-numberable and such a node exists.
    pub fn unique(&mut self, kind: NodeKind, inputs: &[Node]) -> Node {
        if kind.is_value_numberable() {
            if let Some(existing) = self.find_duplicate(&kind, inputs) {
                return existing;
            }
        }
        self.add(kind, inputs)
    }

    /// Another live node equal to the value-numberable `node`, if one exists
    pub fn find_equivalent(&self, node: Node) -> Option<Node> {
        let data = &self.nodes[node];
        if !data.kind.is_value_numberable() || data.inputs.is_empty() {
            return None;
        }
        let first = data.inputs[0];
        self.nodes[first].usages.iter().copied().find(|other| {
            let other_data = &self.nodes[*other];
            *other != node
                && other_data.alive
                && other_data.kind == data.kind
                && other_data.inputs == data.inputs
        })
    }

    fn find_duplicate(&self, kind: &NodeKind, inputs: &[Node]) -> Option<Node> {
        match kind {
            NodeKind::Constant { value, bits } => {
                return self.constants.get(&(*value, *bits)).copied().filter(|n| self.is_alive(*n));
            }
            NodeKind::LogicConstant(value) => {
                return self.logic_constants[*value as usize].expand().filter(|n| self.is_alive(*n));
            }
            _ => (),
        }
        let first = *inputs.first()?;
        self.nodes[first].usages.iter().copied().find(|user| {
            let data = &self.nodes[*user];
            data.alive && data.kind == *kind && data.inputs.as_slice() == inputs
        })
    }

    /// An integer constant of the given width
    pub fn constant(&mut self, bits: u8, value: i64) -> Node {
        let value = crate::stamp::wrap(bits, value as i128);
        self.unique(NodeKind::Constant { value, bits }, &[])
    }

    /// A 32-bit integer constant
    #[inline]
    pub fn int(&mut self, value: i32) -> Node {
        self.constant(32, value as i64)
    }

    pub fn logic_constant(&mut self, value: bool) -> Node {
        self.unique(NodeKind::LogicConstant(value), &[])
    }

    /// Create a copy of `node` with the same kind, stamp and position, but without inputs or
    /// control edges.
    pub fn clone_node(&mut self, node: Node) -> Node {
        let data = &self.nodes[node];
        let kind = data.kind.clone();
        let stamp = data.stamp;
        let position = data.position;
        let successors = (0..successor_slots(&kind)).map(|_| PackedOption::default()).collect();
        let copy = self.nodes.push(NodeData {
            kind,
            inputs: SmallVec::new(),
            successors,
            predecessor: PackedOption::default(),
            usages: SmallVec::new(),
            stamp,
            position,
            alive: true,
        });
        self.live += 1;
        self.record_change(copy);
        copy
    }

    fn infer_stamp(&self, kind: &NodeKind, inputs: &[Node]) -> Stamp {
        let int = |index: usize| {
            inputs.get(index).and_then(|input| self.nodes[*input].stamp.as_int().copied())
        };
        let binary = |f: fn(&IntegerStamp, &IntegerStamp) -> IntegerStamp| match (int(0), int(1)) {
            (Some(x), Some(y)) => Stamp::Int(f(&x, &y)),
            (Some(x), None) => Stamp::int(x.bits()),
            _ => Stamp::int(32),
        };
        match kind {
            NodeKind::Add => binary(IntegerStamp::add),
            NodeKind::Sub => binary(IntegerStamp::sub),
            NodeKind::Mul => binary(IntegerStamp::mul),
            NodeKind::Div => binary(IntegerStamp::div),
            NodeKind::Min => binary(IntegerStamp::min),
            NodeKind::Max => binary(IntegerStamp::max),
            NodeKind::Shl => match (int(0), int(1)) {
                (Some(x), Some(y)) => match (x.as_constant(), y.as_constant()) {
                    (Some(a), Some(b)) => NodeKind::Shl
                        .fold_integer(x.bits(), &[a, b])
                        .map(|v| Stamp::constant(x.bits(), v))
                        .unwrap_or(Stamp::int(x.bits())),
                    _ => Stamp::int(x.bits()),
                },
                (Some(x), None) => Stamp::int(x.bits()),
                _ => Stamp::int(32),
            },
            NodeKind::Neg => int(0).map(|x| Stamp::Int(x.neg())).unwrap_or(Stamp::int(32)),
            // The whole point of an opaque node is to hide its input from folding
            NodeKind::Opaque => int(0).map(|x| Stamp::int(x.bits())).unwrap_or(Stamp::int(32)),
            NodeKind::Phi => {
                let Some(merge) = inputs.first() else {
                    return Stamp::Void;
                };
                let mut values = inputs[1..].iter().map(|value| self.nodes[*value].stamp);
                let Some(first) = values.next() else {
                    return Stamp::Void;
                };
                if self.nodes[*merge].kind.is_loop_begin() {
                    match first {
                        Stamp::Int(stamp) => Stamp::int(stamp.bits()),
                        other => other,
                    }
                } else {
                    values.fold(first, |acc, stamp| acc.meet(&stamp))
                }
            }
            NodeKind::ValueProxy | NodeKind::Pi => {
                inputs.first().map(|input| self.nodes[*input].stamp).unwrap_or(Stamp::Void)
            }
            kind => default_stamp(kind),
        }
    }

    /// Recompute the stamp of `node` from its inputs, returning true if it changed
    pub fn refresh_stamp(&mut self, node: Node) -> bool {
        if matches!(self.nodes[node].kind, NodeKind::Parameter(_)) {
            return false;
        }
        let stamp = self.infer_stamp(&self.nodes[node].kind, &self.nodes[node].inputs);
        let changed = self.nodes[node].stamp != stamp;
        self.nodes[node].stamp = stamp;
        changed
    }

    // Inputs and usages
    // ---------------------------------------------------------------------------------------

    fn remove_usage(&mut self, input: Node, user: Node) {
        let usages = &mut self.nodes[input].usages;
        if let Some(pos) = usages.iter().position(|u| *u == user) {
            usages.remove(pos);
        }
        self.record_change(input);
    }

    pub fn set_input(&mut self, node: Node, index: usize, value: Node) {
        let old = self.nodes[node].inputs[index];
        if old == value {
            return;
        }
        self.remove_usage(old, node);
        self.nodes[node].inputs[index] = value;
        self.nodes[value].usages.push(node);
        self.record_change(node);
    }

    pub fn push_input(&mut self, node: Node, value: Node) {
        self.nodes[node].inputs.push(value);
        self.nodes[value].usages.push(node);
        self.record_change(node);
    }

    pub fn insert_input(&mut self, node: Node, index: usize, value: Node) {
        self.nodes[node].inputs.insert(index, value);
        self.nodes[value].usages.push(node);
        self.record_change(node);
    }

    pub fn remove_input(&mut self, node: Node, index: usize) -> Node {
        let old = self.nodes[node].inputs.remove(index);
        self.remove_usage(old, node);
        self.record_change(node);
        old
    }

    /// Replace all inputs of `node`
    pub fn set_inputs(&mut self, node: Node, inputs: &[Node]) {
        let old = core::mem::take(&mut self.nodes[node].inputs);
        for input in old {
            self.remove_usage(input, node);
        }
        for &input in inputs {
            self.nodes[input].usages.push(node);
        }
        self.nodes[node].inputs = SmallVec::from_slice(inputs);
        self.record_change(node);
    }

    /// Replace every input slot of `node` holding `old` with `new`, returning how many changed
    pub fn replace_input(&mut self, node: Node, old: Node, new: Node) -> usize {
        let mut count = 0;
        for index in 0..self.nodes[node].inputs.len() {
            if self.nodes[node].inputs[index] == old {
                self.set_input(node, index, new);
                count += 1;
            }
        }
        count
    }

    /// Make every user of `old` use `new` instead
    pub fn replace_at_usages(&mut self, old: Node, new: Node) {
        self.replace_at_usages_where(old, new, |_, _| true);
    }

    /// Make every user of `old` which satisfies `predicate` use `new` instead
    pub fn replace_at_usages_where(
        &mut self,
        old: Node,
        new: Node,
        predicate: impl Fn(&Self, Node) -> bool,
    ) {
        debug_assert_ne!(old, new);
        let mut users: SmallVec<[Node; 8]> = SmallVec::from_slice(&self.nodes[old].usages);
        users.sort_unstable();
        users.dedup();
        for user in users {
            if user != new && predicate(self, user) {
                self.replace_input(user, old, new);
            }
        }
    }

    // Control flow
    // ---------------------------------------------------------------------------------------

    /// The successors of `node` which are present
    pub fn successors(&self, node: Node) -> impl Iterator<Item = Node> + '_ {
        self.nodes[node].successors.iter().filter_map(|s| s.expand())
    }

    #[inline]
    pub fn successor(&self, node: Node, index: usize) -> Option<Node> {
        self.nodes[node].successors.get(index).and_then(|s| s.expand())
    }

    #[inline]
    pub fn successor_count(&self, node: Node) -> usize {
        self.nodes[node].successors.len()
    }

    /// The single successor of a fixed node with a `next` edge
    #[inline]
    pub fn next(&self, node: Node) -> Option<Node> {
        if self.nodes[node].kind.is_fixed_with_next() {
            self.successor(node, 0)
        } else {
            None
        }
    }

    #[inline]
    pub fn predecessor(&self, node: Node) -> Option<Node> {
        self.nodes[node].predecessor.expand()
    }

    /// The true successor of an `If`
    #[inline]
    pub fn true_successor(&self, node: Node) -> Option<Node> {
        self.successor(node, 0)
    }

    /// The false successor of an `If`
    #[inline]
    pub fn false_successor(&self, node: Node) -> Option<Node> {
        self.successor(node, 1)
    }

    /// Set successor slot `index` of `node`, maintaining predecessor links on both the old and
    /// the new successor.
    pub fn set_successor(&mut self, node: Node, index: usize, successor: Option<Node>) {
        if let Some(old) = self.nodes[node].successors[index].expand() {
            self.nodes[old].predecessor = PackedOption::default();
            self.record_change(old);
        }
        if let Some(successor) = successor {
            debug_assert!(
                self.nodes[successor].predecessor.is_none(),
                "{successor} already has predecessor {}",
                self.nodes[successor].predecessor.unwrap()
            );
            self.nodes[successor].predecessor = node.into();
            self.record_change(successor);
        }
        self.nodes[node].successors[index] = successor.into();
        self.record_change(node);
    }

    #[inline]
    pub fn set_next(&mut self, node: Node, next: Option<Node>) {
        self.set_successor(node, 0, next);
    }

    /// The successor slot of `pred` which points at `node`
    pub fn successor_index(&self, pred: Node, node: Node) -> Option<usize> {
        self.nodes[pred].successors.iter().position(|s| s.expand() == Some(node))
    }

    /// Make the predecessor of `old` point at `new` instead
    pub fn replace_at_predecessor(&mut self, old: Node, new: Option<Node>) {
        if let Some(pred) = self.predecessor(old) {
            let index = self.successor_index(pred, old).expect("inconsistent predecessor link");
            self.set_successor(pred, index, new);
        }
    }

    /// Unlink a fixed node with a single successor from the control-flow chain, connecting its
    /// predecessor directly to its successor.
    pub fn remove_fixed(&mut self, node: Node) {
        debug_assert!(self.nodes[node].kind.is_fixed_with_next());
        let next = self.next(node);
        self.set_next(node, None);
        self.replace_at_predecessor(node, next);
    }

    /// Insert the unlinked fixed node `new` directly after `anchor`
    pub fn add_after_fixed(&mut self, anchor: Node, new: Node) {
        let next = self.next(anchor);
        self.set_next(anchor, None);
        self.set_next(new, next);
        self.set_next(anchor, Some(new));
    }

    /// Insert the unlinked fixed node `new` directly before `node`
    pub fn add_before_fixed(&mut self, node: Node, new: Node) {
        let pred = self.predecessor(node).expect("cannot insert before a node without predecessor");
        let index = self.successor_index(pred, node).expect("inconsistent predecessor link");
        self.set_successor(pred, index, None);
        self.set_next(new, Some(node));
        self.set_successor(pred, index, Some(new));
    }

    // Merges, phis, loops
    // ---------------------------------------------------------------------------------------

    /// The merge (or loop begin) an `End` or `LoopEnd` flows into
    pub fn merge_of(&self, end: Node) -> Option<Node> {
        self.nodes[end]
            .usages
            .iter()
            .copied()
            .find(|user| self.nodes[*user].kind.is_merge())
    }

    /// The loop begin of a `LoopEnd` or `LoopExit`
    pub fn loop_begin_of(&self, node: Node) -> Option<Node> {
        match self.nodes[node].kind {
            NodeKind::LoopExit(_) => self.nodes[node].inputs.first().copied(),
            NodeKind::LoopEnd(_) => self.merge_of(node),
            _ => None,
        }
    }

    /// The ends flowing into a merge, in phi value order
    #[inline]
    pub fn ends(&self, merge: Node) -> &[Node] {
        &self.nodes[merge].inputs
    }

    #[inline]
    pub fn forward_end(&self, loop_begin: Node) -> Node {
        self.nodes[loop_begin].inputs[0]
    }

    #[inline]
    pub fn loop_ends(&self, loop_begin: Node) -> &[Node] {
        &self.nodes[loop_begin].inputs[1..]
    }

    pub fn end_index(&self, merge: Node, end: Node) -> Option<usize> {
        self.nodes[merge].inputs.iter().position(|e| *e == end)
    }

    pub fn loop_exits(&self, loop_begin: Node) -> SmallVec<[Node; 2]> {
        self.usages_matching(loop_begin, |kind| matches!(kind, NodeKind::LoopExit(_)))
    }

    pub fn phis(&self, merge: Node) -> SmallVec<[Node; 4]> {
        let mut phis: SmallVec<[Node; 4]> = self.nodes[merge]
            .usages
            .iter()
            .copied()
            .filter(|u| {
                matches!(self.nodes[*u].kind, NodeKind::Phi) && self.nodes[*u].inputs[0] == merge
            })
            .collect();
        phis.sort_unstable();
        phis.dedup();
        phis
    }

    #[inline]
    pub fn phi_merge(&self, phi: Node) -> Node {
        self.nodes[phi].inputs[0]
    }

    #[inline]
    pub fn phi_values(&self, phi: Node) -> &[Node] {
        &self.nodes[phi].inputs[1..]
    }

    #[inline]
    pub fn phi_value_at(&self, phi: Node, index: usize) -> Node {
        self.nodes[phi].inputs[1 + index]
    }

    #[inline]
    pub fn set_phi_value(&mut self, phi: Node, index: usize, value: Node) {
        self.set_input(phi, 1 + index, value);
    }

    pub fn is_loop_phi(&self, node: Node) -> bool {
        matches!(self.nodes[node].kind, NodeKind::Phi)
            && self.nodes[self.nodes[node].inputs[0]].kind.is_loop_begin()
    }

    /// Add `end` as the last end of `merge`. The caller must append a value to every phi.
    pub fn push_end(&mut self, merge: Node, end: Node) {
        self.push_input(merge, end);
    }

    /// Remove `end` from `merge`, dropping the corresponding value of every phi
    pub fn remove_end(&mut self, merge: Node, end: Node) {
        let Some(index) = self.end_index(merge, end) else {
            return;
        };
        for phi in self.phis(merge) {
            self.remove_input(phi, 1 + index);
        }
        self.remove_input(merge, index);
    }

    /// The value proxies attached to a loop exit
    pub fn proxies(&self, exit: Node) -> SmallVec<[Node; 4]> {
        let mut proxies: SmallVec<[Node; 4]> = self.nodes[exit]
            .usages
            .iter()
            .copied()
            .filter(|u| {
                matches!(self.nodes[*u].kind, NodeKind::ValueProxy)
                    && self.nodes[*u].inputs[1] == exit
            })
            .collect();
        proxies.sort_unstable();
        proxies.dedup();
        proxies
    }

    /// The floating guards anchored at `anchor`
    pub fn guards_anchored_at(&self, anchor: Node) -> SmallVec<[Node; 4]> {
        let mut guards: SmallVec<[Node; 4]> = self.nodes[anchor]
            .usages
            .iter()
            .copied()
            .filter(|u| {
                matches!(self.nodes[*u].kind, NodeKind::Guard(_))
                    && self.nodes[*u].inputs[1] == anchor
            })
            .collect();
        guards.sort_unstable();
        guards.dedup();
        guards
    }

    pub fn usages_matching(
        &self,
        node: Node,
        predicate: impl Fn(&NodeKind) -> bool,
    ) -> SmallVec<[Node; 2]> {
        let mut users: SmallVec<[Node; 2]> = self.nodes[node]
            .usages
            .iter()
            .copied()
            .filter(|u| predicate(&self.nodes[*u].kind))
            .collect();
        users.sort_unstable();
        users.dedup();
        users
    }

    /// The begin node of the block containing the fixed node `node`
    pub fn prev_begin(&self, node: Node) -> Node {
        let mut current = node;
        loop {
            if self.nodes[current].kind.is_begin() {
                return current;
            }
            match self.predecessor(current) {
                Some(pred) => current = pred,
                None => return current,
            }
        }
    }

    // Deletion
    // ---------------------------------------------------------------------------------------

    /// Delete `node`, which must have no remaining usages.
    ///
    /// The node is unlinked from its inputs and from the control-flow chain.
    pub fn delete(&mut self, node: Node) {
        debug_assert!(self.nodes[node].alive, "{node} deleted twice");
        debug_assert!(
            self.nodes[node].usages.iter().all(|u| !self.nodes[*u].alive || *u == node),
            "{node} deleted while still in use by {:?}",
            self.nodes[node].usages
        );
        self.replace_at_predecessor(node, None);
        for index in 0..self.nodes[node].successors.len() {
            if self.nodes[node].successors[index].is_some() {
                self.set_successor(node, index, None);
            }
        }
        let inputs = core::mem::take(&mut self.nodes[node].inputs);
        for input in inputs {
            if input != node {
                self.remove_usage(input, node);
            }
        }
        self.nodes[node].usages.clear();
        self.nodes[node].alive = false;
        self.live -= 1;
    }

    /// Delete `node` if it is a floating node without usages, and then do the same for its
    /// inputs, transitively.
    ///
    /// Floating guards are never deleted this way: they are kept alive by their anchor.
    /// Parameters are never deleted either.
    pub fn kill_if_unused(&mut self, node: Node) {
        let mut worklist: SmallVec<[Node; 8]> = smallvec::smallvec![node];
        while let Some(node) = worklist.pop() {
            if !self.is_alive(node) {
                continue;
            }
            let data = &self.nodes[node];
            let unused = data.usages.iter().all(|u| *u == node);
            if !unused
                || data.kind.is_fixed()
                || matches!(data.kind, NodeKind::Guard(_) | NodeKind::Parameter(_))
            {
                continue;
            }
            let inputs: SmallVec<[Node; 4]> = SmallVec::from_slice(&data.inputs);
            self.delete(node);
            worklist.extend(inputs);
        }
    }

    /// Delete `node` and then any of its inputs which became unused
    pub fn delete_with_unused_inputs(&mut self, node: Node) {
        let inputs: SmallVec<[Node; 4]> = SmallVec::from_slice(&self.nodes[node].inputs);
        self.delete(node);
        for input in inputs {
            self.kill_if_unused(input);
        }
    }

    // Change tracking
    // ---------------------------------------------------------------------------------------

    /// Start recording nodes which are created or whose edges change
    pub fn track_changes(&mut self) {
        self.changes = Some(ChangeLog::default());
    }

    /// Stop recording changes, and return the nodes changed since [Graph::track_changes]
    pub fn take_changes(&mut self) -> Vec<Node> {
        self.changes.take().map(|log| log.nodes).unwrap_or_default()
    }

    #[inline]
    pub fn is_tracking_changes(&self) -> bool {
        self.changes.is_some()
    }

    /// Return the nodes changed so far, and keep recording
    pub fn drain_changes(&mut self) -> Vec<Node> {
        match self.changes.as_mut() {
            Some(log) => {
                log.seen.clear();
                core::mem::take(&mut log.nodes)
            }
            None => Vec::new(),
        }
    }

    /// Record `node` as changed, if changes are being tracked
    #[inline]
    pub fn mark_changed(&mut self, node: Node) {
        self.record_change(node);
    }

    #[inline]
    fn record_change(&mut self, node: Node) {
        if let Some(log) = self.changes.as_mut() {
            if log.seen.insert(node) {
                log.nodes.push(node);
            }
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn constants_are_value_numbered() {
        let mut graph = Graph::new(MethodId(0));
        let a = graph.int(3);
        let b = graph.int(3);
        let c = graph.constant(64, 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let x = graph.add(NodeKind::Parameter(0), &[]);
        let sum1 = graph.unique(NodeKind::Add, &[x, a]);
        let sum2 = graph.unique(NodeKind::Add, &[x, a]);
        assert_eq!(sum1, sum2);
        assert_eq!(graph.usages(a), &[sum1]);
    }

    #[test]
    fn replace_at_usages_updates_edges() {
        let mut graph = Graph::new(MethodId(0));
        let x = graph.add(NodeKind::Parameter(0), &[]);
        let y = graph.add(NodeKind::Parameter(1), &[]);
        let add = graph.add(NodeKind::Add, &[x, x]);
        graph.replace_at_usages(x, y);
        assert_eq!(graph.inputs(add), &[y, y]);
        assert!(!graph.has_usages(x));
        assert_eq!(graph.usages(y).len(), 2);
    }

    #[test]
    fn fixed_chain_editing() {
        let mut graph = Graph::new(MethodId(0));
        let start = graph.start();
        let ret = graph.add(NodeKind::Return, &[]);
        graph.set_next(start, Some(ret));
        let call = graph.add(NodeKind::Invoke { target: 1 }, &[]);
        graph.add_before_fixed(ret, call);
        assert_eq!(graph.next(start), Some(call));
        assert_eq!(graph.next(call), Some(ret));
        assert_eq!(graph.predecessor(ret), Some(call));
        graph.remove_fixed(call);
        assert_eq!(graph.next(start), Some(ret));
        assert_eq!(graph.predecessor(call), None);
        graph.delete(call);
        assert!(!graph.is_alive(call));
    }

    #[test]
    fn unused_inputs_are_killed() {
        let mut graph = Graph::new(MethodId(0));
        let x = graph.add(NodeKind::Parameter(0), &[]);
        let one = graph.int(1);
        let add = graph.add(NodeKind::Add, &[x, one]);
        let neg = graph.add(NodeKind::Neg, &[add]);
        graph.kill_if_unused(neg);
        assert!(!graph.is_alive(neg));
        assert!(!graph.is_alive(add));
        assert!(!graph.is_alive(one));
        assert!(graph.is_alive(x));
    }
}
