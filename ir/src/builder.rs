use crate::{
    DeoptInfo, DeoptimizationAction, DeoptimizationReason, Graph, GuardInfo, LoopBeginInfo,
    Node, NodeKind, SafepointState, Stamp,
};

/// A loop under construction by a [GraphBuilder]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LoopScaffold {
    pub begin: Node,
    pub forward_end: Node,
}

/// A cursor-based helper for constructing graphs.
///
/// Fixed nodes are appended after the cursor, which then moves past them. Nodes which end a
/// block (`If`, `End`, `Return`, ...) leave the builder without a cursor until it is
/// repositioned with [GraphBuilder::position_at].
pub struct GraphBuilder<'g> {
    graph: &'g mut Graph,
    cursor: Option<Node>,
    position: Option<u32>,
}

impl<'g> GraphBuilder<'g> {
    /// Start building at the start node of `graph`
    pub fn new(graph: &'g mut Graph) -> Self {
        let cursor = Some(graph.start());
        Self {
            graph,
            cursor,
            position: None,
        }
    }

    pub fn at(graph: &'g mut Graph, node: Node) -> Self {
        Self {
            graph,
            cursor: Some(node),
            position: None,
        }
    }

    #[inline]
    pub fn graph(&mut self) -> &mut Graph {
        self.graph
    }

    #[inline]
    pub fn cursor(&self) -> Option<Node> {
        self.cursor
    }

    pub fn position_at(&mut self, node: Node) {
        debug_assert!(self.graph.kind(node).is_fixed_with_next());
        self.cursor = Some(node);
    }

    /// Set the bytecode position attached to fixed nodes created from now on
    pub fn set_bytecode_position(&mut self, position: Option<u32>) {
        self.position = position;
    }

    fn append(&mut self, node: Node) -> Node {
        let cursor = self.cursor.expect("builder has no insertion point");
        self.graph.set_next(cursor, Some(node));
        self.graph.set_position(node, self.position);
        self.cursor = if self.graph.kind(node).is_fixed_with_next() {
            Some(node)
        } else {
            None
        };
        node
    }

    /// The begin node of the block the cursor is in
    pub fn current_begin(&self) -> Node {
        let cursor = self.cursor.expect("builder has no insertion point");
        self.graph.prev_begin(cursor)
    }

    // Values

    pub fn parameter(&mut self, index: u32, stamp: Stamp) -> Node {
        let node = self.graph.add(NodeKind::Parameter(index), &[]);
        self.graph.set_stamp(node, stamp);
        node
    }

    pub fn int_parameter(&mut self, index: u32) -> Node {
        self.parameter(index, Stamp::int(32))
    }

    pub fn array_parameter(&mut self, index: u32) -> Node {
        self.parameter(index, Stamp::Object { non_null: true })
    }

    pub fn int(&mut self, value: i32) -> Node {
        self.graph.int(value)
    }

    pub fn constant(&mut self, bits: u8, value: i64) -> Node {
        self.graph.constant(bits, value)
    }

    pub fn binary(&mut self, kind: NodeKind, x: Node, y: Node) -> Node {
        self.graph.unique(kind, &[x, y])
    }

    pub fn add(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::Add, x, y)
    }

    pub fn sub(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::Sub, x, y)
    }

    pub fn mul(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::Mul, x, y)
    }

    pub fn shl(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::Shl, x, y)
    }

    pub fn neg(&mut self, x: Node) -> Node {
        self.graph.unique(NodeKind::Neg, &[x])
    }

    pub fn less_than(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::IntegerLessThan, x, y)
    }

    pub fn below(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::IntegerBelow, x, y)
    }

    pub fn equals(&mut self, x: Node, y: Node) -> Node {
        self.binary(NodeKind::IntegerEquals, x, y)
    }

    pub fn not(&mut self, x: Node) -> Node {
        self.graph.unique(NodeKind::LogicNegation, &[x])
    }

    pub fn instance_of(&mut self, object: Node, type_id: u32, anchor: Option<Node>) -> Node {
        let kind = NodeKind::InstanceOf {
            type_id,
            profile: None,
        };
        match anchor {
            Some(anchor) => self.graph.add(kind, &[object, anchor]),
            None => self.graph.add(kind, &[object]),
        }
    }

    pub fn array_length(&mut self, array: Node) -> Node {
        self.graph.unique(NodeKind::ArrayLength, &[array])
    }

    pub fn proxy(&mut self, value: Node, exit: Node) -> Node {
        self.graph.add(NodeKind::ValueProxy, &[value, exit])
    }

    pub fn phi(&mut self, merge: Node, values: &[Node]) -> Node {
        let mut inputs = smallvec::SmallVec::<[Node; 4]>::new();
        inputs.push(merge);
        inputs.extend_from_slice(values);
        self.graph.add(NodeKind::Phi, &inputs)
    }

    // Fixed nodes

    pub fn load_indexed(&mut self, array: Node, index: Node, guard: Option<Node>) -> Node {
        let node = match guard {
            Some(guard) => self.graph.add(NodeKind::LoadIndexed, &[array, index, guard]),
            None => self.graph.add(NodeKind::LoadIndexed, &[array, index]),
        };
        self.append(node)
    }

    pub fn store_indexed(
        &mut self,
        array: Node,
        index: Node,
        value: Node,
        guard: Option<Node>,
    ) -> Node {
        let node = match guard {
            Some(guard) => self.graph.add(NodeKind::StoreIndexed, &[array, index, value, guard]),
            None => self.graph.add(NodeKind::StoreIndexed, &[array, index, value]),
        };
        self.append(node)
    }

    pub fn invoke(&mut self, target: u32, args: &[Node]) -> Node {
        let node = self.graph.add(NodeKind::Invoke { target }, args);
        self.append(node)
    }

    pub fn foreign_call(&mut self, target: u32, safepoint: bool, args: &[Node]) -> Node {
        let node = self.graph.add(NodeKind::ForeignCall { target, safepoint }, args);
        self.append(node)
    }

    pub fn monitor_enter(&mut self, object: Node, osr: bool) -> Node {
        let node = self.graph.add(NodeKind::MonitorEnter { osr }, &[object]);
        self.append(node)
    }

    /// A floating guard anchored at the begin of the current block
    pub fn guard(&mut self, condition: Node, reason: DeoptimizationReason, negated: bool) -> Node {
        let anchor = self.current_begin();
        let info =
            GuardInfo::new(reason, DeoptimizationAction::InvalidateReprofile).negated(negated);
        let guard = self.graph.add_guard(condition, anchor, info);
        if self.graph.position(guard).is_none() {
            self.graph.set_position(guard, self.position);
        }
        guard
    }

    pub fn fixed_guard(
        &mut self,
        condition: Node,
        reason: DeoptimizationReason,
        negated: bool,
    ) -> Node {
        let info =
            GuardInfo::new(reason, DeoptimizationAction::InvalidateReprofile).negated(negated);
        let node = self.graph.add(NodeKind::FixedGuard(info), &[condition]);
        self.append(node)
    }

    pub fn return_value(&mut self, value: Option<Node>) -> Node {
        let node = match value {
            Some(value) => self.graph.add(NodeKind::Return, &[value]),
            None => self.graph.add(NodeKind::Return, &[]),
        };
        self.append(node)
    }

    pub fn deoptimize(
        &mut self,
        reason: DeoptimizationReason,
        action: DeoptimizationAction,
    ) -> Node {
        let node = self.graph.add(NodeKind::Deoptimize(DeoptInfo::new(reason, action)), &[]);
        self.append(node)
    }

    /// Append an `If`, returning the begin nodes of its true and false successors
    pub fn branch(&mut self, condition: Node, true_probability: f64) -> (Node, Node) {
        let node = self.graph.add(NodeKind::If { true_probability }, &[condition]);
        self.append(node);
        let t = self.graph.add(NodeKind::Begin, &[]);
        let f = self.graph.add(NodeKind::Begin, &[]);
        self.graph.set_successor(node, 0, Some(t));
        self.graph.set_successor(node, 1, Some(f));
        (t, f)
    }

    /// Append an `End`, which must later be added to a merge
    pub fn end(&mut self) -> Node {
        let node = self.graph.add(NodeKind::End, &[]);
        self.append(node)
    }

    /// Create a merge of `ends`, and continue building after it
    pub fn merge(&mut self, ends: &[Node]) -> Node {
        let merge = self.graph.add(NodeKind::Merge, ends);
        self.cursor = Some(merge);
        merge
    }

    // Loops

    /// End the current block and start a loop, continuing after the new loop begin
    pub fn loop_begin(&mut self, loop_frequency: f64) -> LoopScaffold {
        let position = self.position;
        let forward_end = self.end();
        let info = LoopBeginInfo {
            loop_frequency,
            ..Default::default()
        };
        let begin = self.graph.add(NodeKind::LoopBegin(info), &[forward_end]);
        self.graph.set_position(begin, position);
        self.cursor = Some(begin);
        LoopScaffold { begin, forward_end }
    }

    /// A phi of `scaffold` with `init` as its entry value. Backedge values are supplied with
    /// [GraphBuilder::loop_end].
    pub fn loop_phi(&mut self, scaffold: &LoopScaffold, init: Node) -> Node {
        self.phi(scaffold.begin, &[init])
    }

    /// Append an `If` on `condition` where one branch leaves the loop.
    ///
    /// The builder continues in the branch which stays in the loop; the returned node is the
    /// `LoopExit` of the other branch.
    pub fn loop_exit_if(
        &mut self,
        scaffold: &LoopScaffold,
        condition: Node,
        stay_on_true: bool,
        stay_probability: f64,
    ) -> Node {
        let true_probability = if stay_on_true { stay_probability } else { 1.0 - stay_probability };
        let node = self.graph.add(NodeKind::If { true_probability }, &[condition]);
        self.append(node);
        let stay = self.graph.add(NodeKind::Begin, &[]);
        let exit = self
            .graph
            .add(NodeKind::LoopExit(SafepointState::MustSafepoint), &[scaffold.begin]);
        self.graph.set_position(exit, self.position);
        let (t, f) = if stay_on_true { (stay, exit) } else { (exit, stay) };
        self.graph.set_successor(node, 0, Some(t));
        self.graph.set_successor(node, 1, Some(f));
        self.cursor = Some(stay);
        exit
    }

    /// Close the current block with a backedge to `scaffold`, supplying the backedge value of
    /// every phi of the loop.
    pub fn loop_end(&mut self, scaffold: &LoopScaffold, backedges: &[(Node, Node)]) -> Node {
        let node = self.graph.add(NodeKind::LoopEnd(SafepointState::MustSafepoint), &[]);
        self.append(node);
        self.graph.push_end(scaffold.begin, node);
        for phi in self.graph.phis(scaffold.begin) {
            let value = backedges
                .iter()
                .find_map(|(p, v)| (*p == phi).then_some(*v))
                .unwrap_or(phi);
            self.graph.push_input(phi, value);
        }
        node
    }
}
