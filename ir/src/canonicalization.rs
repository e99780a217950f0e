//! An incremental, worklist-driven simplifier.
//!
//! The canonicalizer is handed the nodes changed by a transformation, and simplifies them
//! until no rule applies. Every simplification records the nodes it touches, which are added
//! back to the worklist, so simplifications cascade (e.g. folding a condition to a constant
//! kills a branch, which leaves a merge with a single end, which is then removed).
//!
//! `Opaque` nodes are never folded, nor looked through.
use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::{Graph, Node, NodeKind, NodeSet};

/// The bound on how many nodes a dead phi cycle may span before we stop looking
const MAX_PHI_CYCLE: usize = 64;

/// See the module documentation
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    /// The maximum number of worklist items processed per node in the graph, which bounds the
    /// work done on pathological inputs
    steps_per_node: usize,
}

impl Default for Canonicalizer {
    fn default() -> Self {
        Self { steps_per_node: 16 }
    }
}

impl Canonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simplify the whole graph
    pub fn apply_to_graph(&self, graph: &mut Graph) -> usize {
        let nodes = graph.node_snapshot();
        self.apply(graph, nodes)
    }

    /// Simplify `nodes`, and everything affected by simplifying them. Returns the number of
    /// rewrites performed.
    pub fn apply(&self, graph: &mut Graph, nodes: impl IntoIterator<Item = Node>) -> usize {
        let outer = graph.is_tracking_changes().then(|| graph.take_changes());
        graph.track_changes();

        let mut worklist: Vec<Node> = nodes.into_iter().collect();
        worklist.reverse();
        let budget = graph.capacity().saturating_mul(self.steps_per_node).max(1024);
        let mut steps = 0usize;
        let mut rewrites = 0usize;
        loop {
            while let Some(node) = worklist.pop() {
                steps += 1;
                if steps > budget {
                    log::warn!(
                        target: "canonicalizer",
                        "giving up after {steps} steps, the graph may not be fully simplified"
                    );
                    worklist.clear();
                    break;
                }
                if self.process(graph, node, &mut worklist) {
                    rewrites += 1;
                }
            }
            let changed = graph.drain_changes();
            if changed.is_empty() || steps > budget {
                break;
            }
            worklist.extend(changed.into_iter().rev());
        }

        let ours = graph.take_changes();
        if let Some(outer) = outer {
            graph.track_changes();
            for node in outer.into_iter().chain(ours) {
                graph.mark_changed(node);
            }
        }
        if rewrites > 0 {
            log::debug!(target: "canonicalizer", "applied {rewrites} rewrites");
        }
        rewrites
    }

    fn process(&self, graph: &mut Graph, node: Node, worklist: &mut Vec<Node>) -> bool {
        if !graph.is_alive(node) {
            return false;
        }
        let kind = graph.kind(node).clone();
        if kind.is_floating() {
            return self.process_floating(graph, node, &kind, worklist);
        }
        match kind {
            NodeKind::If { .. } => fold_if(graph, node),
            NodeKind::FixedGuard(info) => {
                let condition = graph.input(node, 0);
                if let NodeKind::LogicNegation = graph.kind(condition) {
                    let inner = graph.input(condition, 0);
                    graph.set_guard_condition(node, inner, !info.negated);
                    graph.kill_if_unused(condition);
                    return true;
                }
                match graph.as_logic_constant(condition) {
                    Some(value) if !info.fails_on(value) => {
                        let Some(pred) = graph.predecessor(node) else {
                            return false;
                        };
                        log::trace!(target: "canonicalizer", "removing passing fixed guard {node}");
                        let anchor = graph.prev_begin(pred);
                        graph.remove_fixed(node);
                        if graph.has_usages(node) {
                            graph.replace_at_usages(node, anchor);
                        }
                        graph.delete_with_unused_inputs(node);
                        true
                    }
                    _ => false,
                }
            }
            NodeKind::Merge if graph.ends(node).len() == 1 => remove_single_end_merge(graph, node),
            NodeKind::LoopBegin(_) if graph.loop_ends(node).is_empty() => {
                log::trace!(target: "canonicalizer", "{node} has no backedges, removing loop");
                for exit in graph.loop_exits(node) {
                    exit_to_begin(graph, exit);
                }
                remove_single_end_merge(graph, node)
            }
            _ => false,
        }
    }

    fn process_floating(
        &self,
        graph: &mut Graph,
        node: Node,
        kind: &NodeKind,
        worklist: &mut Vec<Node>,
    ) -> bool {
        if !graph.has_usages(node) && !matches!(kind, NodeKind::Guard(_) | NodeKind::Parameter(_)) {
            graph.kill_if_unused(node);
            return true;
        }
        if graph.refresh_stamp(node) {
            let users: SmallVec<[Node; 8]> = SmallVec::from_slice(graph.usages(node));
            worklist.extend(users);
        }
        if let Some(replacement) = simplify(graph, node, kind) {
            if replacement != node {
                log::trace!(
                    target: "canonicalizer",
                    "{} => {}",
                    graph.display_node(node),
                    graph.display_node(replacement)
                );
                replace(graph, node, replacement);
                return true;
            }
        }
        if let Some(equivalent) = graph.find_equivalent(node) {
            replace(graph, node, equivalent);
            return true;
        }
        if matches!(kind, NodeKind::Phi) {
            if let Some(cycle) = dead_phi_cycle(graph, node) {
                log::trace!(
                    target: "canonicalizer",
                    "removing dead phi cycle of {} nodes",
                    cycle.len()
                );
                let mut inputs = Vec::new();
                for &member in cycle.iter() {
                    let outside = graph.inputs(member).iter().filter(|i| !cycle.contains(*i));
                    inputs.extend(outside.copied());
                    graph.set_inputs(member, &[]);
                }
                for member in cycle {
                    graph.delete(member);
                }
                for input in inputs {
                    graph.kill_if_unused(input);
                }
                return true;
            }
        }
        false
    }
}

/// Replace `node` with `replacement` at all usages, then delete it
fn replace(graph: &mut Graph, node: Node, replacement: Node) {
    graph.replace_at_usages(node, replacement);
    if graph.is_alive(node) && !graph.has_usages(node) {
        graph.delete_with_unused_inputs(node);
    }
}

/// The simplified form of a floating node, if there is one
fn simplify(graph: &mut Graph, node: Node, kind: &NodeKind) -> Option<Node> {
    match kind {
        kind if kind.is_arithmetic() => simplify_arithmetic(graph, node, kind),
        kind if kind.is_compare() => {
            let x = graph.input(node, 0);
            let y = graph.input(node, 1);
            let result = if x == y {
                Some(matches!(kind, NodeKind::IntegerEquals))
            } else {
                match (graph.int_stamp(x), graph.int_stamp(y)) {
                    (Some(sx), Some(sy)) => match kind {
                        NodeKind::IntegerLessThan => sx.fold_less_than(&sy),
                        NodeKind::IntegerBelow => sx.fold_below(&sy),
                        _ => sx.fold_equals(&sy),
                    },
                    _ => None,
                }
            };
            result.map(|value| graph.logic_constant(value))
        }
        NodeKind::LogicNegation => {
            let x = graph.input(node, 0);
            match graph.kind(x) {
                NodeKind::LogicNegation => Some(graph.input(x, 0)),
                NodeKind::LogicConstant(value) => {
                    let value = !*value;
                    Some(graph.logic_constant(value))
                }
                _ => None,
            }
        }
        NodeKind::ShortCircuitOr { x_negated, y_negated } => {
            let x = graph.input(node, 0);
            let y = graph.input(node, 1);
            let x_value = graph.as_logic_constant(x).map(|v| v != *x_negated);
            let y_value = graph.as_logic_constant(y).map(|v| v != *y_negated);
            let select = |graph: &mut Graph, value: Node, negated: bool| {
                if negated { graph.unique(NodeKind::LogicNegation, &[value]) } else { value }
            };
            match (x_value, y_value) {
                (Some(true), _) | (_, Some(true)) => Some(graph.logic_constant(true)),
                (Some(false), _) => Some(select(graph, y, *y_negated)),
                (_, Some(false)) => Some(select(graph, x, *x_negated)),
                _ => None,
            }
        }
        NodeKind::Phi => {
            let mut unique_value = None;
            for &value in graph.phi_values(node) {
                if value == node || Some(value) == unique_value {
                    continue;
                }
                if unique_value.is_some() {
                    return None;
                }
                unique_value = Some(value);
            }
            unique_value
        }
        NodeKind::ValueProxy => {
            let value = graph.input(node, 0);
            is_trivially_invariant(graph, value).then_some(value)
        }
        NodeKind::Guard(info) => {
            let condition = graph.guard_condition(node);
            if let NodeKind::LogicNegation = graph.kind(condition) {
                let inner = graph.input(condition, 0);
                graph.set_guard_condition(node, inner, !info.negated);
                graph.mark_changed(node);
                return None;
            }
            match graph.as_logic_constant(condition) {
                Some(value) if !info.fails_on(value) => Some(graph.guard_anchor(node)),
                _ => None,
            }
        }
        NodeKind::MultiGuard => match graph.inputs(node) {
            [single] => Some(*single),
            _ => None,
        },
        _ => None,
    }
}

fn simplify_arithmetic(graph: &mut Graph, node: Node, kind: &NodeKind) -> Option<Node> {
    let bits = graph.bits(node);
    let inputs: SmallVec<[Node; 2]> = SmallVec::from_slice(graph.inputs(node));
    let constants: SmallVec<[Option<i64>; 2]> =
        inputs.iter().map(|i| graph.as_constant(*i)).collect();
    if constants.iter().all(Option::is_some) {
        let operands: SmallVec<[i64; 2]> = constants.iter().flatten().copied().collect();
        if let Some(value) = kind.fold_integer(bits, &operands) {
            return Some(graph.constant(bits, value));
        }
    }
    if let Some(value) = graph.int_stamp(node).and_then(|stamp| stamp.as_constant()) {
        return Some(graph.constant(bits, value));
    }
    let x = inputs[0];
    let cx = constants[0];
    let cy = constants.get(1).copied().flatten();
    match kind {
        NodeKind::Add => {
            if cy == Some(0) {
                return Some(x);
            }
            if cx == Some(0) {
                return Some(inputs[1]);
            }
            // (a + c1) + c2 => a + (c1 + c2)
            let c2 = cy?;
            if let NodeKind::Add = graph.kind(x) {
                let a = graph.input(x, 0);
                let c1 = graph.as_constant(graph.input(x, 1))?;
                let sum = NodeKind::Add.fold_integer(bits, &[c1, c2])?;
                let sum = graph.constant(bits, sum);
                return Some(graph.unique(NodeKind::Add, &[a, sum]));
            }
            None
        }
        NodeKind::Sub => {
            let y = inputs[1];
            if x == y {
                return Some(graph.constant(bits, 0));
            }
            (cy == Some(0)).then_some(x)
        }
        NodeKind::Mul => match (cx, cy) {
            (_, Some(1)) => Some(x),
            (Some(1), _) => Some(inputs[1]),
            (_, Some(0)) | (Some(0), _) => Some(graph.constant(bits, 0)),
            _ => None,
        },
        NodeKind::Div => (cy == Some(1)).then_some(x),
        NodeKind::Shl => (cy == Some(0)).then_some(x),
        NodeKind::Neg => match graph.kind(x) {
            NodeKind::Neg => Some(graph.input(x, 0)),
            _ => None,
        },
        NodeKind::Min | NodeKind::Max => {
            let y = inputs[1];
            if x == y {
                return Some(x);
            }
            let (sx, sy) = (graph.int_stamp(x)?, graph.int_stamp(y)?);
            let x_smaller = sx.upper() <= sy.lower();
            let y_smaller = sy.upper() <= sx.lower();
            match (kind, x_smaller, y_smaller) {
                (NodeKind::Min, true, _) | (NodeKind::Max, _, true) => Some(x),
                (NodeKind::Min, _, true) | (NodeKind::Max, true, _) => Some(y),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Values which are the same on every iteration of any loop, without needing to know which
/// loop is being considered
fn is_trivially_invariant(graph: &Graph, value: Node) -> bool {
    let mut visited = NodeSet::new();
    let mut worklist: SmallVec<[Node; 8]> = smallvec::smallvec![value];
    while let Some(node) = worklist.pop() {
        if !visited.insert(node) {
            continue;
        }
        if visited.len() > 16 {
            return false;
        }
        match graph.kind(node) {
            NodeKind::Constant { .. } | NodeKind::LogicConstant(_) | NodeKind::Parameter(_) => (),
            NodeKind::Phi
            | NodeKind::ValueProxy
            | NodeKind::Pi
            | NodeKind::Guard(_)
            | NodeKind::MultiGuard => {
                return false;
            }
            NodeKind::InstanceOf { .. } if graph.inputs(node).len() > 1 => return false,
            kind if kind.is_fixed() => return false,
            _ => worklist.extend(graph.inputs(node).iter().copied()),
        }
    }
    true
}

/// A phi whose only transitive users are floating computations feeding back into the phi
fn dead_phi_cycle(graph: &Graph, phi: Node) -> Option<Vec<Node>> {
    let mut visited = NodeSet::new();
    let mut members = Vec::new();
    let mut worklist: SmallVec<[Node; 8]> = smallvec::smallvec![phi];
    while let Some(node) = worklist.pop() {
        if !visited.insert(node) {
            continue;
        }
        members.push(node);
        if members.len() > MAX_PHI_CYCLE {
            return None;
        }
        let kind = graph.kind(node);
        let pure = kind.is_arithmetic()
            || matches!(kind, NodeKind::Phi | NodeKind::ValueProxy | NodeKind::Opaque);
        if !pure {
            return None;
        }
        worklist.extend(graph.usages(node).iter().copied());
    }
    Some(members)
}

/// Replace an `If` on a constant condition by its taken successor, killing the other branch
fn fold_if(graph: &mut Graph, node: Node) -> bool {
    let condition = graph.input(node, 0);
    if let NodeKind::LogicNegation = graph.kind(condition) {
        let inner = graph.input(condition, 0);
        let t = graph.true_successor(node);
        let f = graph.false_successor(node);
        graph.set_successor(node, 0, None);
        graph.set_successor(node, 1, None);
        graph.set_successor(node, 0, f);
        graph.set_successor(node, 1, t);
        graph.set_input(node, 0, inner);
        if let NodeKind::If { true_probability } = graph.kind_mut(node) {
            *true_probability = 1.0 - *true_probability;
        }
        graph.kill_if_unused(condition);
        return true;
    }
    let Some(value) = graph.as_logic_constant(condition) else {
        return false;
    };
    let (taken, dead) = if value {
        (graph.true_successor(node), graph.false_successor(node))
    } else {
        (graph.false_successor(node), graph.true_successor(node))
    };
    log::trace!(target: "canonicalizer", "folding {node} on constant {value}");
    graph.set_successor(node, 0, None);
    graph.set_successor(node, 1, None);
    graph.replace_at_predecessor(node, taken);
    if let Some(dead) = dead {
        graph.kill_cfg(dead);
    }
    graph.delete_with_unused_inputs(node);
    true
}

/// Turn a loop exit of a loop which no longer loops into a plain `Begin`
fn exit_to_begin(graph: &mut Graph, exit: Node) {
    for proxy in graph.proxies(exit) {
        let value = graph.input(proxy, 0);
        graph.replace_at_usages(proxy, value);
        graph.delete(proxy);
    }
    let begin = graph.add(NodeKind::Begin, &[]);
    let position = graph.position(exit);
    graph.set_position(begin, position);
    let next = graph.next(exit);
    graph.set_next(exit, None);
    graph.replace_at_predecessor(exit, Some(begin));
    graph.set_next(begin, next);
    graph.replace_at_usages(exit, begin);
    graph.delete(exit);
}

/// Remove a merge which has a single predecessor, splicing its successor onto the end's
/// predecessor
fn remove_single_end_merge(graph: &mut Graph, merge: Node) -> bool {
    let end = graph.ends(merge)[0];
    let Some(pred) = graph.predecessor(end) else {
        return false;
    };
    for phi in graph.phis(merge) {
        let value = graph.phi_value_at(phi, 0);
        debug_assert_ne!(value, phi);
        graph.replace_at_usages(phi, value);
        graph.delete(phi);
    }
    let next = graph.next(merge);
    graph.set_next(merge, None);
    graph.remove_input(merge, 0);
    graph.replace_at_predecessor(end, None);
    graph.delete(end);
    graph.set_next(pred, next);
    if graph.has_usages(merge) {
        let anchor = graph.prev_begin(pred);
        graph.replace_at_usages(merge, anchor);
    }
    graph.delete(merge);
    true
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        DeoptimizationReason, GraphBuilder, MethodId, NodeKind, verify::verify,
    };

    #[test]
    fn folds_constants_and_identities() {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let two = b.int(2);
        let three = b.int(3);
        let zero = b.int(0);
        let five = b.add(two, three);
        let same = b.add(x, zero);
        let sum = b.add(same, five);
        let ret = b.return_value(Some(sum));
        Canonicalizer::new().apply_to_graph(&mut graph);
        let result = graph.input(ret, 0);
        assert_eq!(graph.kind(result), &NodeKind::Add);
        assert_eq!(graph.input(result, 0), x);
        assert_eq!(graph.as_constant(graph.input(result, 1)), Some(5));
        assert!(!graph.is_alive(same));
    }

    #[test]
    fn opaque_is_never_folded() {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let four = b.int(4);
        let opaque = b.graph().add(NodeKind::Opaque, &[four]);
        let ret = b.return_value(Some(opaque));
        Canonicalizer::new().apply_to_graph(&mut graph);
        assert_eq!(graph.input(ret, 0), opaque);
        assert!(graph.is_alive(opaque));
    }

    #[test]
    fn constant_branch_is_folded() {
        crate::init_logging();
        // if (3 < 4) return 1 else return 2
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let three = b.int(3);
        let four = b.int(4);
        let cond = b.less_than(three, four);
        let (t, f) = b.branch(cond, 0.5);
        b.position_at(t);
        let one = b.int(1);
        let r1 = b.return_value(Some(one));
        b.position_at(f);
        let two = b.int(2);
        let r2 = b.return_value(Some(two));
        Canonicalizer::new().apply_to_graph(&mut graph);
        assert!(graph.is_alive(r1));
        assert!(!graph.is_alive(r2));
        assert!(!graph.is_alive(f));
        assert!(graph.nodes_matching(|k| matches!(k, NodeKind::If { .. })).is_empty());
        assert!(verify(&graph).is_ok());
    }

    #[test]
    fn loop_without_backedge_is_removed() {
        // A loop whose body always exits becomes straight-line code
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let zero = b.int(0);
        let one = b.int(1);
        let scaffold = b.loop_begin(1.0);
        let i = b.loop_phi(&scaffold, zero);
        let never = b.graph().logic_constant(false);
        let exit = b.loop_exit_if(&scaffold, never, true, 0.5);
        let next = b.add(i, one);
        b.loop_end(&scaffold, &[(i, next)]);
        b.position_at(exit);
        let result = b.proxy(i, exit);
        let ret = b.return_value(Some(result));
        Canonicalizer::new().apply_to_graph(&mut graph);
        assert!(!graph.is_alive(scaffold.begin));
        assert_eq!(graph.input(ret, 0), zero);
        assert_eq!(graph.next(graph.start()), graph.predecessor(ret));
        assert!(verify(&graph).is_ok());
    }

    #[test]
    fn passing_guards_are_removed() {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let arr = b.array_parameter(0);
        let len = b.array_length(arr);
        let minus_one = b.int(-1);
        // An array length is never below -1 as a signed value
        let cond = b.less_than(minus_one, len);
        let guard = b.guard(cond, DeoptimizationReason::BoundsCheckException, false);
        let zero = b.int(0);
        let load = b.load_indexed(arr, zero, Some(guard));
        b.return_value(Some(load));
        Canonicalizer::new().apply_to_graph(&mut graph);
        assert!(!graph.is_alive(guard));
        assert_eq!(graph.inputs(load)[2], graph.start());
    }

    #[test]
    fn single_value_phis_are_removed() {
        let mut graph = Graph::new(MethodId(0));
        let mut b = GraphBuilder::new(&mut graph);
        let x = b.int_parameter(0);
        let scaffold = b.loop_begin(2.0);
        let phi = b.loop_phi(&scaffold, x);
        let zero = b.int(0);
        let cond = b.less_than(phi, zero);
        let exit = b.loop_exit_if(&scaffold, cond, false, 0.5);
        b.loop_end(&scaffold, &[]);
        b.position_at(exit);
        b.return_value(None);
        Canonicalizer::new().apply_to_graph(&mut graph);
        assert!(!graph.is_alive(phi));
        assert!(graph.is_alive(scaffold.begin));
        assert!(verify(&graph).is_ok());
    }
}
