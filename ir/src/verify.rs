//! Structural verification of a [Graph].
//!
//! The verifier checks the invariants every transformation must preserve: edges are
//! consistent in both directions, merges and phis agree on the number of predecessors, and
//! control nodes are connected to the kinds of nodes they expect.
use alloc::{format, string::String, vec::Vec};

use crate::{CompilationError, Graph, Node, NodeKind, NodeSet};

/// Verify `graph`, returning the first violation found
pub fn verify(graph: &Graph) -> Result<(), CompilationError> {
    let mut errors = Vec::new();
    verify_edges(graph, &mut errors);
    verify_control(graph, &mut errors);
    match errors.into_iter().next() {
        None => Ok(()),
        Some(error) => {
            log::debug!(target: "verify", "graph failed verification: {error}\n{graph}");
            Err(CompilationError::InvalidGraph(error))
        }
    }
}

fn verify_edges(graph: &Graph, errors: &mut Vec<String>) {
    for node in graph.node_snapshot() {
        for &input in graph.inputs(node) {
            if !graph.is_alive(input) {
                errors.push(format!("{node} uses dead node {input}"));
                continue;
            }
            let uses = graph.inputs(node).iter().filter(|i| **i == input).count();
            let recorded = graph.usages(input).iter().filter(|u| **u == node).count();
            if uses != recorded {
                errors.push(format!(
                    "{node} uses {input} {uses} times, but {recorded} usages are recorded"
                ));
            }
        }
        for &user in graph.usages(node) {
            if !graph.is_alive(user) {
                errors.push(format!("{node} has dead usage {user}"));
            }
        }
        for succ in graph.successors(node) {
            if !graph.is_alive(succ) {
                errors.push(format!("{node} has dead successor {succ}"));
            } else if graph.predecessor(succ) != Some(node) {
                errors.push(format!("{succ} is a successor of {node}, but not linked back"));
            }
        }
        if let Some(pred) = graph.predecessor(node) {
            if graph.successor_index(pred, node).is_none() {
                errors.push(format!("{node} has predecessor {pred}, which does not point back"));
            }
        }
    }
}

fn verify_control(graph: &Graph, errors: &mut Vec<String>) {
    let mut reachable = NodeSet::with_capacity(graph.capacity());
    let mut worklist = alloc::vec![graph.start()];
    while let Some(node) = worklist.pop() {
        if !reachable.insert(node) {
            continue;
        }
        let kind = graph.kind(node);
        if kind.is_fixed_with_next() && graph.next(node).is_none() {
            errors.push(format!("{node} ({}) has no successor", kind.name()));
        }
        if kind.is_control_split() && graph.successors(node).count() != 2 {
            errors.push(format!("{node} is missing a successor"));
        }
        worklist.extend(graph.successors(node));
        if kind.is_end() {
            match graph.merge_of(node) {
                Some(merge) => worklist.push(merge),
                None => errors.push(format!("{node} does not flow into a merge")),
            }
        }
        if kind.is_loop_begin() {
            worklist.extend(graph.loop_exits(node));
        }
    }

    for node in graph.node_snapshot() {
        match graph.kind(node) {
            NodeKind::Merge => {
                if graph.ends(node).iter().any(|e| !matches!(graph.kind(*e), NodeKind::End)) {
                    errors.push(format!("merge {node} has a non-End predecessor"));
                }
            }
            NodeKind::LoopBegin(_) => {
                let ends = graph.ends(node);
                if ends.is_empty() || !matches!(graph.kind(ends[0]), NodeKind::End) {
                    errors.push(format!("loop {node} has no forward end"));
                }
                let backedge = |e: &Node| matches!(graph.kind(*e), NodeKind::LoopEnd(_));
                if !graph.loop_ends(node).iter().all(backedge) {
                    errors.push(format!("loop {node} has a backedge which is not a LoopEnd"));
                }
            }
            NodeKind::LoopExit(_) => {
                if !graph.inputs(node).first().is_some_and(|b| graph.kind(*b).is_loop_begin()) {
                    errors.push(format!("loop exit {node} does not refer to a loop"));
                }
            }
            NodeKind::Phi => {
                let merge = graph.phi_merge(node);
                if !graph.kind(merge).is_merge() {
                    errors.push(format!("phi {node} is attached to non-merge {merge}"));
                } else if graph.phi_values(node).len() != graph.ends(merge).len() {
                    errors.push(format!(
                        "phi {node} has {} values, but {merge} has {} ends",
                        graph.phi_values(node).len(),
                        graph.ends(merge).len()
                    ));
                }
            }
            NodeKind::ValueProxy => {
                let exit = graph.input(node, 1);
                if !matches!(graph.kind(exit), NodeKind::LoopExit(_)) {
                    errors.push(format!("proxy {node} is attached to non-exit {exit}"));
                }
            }
            NodeKind::Guard(_) => {
                let anchor = graph.guard_anchor(node);
                if !graph.kind(anchor).is_begin() {
                    errors.push(format!("guard {node} is anchored at non-begin {anchor}"));
                }
                if !graph.kind(graph.guard_condition(node)).is_logic() {
                    errors.push(format!("guard {node} has a non-logic condition"));
                }
            }
            NodeKind::MultiGuard => {
                if graph.inputs(node).iter().any(|g| !graph.kind(*g).is_guarding()) {
                    errors.push(format!("multi-guard {node} combines a non-guard"));
                }
            }
            kind if kind.is_fixed() && !reachable.contains(node) => {
                errors.push(format!("{node} ({}) is not reachable from start", kind.name()));
            }
            _ => (),
        }
    }
}

/// Returns true if `node` is fixed and reachable from the start node
pub fn is_reachable(graph: &Graph, node: Node) -> bool {
    if !graph.is_alive(node) || !graph.is_fixed(node) {
        return false;
    }
    let mut current = node;
    loop {
        if current == graph.start() {
            return true;
        }
        let pred = if graph.kind(current).is_merge() {
            graph.ends(current).first().copied()
        } else {
            graph.predecessor(current)
        };
        match pred {
            Some(pred) => current = pred,
            None => return false,
        }
    }
}
