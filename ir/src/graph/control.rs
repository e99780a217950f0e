use alloc::vec::Vec;

use smallvec::SmallVec;

use super::Graph;
use crate::{Node, NodeKind, NodeSet};

impl Graph {
    /// Kill the control-flow subgraph rooted at `root`, which has become unreachable.
    ///
    /// Every fixed node reachable from `root` without passing through a surviving merge is
    /// deleted, along with the floating nodes which depend on deleted nodes (phis of dead
    /// merges, proxies of dead exits, guards anchored at dead begins, ...). A merge which loses
    /// its last end is killed too, as is a loop whose forward end is killed.
    ///
    /// The caller is expected to have detached `root` from its predecessor, or to be deleting
    /// the predecessor as well.
    pub fn kill_cfg(&mut self, root: Node) {
        let mut dead = NodeSet::with_capacity(self.capacity());
        let mut order = Vec::new();
        let mut worklist: Vec<Node> = alloc::vec![root];
        while let Some(node) = worklist.pop() {
            if !self.is_alive(node) || !dead.insert(node) {
                continue;
            }
            order.push(node);
            match self.kind(node) {
                NodeKind::End | NodeKind::LoopEnd(_) => {
                    let Some(merge) = self.merge_of(node) else {
                        continue;
                    };
                    if dead.contains(merge) {
                        continue;
                    }
                    let is_forward_end =
                        self.kind(merge).is_loop_begin() && self.forward_end(merge) == node;
                    self.remove_end(merge, node);
                    let now_unreachable = match self.kind(merge) {
                        NodeKind::LoopBegin(_) => is_forward_end,
                        _ => self.ends(merge).is_empty(),
                    };
                    if now_unreachable {
                        log::trace!(target: "kill-cfg", "{merge} became unreachable");
                        worklist.push(merge);
                    }
                }
                NodeKind::LoopBegin(_) => {
                    // A dead loop takes its backedges and exits with it
                    let loop_ends: SmallVec<[Node; 2]> = SmallVec::from_slice(self.loop_ends(node));
                    worklist.extend(loop_ends);
                    worklist.extend(self.loop_exits(node));
                    worklist.extend(self.successors(node));
                }
                _ => worklist.extend(self.successors(node)),
            }
        }

        // Collect the floating nodes which depend on dead nodes
        let mut index = 0;
        while index < order.len() {
            let node = order[index];
            index += 1;
            let users: SmallVec<[Node; 8]> = SmallVec::from_slice(self.usages(node));
            for user in users {
                if !self.is_alive(user) || dead.contains(user) {
                    continue;
                }
                if self.kind(user).is_floating() {
                    dead.insert(user);
                    order.push(user);
                }
            }
        }

        // Detach everything first, so that deletion never observes a dangling edge
        let mut inputs_to_revisit = Vec::new();
        for &node in order.iter() {
            if let Some(pred) = self.predecessor(node) {
                if !dead.contains(pred) {
                    self.replace_at_predecessor(node, None);
                }
            }
            for index in 0..self.successor_count(node) {
                if self.successor(node, index).is_some() {
                    self.set_successor(node, index, None);
                }
            }
        }
        for &node in order.iter() {
            for &input in self.inputs(node) {
                if !dead.contains(input) {
                    inputs_to_revisit.push(input);
                }
            }
        }
        for &node in order.iter() {
            let inputs: SmallVec<[Node; 4]> = SmallVec::from_slice(self.inputs(node));
            for (index, _) in inputs.iter().enumerate().rev() {
                self.remove_input(node, index);
            }
        }
        for &node in order.iter() {
            // Any remaining usage is by another dead node whose inputs were cleared above, or
            // by a fixed node outside the dead region. The latter is a malformed graph.
            debug_assert!(
                self.usages(node).iter().all(|u| dead.contains(*u)),
                "{node} killed while still in use by live nodes {:?}",
                self.usages(node)
            );
            self.delete(node);
        }
        for input in inputs_to_revisit {
            self.kill_if_unused(input);
        }
        log::trace!(target: "kill-cfg", "killed {} nodes from {root}", order.len());
    }
}
