//! Guards are the floating form of a deoptimization check.
//!
//! A [NodeKind::Guard] has two inputs: the condition it checks, and an anchor, which is the
//! begin node of the block the guard may not float above. The guard deoptimizes when its
//! condition evaluates to its `negated` flag. Operations which depend on the check having passed
//! (e.g. an array load after a range check) take the guard as an input, which keeps them from
//! floating above it.
//!
//! Unlike other floating nodes, a guard without usages is not dead: it still performs its
//! check once control reaches its anchor.
use smallvec::SmallVec;

use crate::{Graph, GuardInfo, Node, NodeKind};

impl Graph {
    /// Create (or reuse an equal) floating guard for `condition`, anchored at `anchor`.
    ///
    /// A negated condition is folded into the guard's polarity.
    pub fn add_guard(&mut self, condition: Node, anchor: Node, mut info: GuardInfo) -> Node {
        debug_assert!(self.kind(anchor).is_begin(), "guards must be anchored at a begin node");
        let mut condition = condition;
        while matches!(self.kind(condition), NodeKind::LogicNegation) {
            condition = self.input(condition, 0);
            info.negated = !info.negated;
        }
        self.unique(NodeKind::Guard(info), &[condition, anchor])
    }

    #[inline]
    pub fn guard_condition(&self, guard: Node) -> Node {
        self.input(guard, 0)
    }

    /// The anchor of a floating guard
    #[inline]
    pub fn guard_anchor(&self, guard: Node) -> Node {
        self.input(guard, 1)
    }

    pub fn guard_info(&self, guard: Node) -> GuardInfo {
        *self.kind(guard).guard_info().expect("not a guard")
    }

    /// Flip the polarity of `guard`.
    ///
    /// On its own this changes the meaning of the guard, so it must be paired with replacing the
    /// condition by its negation; see [Graph::set_guard_condition] which does both.
    pub fn negate_guard(&mut self, guard: Node) {
        if let Some(info) = self.kind_mut(guard).guard_info_mut() {
            info.negated = !info.negated;
        }
    }

    /// Replace the condition of `guard`, along with its polarity
    pub fn set_guard_condition(&mut self, guard: Node, condition: Node, negated: bool) {
        self.set_input(guard, 0, condition);
        if let Some(info) = self.kind_mut(guard).guard_info_mut() {
            info.negated = negated;
        }
    }

    /// Move a floating guard to a new anchor.
    ///
    /// The caller must ensure `anchor` is dominated by the definitions of the guard's condition
    /// inputs, and dominates every usage of the guard.
    pub fn set_guard_anchor(&mut self, guard: Node, anchor: Node) {
        debug_assert!(matches!(self.kind(guard), NodeKind::Guard(_)));
        debug_assert!(self.kind(anchor).is_begin());
        self.set_input(guard, 1, anchor);
    }

    /// Combine two guarding nodes into one which is satisfied only when both are.
    ///
    /// If either is missing, the other is returned as is. Combining with an existing multi-guard
    /// produces a new multi-guard containing the union of both.
    pub fn combine_guards(&mut self, first: Option<Node>, second: Option<Node>) -> Option<Node> {
        let (first, second) = match (first, second) {
            (None, other) | (other, None) => return other,
            (Some(first), Some(second)) if first == second => return Some(first),
            (Some(first), Some(second)) => (first, second),
        };
        let mut guards: SmallVec<[Node; 4]> = SmallVec::new();
        for guard in [first, second] {
            if matches!(self.kind(guard), NodeKind::MultiGuard) {
                guards.extend(self.inputs(guard).iter().copied());
            } else {
                guards.push(guard);
            }
        }
        let mut seen: SmallVec<[Node; 4]> = SmallVec::new();
        guards.retain(|g| {
            if seen.contains(g) {
                false
            } else {
                seen.push(*g);
                true
            }
        });
        Some(self.unique(NodeKind::MultiGuard, &guards))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{DeoptimizationAction, DeoptimizationReason, Graph, GuardInfo, MethodId, NodeKind};

    fn info() -> GuardInfo {
        GuardInfo::new(
            DeoptimizationReason::BoundsCheckException,
            DeoptimizationAction::InvalidateReprofile,
        )
    }

    #[test]
    fn negated_conditions_fold_into_polarity() {
        let mut graph = Graph::new(MethodId(0));
        let begin = graph.start();
        let x = graph.add(NodeKind::Parameter(0), &[]);
        let zero = graph.int(0);
        let lt = graph.unique(NodeKind::IntegerLessThan, &[x, zero]);
        let not = graph.unique(NodeKind::LogicNegation, &[lt]);
        let guard = graph.add_guard(not, begin, info());
        assert_eq!(graph.guard_condition(guard), lt);
        assert!(graph.guard_info(guard).negated);
        // Guards are value numbered
        assert_eq!(graph.add_guard(lt, begin, info().negated(true)), guard);
    }

    #[test]
    fn polarity_follows_the_condition() {
        let mut graph = Graph::new(MethodId(0));
        let begin = graph.start();
        let x = graph.add(NodeKind::Parameter(0), &[]);
        let zero = graph.int(0);
        let lt = graph.unique(NodeKind::IntegerLessThan, &[x, zero]);
        let eq = graph.unique(NodeKind::IntegerEquals, &[x, zero]);
        let guard = graph.add_guard(lt, begin, info());
        graph.negate_guard(guard);
        assert!(graph.guard_info(guard).negated);
        assert!(graph.guard_info(guard).fails_on(true));

        graph.set_guard_condition(guard, eq, false);
        assert_eq!(graph.guard_condition(guard), eq);
        assert!(!graph.guard_info(guard).negated);
        assert!(graph.guard_info(guard).fails_on(false));
    }

    #[test]
    fn combining_multi_guards_flattens() {
        let mut graph = Graph::new(MethodId(0));
        let begin = graph.start();
        let x = graph.add(NodeKind::Parameter(0), &[]);
        let zero = graph.int(0);
        let ten = graph.int(10);
        let a = graph.unique(NodeKind::IntegerLessThan, &[x, ten]);
        let b = graph.unique(NodeKind::IntegerLessThan, &[zero, x]);
        let c = graph.unique(NodeKind::IntegerEquals, &[x, zero]);
        let ga = graph.add_guard(a, begin, info());
        let gb = graph.add_guard(b, begin, info());
        let gc = graph.add_guard(c, begin, info().negated(true));
        assert_eq!(graph.combine_guards(None, Some(ga)), Some(ga));
        let ab = graph.combine_guards(Some(ga), Some(gb)).unwrap();
        let abc = graph.combine_guards(Some(ab), Some(gc)).unwrap();
        assert_eq!(graph.inputs(abc), &[ga, gb, gc]);
    }
}
