use seajit_ir::{
    DeoptimizationAction, DeoptimizationReason, Graph, GuardInfo, IntegerStamp, LoopKind, Node,
    NodeKind, NodeSet, PhaseContext, SpeculationGroup, SpeculationReason,
    stamp::{max_value, min_value},
};

use crate::{
    Direction, InductionVariables, IvId,
    induction::{build_offset, constant_through_opaque},
};

/// A loop proven to iterate a number of times determined by an induction variable and a
/// loop-invariant limit.
///
/// The loop is controlled by an `If` testing `iv < limit` (or one of its equivalent forms), one
/// successor of which leaves the loop. In a *regular* loop the test is the first thing the
/// header does. In an *inverted* loop the test is at the bottom of the body, right before the
/// single backedge, so the body always runs at least once.
#[derive(Debug, Clone)]
pub struct CountedLoopInfo {
    loop_begin: Node,
    ivs: InductionVariables,
    iv: IvId,
    limit: Node,
    direction: Direction,
    inclusive: bool,
    not_equal: bool,
    inverted: bool,
    control: Node,
    exit: Node,
    body: Node,
}

impl CountedLoopInfo {
    /// Try to prove that the loop headed by `loop_begin` is counted.
    ///
    /// `ivs` and `inside` must have been computed for this loop from the current graph.
    pub fn detect(
        graph: &Graph,
        loop_begin: Node,
        ivs: &InductionVariables,
        inside: &NodeSet,
    ) -> Option<Self> {
        let (control, inverted) = match graph.next(loop_begin) {
            Some(next) if is_exit_test(graph, next, loop_begin) => (next, false),
            _ => (inverted_exit_test(graph, loop_begin)?, true),
        };
        let t = graph.true_successor(control)?;
        let f = graph.false_successor(control)?;
        let stay_on_true = !matches!(graph.kind(t), NodeKind::LoopExit(_));
        let (exit, body) = if stay_on_true { (f, t) } else { (t, f) };

        let condition = graph.input(control, 0);
        let invariant = |node: Node| !inside.contains(node);
        let (iv, limit, direction, inclusive, not_equal) = match graph.kind(condition) {
            NodeKind::IntegerLessThan => {
                let (x, y) = (graph.input(condition, 0), graph.input(condition, 1));
                let (iv, limit, iv_left) = match (ivs.lookup(x), ivs.lookup(y)) {
                    (Some(iv), _) if invariant(y) => (iv, y, true),
                    (_, Some(iv)) if invariant(x) => (iv, x, false),
                    _ => return None,
                };
                let (direction, inclusive) = match (iv_left, stay_on_true) {
                    // iv < limit
                    (true, true) => (Direction::Up, false),
                    // !(iv < limit), i.e. iv >= limit
                    (true, false) => (Direction::Down, true),
                    // limit < iv
                    (false, true) => (Direction::Down, false),
                    // !(limit < iv), i.e. iv <= limit
                    (false, false) => (Direction::Up, true),
                };
                (iv, limit, direction, inclusive, false)
            }
            NodeKind::IntegerEquals if !stay_on_true => {
                let (x, y) = (graph.input(condition, 0), graph.input(condition, 1));
                let (iv, limit) = match (ivs.lookup(x), ivs.lookup(y)) {
                    (Some(iv), _) if invariant(y) => (iv, y),
                    (_, Some(iv)) if invariant(x) => (iv, x),
                    _ => return None,
                };
                // `iv != limit` only terminates if the counter hits the limit exactly, and
                // starts on the right side of it
                let stride = ivs.constant_stride(graph, iv)?;
                let direction = match stride {
                    1 => Direction::Up,
                    -1 => Direction::Down,
                    _ => return None,
                };
                let init = ivs.init_stamp(graph, iv);
                let limit_stamp = graph.int_stamp(limit)?;
                let approaches = match direction {
                    Direction::Up => init.upper() <= limit_stamp.lower(),
                    Direction::Down => init.lower() >= limit_stamp.upper(),
                };
                if !approaches {
                    return None;
                }
                (iv, limit, direction, false, true)
            }
            _ => return None,
        };

        if ivs.direction(graph, iv) != Some(direction) {
            log::trace!(
                target: "counted-loops",
                "{loop_begin}: stride of {} does not agree with the exit test",
                ivs[iv].value()
            );
            return None;
        }
        Some(Self {
            loop_begin,
            ivs: ivs.clone(),
            iv,
            limit,
            direction,
            inclusive,
            not_equal,
            inverted,
            control,
            exit,
            body,
        })
    }

    #[inline]
    pub fn loop_begin(&self) -> Node {
        self.loop_begin
    }

    /// The induction variables of the loop, as they were when the loop was proven counted
    #[inline]
    pub fn ivs(&self) -> &InductionVariables {
        &self.ivs
    }

    /// The induction variable tested by the exit condition
    #[inline]
    pub fn iv(&self) -> IvId {
        self.iv
    }

    #[inline]
    pub fn limit(&self) -> Node {
        self.limit
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns true if the loop runs while the counter equals the limit
    #[inline]
    pub fn is_limit_inclusive(&self) -> bool {
        self.inclusive
    }

    /// Returns true if the exit test is `iv != limit`
    #[inline]
    pub fn is_not_equal(&self) -> bool {
        self.not_equal
    }

    #[inline]
    pub fn is_inverted(&self) -> bool {
        self.inverted
    }

    /// The `If` deciding whether the loop continues
    #[inline]
    pub fn control(&self) -> Node {
        self.control
    }

    /// The `LoopExit` taken when the counter reaches the limit
    #[inline]
    pub fn exit(&self) -> Node {
        self.exit
    }

    /// The successor of [CountedLoopInfo::control] which stays in the loop
    #[inline]
    pub fn body(&self) -> Node {
        self.body
    }

    pub fn kind(&self, graph: &Graph) -> LoopKind {
        graph.kind(self.loop_begin).loop_begin_info().map(|info| info.kind).unwrap_or_default()
    }

    fn bits(&self, graph: &Graph) -> u8 {
        graph.bits(self.ivs[self.iv].value())
    }

    pub fn init_node(&self, graph: &mut Graph) -> Node {
        self.ivs.init_node(graph, self.iv)
    }

    pub fn stride_node(&self, graph: &mut Graph) -> Node {
        self.ivs.stride_node(graph, self.iv)
    }

    pub fn constant_init(&self, graph: &Graph) -> Option<i64> {
        self.ivs.constant_init(graph, self.iv)
    }

    pub fn constant_stride(&self, graph: &Graph) -> Option<i64> {
        self.ivs.constant_stride(graph, self.iv)
    }

    pub fn constant_limit(&self, graph: &Graph) -> Option<i64> {
        graph.as_constant(self.limit)
    }

    // Trip counts
    // ---------------------------------------------------------------------------------------

    /// A node computing the number of times the loop body runs.
    ///
    /// Unless `assume_positive` is set, the result is clamped at 0 for loops which are not
    /// entered at all. Inverted loops always run at least once.
    pub fn max_trip_count_node(&self, graph: &mut Graph, assume_positive: bool) -> Node {
        let bits = self.bits(graph);
        let init = self.init_node(graph);
        let stride = self.stride_node(graph);
        let (range, abs_stride) = match self.direction {
            Direction::Up => (graph.unique(NodeKind::Sub, &[self.limit, init]), stride),
            Direction::Down => (
                graph.unique(NodeKind::Sub, &[init, self.limit]),
                graph.unique(NodeKind::Neg, &[stride]),
            ),
        };
        let one = graph.constant(bits, 1);
        let range = if self.inclusive {
            graph.unique(NodeKind::Add, &[range, one])
        } else {
            range
        };
        let unit = matches!(self.constant_stride(graph), Some(1 | -1));
        let mut count = if unit {
            range
        } else {
            // ceil(range / |stride|)
            let bias = graph.unique(NodeKind::Sub, &[abs_stride, one]);
            let biased = graph.unique(NodeKind::Add, &[range, bias]);
            graph.unique(NodeKind::Div, &[biased, abs_stride])
        };
        if self.inverted {
            count = graph.unique(NodeKind::Add, &[count, one]);
            count = graph.unique(NodeKind::Max, &[count, one]);
        } else if !assume_positive {
            let zero = graph.constant(bits, 0);
            count = graph.unique(NodeKind::Max, &[count, zero]);
        }
        count
    }

    /// The number of times the loop body runs, if init, limit and stride are all constant
    pub fn constant_max_trip_count(&self, graph: &Graph) -> Option<u64> {
        let init = self.constant_init(graph)? as i128;
        let limit = self.constant_limit(graph)? as i128;
        let stride = self.constant_stride(graph)? as i128;
        let (range, abs_stride) = match self.direction {
            Direction::Up => (limit - init, stride),
            Direction::Down => (init - limit, -stride),
        };
        if abs_stride <= 0 {
            return None;
        }
        let range = if self.inclusive { range + 1 } else { range };
        let count = if range <= 0 { 0 } else { (range + abs_stride - 1) / abs_stride };
        let count = if self.inverted { (count + 1).max(1) } else { count };
        u64::try_from(count).ok()
    }

    /// Returns true if the trip count is known to fit in a signed 32-bit integer.
    ///
    /// The distance between init and limit is bounded with their stamps, and divided by the
    /// smallest possible absolute stride.
    pub fn is_in_32bit_range(&self, graph: &Graph) -> bool {
        let bits = self.bits(graph);
        let init = self.ivs.init_stamp(graph, self.iv);
        let limit = graph.int_stamp(self.limit).unwrap_or(IntegerStamp::full(bits));
        let mut distance = match self.direction {
            Direction::Up => limit.upper() as i128 - init.lower() as i128,
            Direction::Down => init.upper() as i128 - limit.lower() as i128,
        };
        if self.inclusive {
            distance += 1;
        }
        let Some(abs_stride) = self.min_abs_stride(graph) else {
            return false;
        };
        let abs_stride = abs_stride as i128;
        let mut count = (distance.max(0) + abs_stride - 1) / abs_stride;
        if self.inverted {
            count += 1;
        }
        count <= i32::MAX as i128
    }

    /// The smallest magnitude the stride may have, from its constant value or its stamp
    fn min_abs_stride(&self, graph: &Graph) -> Option<u64> {
        if let Some(stride) = self.constant_stride(graph) {
            return Some(stride.unsigned_abs()).filter(|s| *s > 0);
        }
        let root = self.ivs.root(self.iv);
        if root != self.iv {
            return Some(1);
        }
        let stride = match self.ivs[root].kind() {
            crate::IvKind::Basic { stride, .. } => *stride,
            _ => return None,
        };
        let stamp = graph.int_stamp(stride)?;
        if stamp.is_strictly_positive() {
            Some(stamp.lower() as u64)
        } else if stamp.is_strictly_negative() {
            Some(stamp.upper().unsigned_abs())
        } else {
            None
        }
    }

    /// The largest magnitude the stride may have, from its constant value or its stamp
    fn max_abs_stride(&self, graph: &Graph) -> Option<i128> {
        if let Some(stride) = self.constant_stride(graph) {
            return Some(stride.unsigned_abs() as i128);
        }
        if self.ivs.root(self.iv) != self.iv {
            return None;
        }
        let stride = match self.ivs[self.iv].kind() {
            crate::IvKind::Basic { stride, .. } => *stride,
            _ => return None,
        };
        let stamp = graph.int_stamp(stride)?;
        Some((stamp.lower() as i128).abs().max((stamp.upper() as i128).abs()))
    }

    // Overflow
    // ---------------------------------------------------------------------------------------

    /// Returns true if the tested counter provably cannot overflow on its way to the limit
    pub fn counter_never_overflows(&self, graph: &Graph) -> bool {
        let bits = self.bits(graph);
        let Some(stride) = self.max_abs_stride(graph) else {
            return false;
        };
        let Some(limit) = graph.int_stamp(self.limit) else {
            return false;
        };
        // The last value which passes the test, plus one more stride, must be representable
        let slack = if self.inclusive { stride } else { stride - 1 };
        match self.direction {
            Direction::Up => limit.upper() as i128 + slack <= max_value(bits) as i128,
            Direction::Down => limit.lower() as i128 - slack >= min_value(bits) as i128,
        }
    }

    /// The loop-limit guard already protecting this loop, if any
    pub fn overflow_guard(&self, graph: &Graph) -> Option<Node> {
        graph
            .kind(self.loop_begin)
            .loop_begin_info()
            .and_then(|info| info.overflow_guard)
            .filter(|guard| graph.is_alive(*guard))
    }

    /// Returns true if the counter cannot overflow, either provably or because a loop-limit
    /// guard exists or could be created.
    pub fn ensure_no_overflow(&self, graph: &mut Graph, context: &mut PhaseContext<'_>) -> bool {
        self.counter_never_overflows(graph) || self.create_overflow_guard(graph, context).is_some()
    }

    /// Returns true if [CountedLoopInfo::create_overflow_guard] would succeed, without creating
    /// anything
    pub fn may_create_overflow_guard(&self, graph: &Graph, context: &mut PhaseContext<'_>) -> bool {
        if self.overflow_guard(graph).is_some() {
            return true;
        }
        if !graph.state().allows_overflow_guards() {
            log::trace!(
                target: "counted-loops",
                "{}: loop-limit guards are no longer allowed",
                self.loop_begin
            );
            return false;
        }
        let deopts = context.profile().deoptimization_count(DeoptimizationReason::LoopLimitCheck);
        if !context.options().allows_loop_limit_checks(deopts) {
            log::debug!(
                target: "counted-loops",
                "{}: too many loop-limit deopts ({deopts})",
                self.loop_begin
            );
            return false;
        }
        let reason = self.overflow_speculation(graph);
        if !context.speculation_log().may_speculate(&reason) {
            log::debug!(
                target: "counted-loops",
                "{}: loop-limit speculation failed before",
                self.loop_begin
            );
            return false;
        }
        true
    }

    fn overflow_speculation(&self, graph: &Graph) -> SpeculationReason {
        SpeculationReason::new(
            SpeculationGroup::LoopLimitCheck,
            graph.method(),
            graph.position(self.loop_begin).unwrap_or(0),
        )
    }

    /// Obtain the loop-limit guard of this loop, creating it if necessary.
    ///
    /// The guard is anchored before the loop, and deoptimizes if the limit is so close to the
    /// end of the counter's range that the counter would overflow before reaching it. Returns
    /// `None` if no guard may be created: the graph is past the point where loop-limit guards
    /// are allowed, the method deoptimized on them too often, or the speculation failed before.
    pub fn create_overflow_guard(
        &self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Option<Node> {
        if let Some(guard) = self.overflow_guard(graph) {
            return Some(guard);
        }
        if !self.may_create_overflow_guard(graph, context) {
            return None;
        }
        let reason = self.overflow_speculation(graph);

        let bits = self.bits(graph);
        let stride = self.stride_node(graph);
        let one = graph.constant(bits, 1);
        let condition = match self.direction {
            Direction::Up => {
                // deoptimize if max - stride (+ 1) < limit
                let max = graph.constant(bits, max_value(bits));
                let mut bound = graph.unique(NodeKind::Sub, &[max, stride]);
                if !self.inclusive {
                    bound = graph.unique(NodeKind::Add, &[bound, one]);
                }
                graph.unique(NodeKind::IntegerLessThan, &[bound, self.limit])
            }
            Direction::Down => {
                // deoptimize if limit < min + |stride| (- 1)
                let min = graph.constant(bits, min_value(bits));
                let abs_stride = graph.unique(NodeKind::Neg, &[stride]);
                let mut bound = graph.unique(NodeKind::Add, &[min, abs_stride]);
                if !self.inclusive {
                    bound = graph.unique(NodeKind::Sub, &[bound, one]);
                }
                graph.unique(NodeKind::IntegerLessThan, &[self.limit, bound])
            }
        };
        let speculation = context.speculation_log().speculate(reason);
        let anchor = graph.prev_begin(graph.forward_end(self.loop_begin));
        let info = GuardInfo::new(
            DeoptimizationReason::LoopLimitCheck,
            DeoptimizationAction::InvalidateRecompile,
        )
        .negated(true)
        .with_speculation(speculation);
        let guard = graph.add_guard(condition, anchor, info);
        if let Some(info) = graph.kind_mut(self.loop_begin).loop_begin_info_mut() {
            info.overflow_guard = Some(guard);
        }
        let begin = self.loop_begin;
        log::debug!(target: "counted-loops", "{begin}: created loop-limit guard {guard}");
        Some(guard)
    }

    // Values
    // ---------------------------------------------------------------------------------------

    /// The condition under which the body runs at least once, in terms of the values the
    /// loop is entered with
    pub fn entry_condition(&self, graph: &mut Graph) -> Node {
        if self.inverted {
            return graph.logic_constant(true);
        }
        let init = self.init_node(graph);
        let limit = self.limit;
        let (kind, x, y, negate) = match (self.not_equal, self.direction, self.inclusive) {
            (true, ..) => (NodeKind::IntegerEquals, init, limit, true),
            (false, Direction::Up, false) => (NodeKind::IntegerLessThan, init, limit, false),
            (false, Direction::Up, true) => (NodeKind::IntegerLessThan, limit, init, true),
            (false, Direction::Down, false) => (NodeKind::IntegerLessThan, limit, init, false),
            (false, Direction::Down, true) => (NodeKind::IntegerLessThan, init, limit, true),
        };
        let test = graph.unique(kind, &[x, y]);
        if negate {
            graph.unique(NodeKind::LogicNegation, &[test])
        } else {
            test
        }
    }

    /// A node computing the value of the induction variable `iv` of this loop on the last
    /// iteration.
    ///
    /// Only valid if the loop runs at least once; unless `assume_positive` is set, the trip
    /// count is clamped at zero, which makes the result the value *before* the first iteration
    /// for loops which are not entered. The counter must not overflow: callers check
    /// [CountedLoopInfo::ensure_no_overflow] first.
    pub fn extremum_node(
        &self,
        graph: &mut Graph,
        iv: IvId,
        assume_positive: bool,
        max_trip_count_override: Option<Node>,
    ) -> Node {
        // For a unit stride, the last value of the tested counter is right next to the limit,
        // which avoids computing the trip count at all
        let unit = matches!(self.constant_stride(graph), Some(1 | -1));
        if max_trip_count_override.is_none() && unit && !self.inverted && assume_positive {
            if let Some(relation) = self.ivs.relation_to(graph, iv, self.iv) {
                let bits = self.bits(graph);
                let last = if self.inclusive {
                    self.limit
                } else {
                    let one = graph.constant(bits, 1);
                    let kind = match self.direction {
                        Direction::Up => NodeKind::Sub,
                        Direction::Down => NodeKind::Add,
                    };
                    graph.unique(kind, &[self.limit, one])
                };
                let scaled = match relation.scale {
                    1 => last,
                    -1 => graph.unique(NodeKind::Neg, &[last]),
                    k => {
                        let k = graph.constant(bits, k);
                        graph.unique(NodeKind::Mul, &[last, k])
                    }
                };
                return match build_offset(graph, &relation, bits) {
                    Some(offset) => graph.unique(NodeKind::Add, &[scaled, offset]),
                    None => scaled,
                };
            }
        }
        let trip_count = match max_trip_count_override {
            Some(count) => count,
            None => self.max_trip_count_node(graph, assume_positive),
        };
        self.ivs.extremum_node(graph, iv, trip_count)
    }

    /// The constant stride of the tested counter, looking through an `Opaque` wrapper
    pub fn raw_constant_stride(&self, graph: &Graph) -> Option<i64> {
        match self.ivs[self.ivs.root(self.iv)].kind() {
            crate::IvKind::Basic { stride, .. } => constant_through_opaque(graph, *stride),
            _ => None,
        }
    }
}

/// Returns true if `node` is an `If` with exactly one successor leaving `loop_begin`
fn is_exit_test(graph: &Graph, node: Node, loop_begin: Node) -> bool {
    if !graph.kind(node).is_control_split() {
        return false;
    }
    let leaves = |succ: Option<Node>| {
        succ.is_some_and(|s| {
            matches!(graph.kind(s), NodeKind::LoopExit(_))
                && graph.loop_begin_of(s) == Some(loop_begin)
        })
    };
    leaves(graph.true_successor(node)) != leaves(graph.false_successor(node))
}

/// The exit test of a loop whose test was moved to the bottom: the `If` whose staying successor
/// begins the block ending in the loop's single backedge
fn inverted_exit_test(graph: &Graph, loop_begin: Node) -> Option<Node> {
    let [loop_end] = graph.loop_ends(loop_begin) else {
        return None;
    };
    let block_begin = graph.prev_begin(*loop_end);
    if block_begin == loop_begin {
        return None;
    }
    let split = graph.predecessor(block_begin)?;
    is_exit_test(graph, split, loop_begin).then_some(split)
}
