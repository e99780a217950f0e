//! Induction variables of a single loop.
//!
//! A *basic* induction variable is a loop phi whose backedge values are all the same
//! `phi + stride` (or `phi - stride`) node, with a loop-invariant stride. A *derived* induction
//! variable is an affine function of another induction variable of the same loop: either an
//! offset (`base + x`, `base - x`, `x - base`) or a scale (`base * x`, `base << c`, `-base`),
//! with `x` loop-invariant. Following the `base` links of a derived induction variable always
//! ends at a basic one.
//!
//! The queries here never fail: when a relation cannot be expressed with constants, they return
//! `None` and leave it to the caller to give up on the optimization.
use alloc::vec::Vec;
use core::ops::Index;

use cranelift_entity::{PrimaryMap, entity_impl};
use seajit_ir::{
    FxHashMap, Graph, IntegerStamp, Node, NodeKind, NodeSet, SmallVec,
    stamp::{max_value, min_value, wrap},
};

/// A reference to an [InductionVariable] of an [InductionVariables] set
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IvId(u32);
entity_impl!(IvId, "iv");

/// The direction in which an induction variable moves on every iteration
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    /// The direction of a non-zero step
    #[inline]
    pub const fn of(step: i64) -> Option<Self> {
        if step > 0 {
            Some(Self::Up)
        } else if step < 0 {
            Some(Self::Down)
        } else {
            None
        }
    }
}

/// How a derived offset induction variable is computed from its base
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OffsetOp {
    /// `base + offset`
    Add,
    /// `base - offset`
    Sub,
    /// `offset - base`
    SubFrom,
}

/// How a derived scaled induction variable is computed from its base
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScaleOp {
    /// `base * scale`
    Mul,
    /// `base << scale`, with a constant shift amount
    Shl,
    /// `-base`
    Neg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IvKind {
    /// A loop phi, advanced by `op` (an `Add` or `Sub` of the phi and `stride`) on every backedge
    Basic {
        phi: Node,
        init: Node,
        stride: Node,
        op: Node,
    },
    DerivedOffset {
        base: IvId,
        offset: Node,
        op: OffsetOp,
    },
    DerivedScaled {
        base: IvId,
        /// `None` for [ScaleOp::Neg]
        scale: Option<Node>,
        op: ScaleOp,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InductionVariable {
    value: Node,
    kind: IvKind,
}

impl InductionVariable {
    /// The node whose value is this induction variable
    #[inline]
    pub fn value(&self) -> Node {
        self.value
    }

    #[inline]
    pub fn kind(&self) -> &IvKind {
        &self.kind
    }

    #[inline]
    pub fn is_basic(&self) -> bool {
        matches!(self.kind, IvKind::Basic { .. })
    }

    /// The induction variable this one is derived from
    pub fn base(&self) -> Option<IvId> {
        match self.kind {
            IvKind::Basic { .. } => None,
            IvKind::DerivedOffset { base, .. } | IvKind::DerivedScaled { base, .. } => Some(base),
        }
    }
}

/// The affine relation `this = scale * other + offset` between two induction variables of the
/// same loop, where the offset is a sum of loop-invariant terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffineRelation {
    pub scale: i64,
    /// The constant part of the offset
    pub constant: i64,
    /// The symbolic part of the offset, as `(coefficient, node)` terms
    pub terms: SmallVec<[(i64, Node); 2]>,
}

impl AffineRelation {
    #[inline]
    pub fn offset_is_zero(&self) -> bool {
        self.constant == 0 && self.terms.is_empty()
    }
}

/// The induction variables of one loop
#[derive(Debug, Clone)]
pub struct InductionVariables {
    loop_begin: Node,
    ivs: PrimaryMap<IvId, InductionVariable>,
    by_value: FxHashMap<Node, IvId>,
}

impl Index<IvId> for InductionVariables {
    type Output = InductionVariable;

    #[inline]
    fn index(&self, id: IvId) -> &Self::Output {
        &self.ivs[id]
    }
}

impl InductionVariables {
    /// Find the induction variables of the loop headed by `loop_begin`, whose body is `inside`
    pub fn detect(graph: &Graph, loop_begin: Node, inside: &NodeSet) -> Self {
        let mut ivs = Self {
            loop_begin,
            ivs: PrimaryMap::new(),
            by_value: FxHashMap::default(),
        };
        if graph.loop_ends(loop_begin).is_empty() {
            return ivs;
        }

        for phi in graph.phis(loop_begin) {
            if !graph.stamp(phi).is_int() {
                continue;
            }
            let values = graph.phi_values(phi);
            let backedge = values[1];
            if values[2..].iter().any(|v| *v != backedge) {
                continue;
            }
            let stride = match graph.kind(backedge) {
                NodeKind::Add => {
                    let (x, y) = (graph.input(backedge, 0), graph.input(backedge, 1));
                    if x == phi && !inside.contains(y) {
                        Some(y)
                    } else if y == phi && !inside.contains(x) {
                        Some(x)
                    } else {
                        None
                    }
                }
                NodeKind::Sub => {
                    let (x, y) = (graph.input(backedge, 0), graph.input(backedge, 1));
                    (x == phi && !inside.contains(y)).then_some(y)
                }
                _ => None,
            };
            if let Some(stride) = stride {
                ivs.push(phi, IvKind::Basic {
                    phi,
                    init: values[0],
                    stride,
                    op: backedge,
                });
            }
        }

        let mut worklist: Vec<IvId> = ivs.ivs.keys().collect();
        while let Some(id) = worklist.pop() {
            let value = ivs.ivs[id].value;
            let mut users: SmallVec<[Node; 8]> = SmallVec::from_slice(graph.usages(value));
            users.sort_unstable();
            users.dedup();
            for user in users {
                if ivs.by_value.contains_key(&user) || !inside.contains(user) {
                    continue;
                }
                let inputs = graph.inputs(user);
                let invariant = |node: Node| !inside.contains(node);
                let kind = match graph.kind(user) {
                    NodeKind::Add if inputs[0] == value && invariant(inputs[1]) => {
                        IvKind::DerivedOffset {
                            base: id,
                            offset: inputs[1],
                            op: OffsetOp::Add,
                        }
                    }
                    NodeKind::Add if inputs[1] == value && invariant(inputs[0]) => {
                        IvKind::DerivedOffset {
                            base: id,
                            offset: inputs[0],
                            op: OffsetOp::Add,
                        }
                    }
                    NodeKind::Sub if inputs[0] == value && invariant(inputs[1]) => {
                        IvKind::DerivedOffset {
                            base: id,
                            offset: inputs[1],
                            op: OffsetOp::Sub,
                        }
                    }
                    NodeKind::Sub if inputs[1] == value && invariant(inputs[0]) => {
                        IvKind::DerivedOffset {
                            base: id,
                            offset: inputs[0],
                            op: OffsetOp::SubFrom,
                        }
                    }
                    NodeKind::Mul if inputs[0] == value && invariant(inputs[1]) => {
                        IvKind::DerivedScaled {
                            base: id,
                            scale: Some(inputs[1]),
                            op: ScaleOp::Mul,
                        }
                    }
                    NodeKind::Mul if inputs[1] == value && invariant(inputs[0]) => {
                        IvKind::DerivedScaled {
                            base: id,
                            scale: Some(inputs[0]),
                            op: ScaleOp::Mul,
                        }
                    }
                    NodeKind::Shl
                        if inputs[0] == value && graph.as_constant(inputs[1]).is_some() =>
                    {
                        IvKind::DerivedScaled {
                            base: id,
                            scale: Some(inputs[1]),
                            op: ScaleOp::Shl,
                        }
                    }
                    NodeKind::Neg => IvKind::DerivedScaled {
                        base: id,
                        scale: None,
                        op: ScaleOp::Neg,
                    },
                    _ => continue,
                };
                worklist.push(ivs.push(user, kind));
            }
        }
        log::trace!(
            target: "induction-variables",
            "{loop_begin} has {} induction variables",
            ivs.len()
        );
        ivs
    }

    fn push(&mut self, value: Node, kind: IvKind) -> IvId {
        let id = self.ivs.push(InductionVariable { value, kind });
        self.by_value.insert(value, id);
        id
    }

    /// The loop these induction variables belong to
    #[inline]
    pub fn loop_begin(&self) -> Node {
        self.loop_begin
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ivs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ivs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IvId, &InductionVariable)> + '_ {
        self.ivs.iter()
    }

    /// The induction variable computed by `node`, if any
    #[inline]
    pub fn lookup(&self, node: Node) -> Option<IvId> {
        self.by_value.get(&node).copied()
    }

    /// The basic induction variable at the root of the chain of `id`
    pub fn root(&self, id: IvId) -> IvId {
        let mut current = id;
        while let Some(base) = self.ivs[current].base() {
            current = base;
        }
        current
    }

    fn root_init(&self, id: IvId) -> Node {
        match self.ivs[self.root(id)].kind {
            IvKind::Basic { init, .. } => init,
            _ => unreachable!("derivation chains end at a basic induction variable"),
        }
    }

    fn bits(&self, graph: &Graph, id: IvId) -> u8 {
        graph.bits(self.ivs[id].value)
    }

    // Direction
    // ---------------------------------------------------------------------------------------

    /// The direction of `id`, or `None` if the sign of its stride is unknown
    pub fn direction(&self, graph: &Graph, id: IvId) -> Option<Direction> {
        match self.ivs[id].kind {
            IvKind::Basic { stride, op, .. } => {
                let direction = match constant_through_opaque(graph, stride) {
                    Some(stride) => Direction::of(stride)?,
                    None => {
                        let stamp = int_stamp_through_opaque(graph, stride)?;
                        if stamp.is_strictly_positive() {
                            Direction::Up
                        } else if stamp.is_strictly_negative() {
                            Direction::Down
                        } else {
                            return None;
                        }
                    }
                };
                match graph.kind(op) {
                    NodeKind::Sub => Some(direction.opposite()),
                    _ => Some(direction),
                }
            }
            IvKind::DerivedOffset { base, op, .. } => {
                let direction = self.direction(graph, base)?;
                match op {
                    OffsetOp::SubFrom => Some(direction.opposite()),
                    OffsetOp::Add | OffsetOp::Sub => Some(direction),
                }
            }
            IvKind::DerivedScaled { base, scale, op } => {
                let direction = self.direction(graph, base)?;
                match op {
                    ScaleOp::Neg => Some(direction.opposite()),
                    ScaleOp::Shl => Some(direction),
                    ScaleOp::Mul => {
                        let scale = graph.int_stamp(scale?)?;
                        if scale.is_strictly_positive() {
                            Some(direction)
                        } else if scale.is_strictly_negative() {
                            Some(direction.opposite())
                        } else {
                            None
                        }
                    }
                }
            }
        }
    }

    // Nodes
    // ---------------------------------------------------------------------------------------

    /// Apply the derivation of `id` to `base`, the value of its base induction variable
    fn derive(&self, graph: &mut Graph, id: IvId, base: Node) -> Node {
        match self.ivs[id].kind {
            IvKind::Basic { .. } => base,
            IvKind::DerivedOffset { offset, op, .. } => match op {
                OffsetOp::Add => graph.unique(NodeKind::Add, &[base, offset]),
                OffsetOp::Sub => graph.unique(NodeKind::Sub, &[base, offset]),
                OffsetOp::SubFrom => graph.unique(NodeKind::Sub, &[offset, base]),
            },
            IvKind::DerivedScaled { scale, op, .. } => match (op, scale) {
                (ScaleOp::Mul, Some(scale)) => graph.unique(NodeKind::Mul, &[base, scale]),
                (ScaleOp::Shl, Some(scale)) => graph.unique(NodeKind::Shl, &[base, scale]),
                _ => graph.unique(NodeKind::Neg, &[base]),
            },
        }
    }

    /// Compute the value of `id` from a value of its basic induction variable, creating the
    /// nodes of every derivation on the way
    fn derive_from_root(&self, graph: &mut Graph, id: IvId, root_value: Node) -> Node {
        let mut chain: SmallVec<[IvId; 4]> = SmallVec::new();
        let mut current = id;
        while let Some(base) = self.ivs[current].base() {
            chain.push(current);
            current = base;
        }
        chain.iter().rev().fold(root_value, |value, id| self.derive(graph, *id, value))
    }

    /// The value of `id` on the first iteration
    pub fn init_node(&self, graph: &mut Graph, id: IvId) -> Node {
        let init = self.root_init(id);
        self.derive_from_root(graph, id, init)
    }

    /// The amount `id` changes by on every iteration
    pub fn stride_node(&self, graph: &mut Graph, id: IvId) -> Node {
        match self.ivs[id].kind {
            IvKind::Basic { stride, op, .. } => match graph.kind(op) {
                NodeKind::Sub => graph.unique(NodeKind::Neg, &[stride]),
                _ => stride,
            },
            IvKind::DerivedOffset { base, op, .. } => {
                let stride = self.stride_node(graph, base);
                match op {
                    OffsetOp::SubFrom => graph.unique(NodeKind::Neg, &[stride]),
                    OffsetOp::Add | OffsetOp::Sub => stride,
                }
            }
            IvKind::DerivedScaled { base, .. } => {
                let stride = self.stride_node(graph, base);
                self.derive(graph, id, stride)
            }
        }
    }

    /// The value of `id` on the iteration with index `trip_count - 1`, i.e. the last iteration
    /// of a loop which runs `trip_count` times.
    ///
    /// The result is only meaningful if the loop runs at least once, and its counter cannot
    /// overflow; see [crate::CountedLoopInfo::counter_never_overflows].
    pub fn extremum_node(&self, graph: &mut Graph, id: IvId, trip_count: Node) -> Node {
        let bits = self.bits(graph, id);
        let one = graph.constant(bits, 1);
        let last = graph.unique(NodeKind::Sub, &[trip_count, one]);
        self.value_at_node(graph, id, last)
    }

    /// The value `id` would have after `trip_count` iterations, i.e. when the loop exits
    pub fn exit_value_node(&self, graph: &mut Graph, id: IvId, trip_count: Node) -> Node {
        self.value_at_node(graph, id, trip_count)
    }

    fn value_at_node(&self, graph: &mut Graph, id: IvId, iteration: Node) -> Node {
        let root = self.root(id);
        let init = self.root_init(id);
        let stride = self.stride_node(graph, root);
        let distance = graph.unique(NodeKind::Mul, &[stride, iteration]);
        let value = graph.unique(NodeKind::Add, &[init, distance]);
        self.derive_from_root(graph, id, value)
    }

    // Constants
    // ---------------------------------------------------------------------------------------

    /// The value of `id` on the given iteration, computed without wrapping, if everything
    /// involved is constant
    fn value_at(&self, graph: &Graph, id: IvId, iteration: i128) -> Option<i128> {
        match self.ivs[id].kind {
            IvKind::Basic { init, .. } => {
                let init = graph.as_constant(init)? as i128;
                let stride = self.constant_stride(graph, id)? as i128;
                init.checked_add(stride.checked_mul(iteration)?)
            }
            IvKind::DerivedOffset { base, offset, op } => {
                let base = self.value_at(graph, base, iteration)?;
                let offset = graph.as_constant(offset)? as i128;
                match op {
                    OffsetOp::Add => base.checked_add(offset),
                    OffsetOp::Sub => base.checked_sub(offset),
                    OffsetOp::SubFrom => offset.checked_sub(base),
                }
            }
            IvKind::DerivedScaled { base, scale, op } => {
                let base = self.value_at(graph, base, iteration)?;
                match op {
                    ScaleOp::Neg => base.checked_neg(),
                    ScaleOp::Mul => base.checked_mul(graph.as_constant(scale?)? as i128),
                    ScaleOp::Shl => {
                        let shift = graph.as_constant(scale?)?;
                        let shift = shift & (self.bits(graph, id) as i64 - 1);
                        base.checked_mul(1i128 << shift)
                    }
                }
            }
        }
    }

    pub fn constant_init(&self, graph: &Graph, id: IvId) -> Option<i64> {
        self.value_at(graph, id, 0).map(|v| wrap(self.bits(graph, id), v))
    }

    #[inline]
    pub fn is_constant_init(&self, graph: &Graph, id: IvId) -> bool {
        self.constant_init(graph, id).is_some()
    }

    /// The constant stride of `id`.
    ///
    /// An `Opaque` stride is looked through: it hides the stride from folding, not from
    /// trip count computations.
    pub fn constant_stride(&self, graph: &Graph, id: IvId) -> Option<i64> {
        let bits = self.bits(graph, id);
        let stride = match self.ivs[id].kind {
            IvKind::Basic { stride, op, .. } => {
                let stride = constant_through_opaque(graph, stride)? as i128;
                match graph.kind(op) {
                    NodeKind::Sub => -stride,
                    _ => stride,
                }
            }
            IvKind::DerivedOffset { base, op, .. } => {
                let stride = self.constant_stride(graph, base)? as i128;
                match op {
                    OffsetOp::SubFrom => -stride,
                    OffsetOp::Add | OffsetOp::Sub => stride,
                }
            }
            IvKind::DerivedScaled { base, scale, op } => {
                let stride = self.constant_stride(graph, base)? as i128;
                match op {
                    ScaleOp::Neg => -stride,
                    ScaleOp::Mul => stride * graph.as_constant(scale?)? as i128,
                    ScaleOp::Shl => {
                        let shift = graph.as_constant(scale?)? & (bits as i64 - 1);
                        stride << shift
                    }
                }
            }
        };
        Some(wrap(bits, stride))
    }

    #[inline]
    pub fn is_constant_stride(&self, graph: &Graph, id: IvId) -> bool {
        self.constant_stride(graph, id).is_some()
    }

    /// The value of `id` on the last iteration of a loop running `trip_count >= 1` times
    pub fn constant_extremum(&self, graph: &Graph, id: IvId, trip_count: u64) -> Option<i64> {
        let last = (trip_count as i128).checked_sub(1)?.max(0);
        self.value_at(graph, id, last).map(|v| wrap(self.bits(graph, id), v))
    }

    /// Returns true if `id` stays within the signed range of `bits` on every one of the
    /// `trip_count` iterations
    pub fn value_range_fits(&self, graph: &Graph, id: IvId, trip_count: u64, bits: u8) -> bool {
        let last = (trip_count as i128).saturating_sub(1).max(0);
        let range = min_value(bits) as i128..=max_value(bits) as i128;
        match (self.value_at(graph, id, 0), self.value_at(graph, id, last)) {
            (Some(first), Some(last)) => range.contains(&first) && range.contains(&last),
            _ => false,
        }
    }

    /// A conservative range of the values of `id` on the first iteration
    pub fn init_stamp(&self, graph: &Graph, id: IvId) -> IntegerStamp {
        let bits = self.bits(graph, id);
        let full = IntegerStamp::full(bits);
        let stamp_of = |node: Node| graph.int_stamp(node).unwrap_or(full);
        match self.ivs[id].kind {
            IvKind::Basic { init, .. } => stamp_of(init),
            IvKind::DerivedOffset { base, offset, op } => {
                let base = self.init_stamp(graph, base);
                match op {
                    OffsetOp::Add => base.add(&stamp_of(offset)),
                    OffsetOp::Sub => base.sub(&stamp_of(offset)),
                    OffsetOp::SubFrom => stamp_of(offset).sub(&base),
                }
            }
            IvKind::DerivedScaled { base, scale, op } => {
                let base = self.init_stamp(graph, base);
                match (op, scale) {
                    (ScaleOp::Mul, Some(scale)) => base.mul(&stamp_of(scale)),
                    (ScaleOp::Neg, _) => base.neg(),
                    _ => full,
                }
            }
        }
    }

    // Relations
    // ---------------------------------------------------------------------------------------

    /// The relation `id = k * other + c`, if `other` is on the derivation chain of `id` and
    /// every scale along the way is constant
    pub fn relation_to(&self, graph: &Graph, id: IvId, other: IvId) -> Option<AffineRelation> {
        let mut relation = AffineRelation {
            scale: 1,
            constant: 0,
            terms: SmallVec::new(),
        };
        let mut current = id;
        while current != other {
            let k = relation.scale;
            match self.ivs[current].kind {
                IvKind::Basic { .. } => return None,
                IvKind::DerivedOffset { base, offset, op } => {
                    let coefficient = match op {
                        OffsetOp::Add | OffsetOp::SubFrom => k,
                        OffsetOp::Sub => k.checked_neg()?,
                    };
                    match graph.as_constant(offset) {
                        Some(c) => {
                            relation.constant =
                                relation.constant.checked_add(coefficient.checked_mul(c)?)?
                        }
                        None => relation.terms.push((coefficient, offset)),
                    }
                    if op == OffsetOp::SubFrom {
                        relation.scale = k.checked_neg()?;
                    }
                    current = base;
                }
                IvKind::DerivedScaled { base, scale, op } => {
                    relation.scale = match op {
                        ScaleOp::Neg => k.checked_neg()?,
                        ScaleOp::Mul => k.checked_mul(graph.as_constant(scale?)?)?,
                        ScaleOp::Shl => {
                            let shift = graph.as_constant(scale?)?;
                            k.checked_mul(1i64.checked_shl(u32::try_from(shift).ok()?)?)?
                        }
                    };
                    current = base;
                }
            }
        }
        Some(relation)
    }

    #[inline]
    pub fn is_constant_scale(&self, graph: &Graph, id: IvId, other: IvId) -> bool {
        self.constant_scale(graph, id, other).is_some()
    }

    /// The constant `k` such that `id = k * other + c`, or `None` if the relation is symbolic
    #[inline]
    pub fn constant_scale(&self, graph: &Graph, id: IvId, other: IvId) -> Option<i64> {
        self.relation_to(graph, id, other).map(|r| r.scale)
    }

    /// Returns true if `id = k * other` with no offset
    pub fn offset_is_zero(&self, graph: &Graph, id: IvId, other: IvId) -> bool {
        self.relation_to(graph, id, other).is_some_and(|r| r.offset_is_zero())
    }

    /// The node computing the offset `c` of `id = k * other + c`.
    ///
    /// Returns `None` when there is no such relation, and when the offset is zero, in which case
    /// no node is created.
    pub fn offset_node(&self, graph: &mut Graph, id: IvId, other: IvId) -> Option<Node> {
        let relation = self.relation_to(graph, id, other)?;
        build_offset(graph, &relation, self.bits(graph, id))
    }
}

/// Materialize the offset of `relation` as a `bits`-wide value, or `None` if it is zero
pub fn build_offset(graph: &mut Graph, relation: &AffineRelation, bits: u8) -> Option<Node> {
    if relation.offset_is_zero() {
        return None;
    }
    let mut sum = None;
    for &(coefficient, term) in relation.terms.iter() {
        let scaled = match coefficient {
            1 => term,
            -1 => graph.unique(NodeKind::Neg, &[term]),
            k => {
                let k = graph.constant(bits, k);
                graph.unique(NodeKind::Mul, &[term, k])
            }
        };
        sum = Some(match sum {
            None => scaled,
            Some(sum) => graph.unique(NodeKind::Add, &[sum, scaled]),
        });
    }
    if relation.constant != 0 || sum.is_none() {
        let constant = graph.constant(bits, relation.constant);
        sum = Some(match sum {
            None => constant,
            Some(sum) => graph.unique(NodeKind::Add, &[sum, constant]),
        });
    }
    sum
}

/// The constant value of `node`, looking through an `Opaque` wrapper
pub fn constant_through_opaque(graph: &Graph, node: Node) -> Option<i64> {
    match graph.kind(node) {
        NodeKind::Opaque => graph.as_constant(graph.input(node, 0)),
        _ => graph.as_constant(node),
    }
}

fn int_stamp_through_opaque(graph: &Graph, node: Node) -> Option<IntegerStamp> {
    match graph.kind(node) {
        NodeKind::Opaque => graph.int_stamp(graph.input(node, 0)),
        _ => graph.int_stamp(node),
    }
}
