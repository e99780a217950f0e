use core::fmt;

use cranelift_entity::entity_impl;

use crate::{Speculation, Stamp};

/// A reference to a node in a [crate::Graph]
///
/// Nodes are allocated in an arena owned by the graph, and are never moved or reused, so a
/// [Node] is stable for the lifetime of the graph, even across deletions. Use
/// [crate::Graph::is_alive] to check whether a node has been deleted.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "n");

/// The reason recorded when compiled code deoptimizes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeoptimizationReason {
    None,
    NullCheckException,
    BoundsCheckException,
    ClassCastException,
    ArithmeticException,
    UnreachedCode,
    TypeCheckedInliningViolated,
    OptimizedTypeCheckViolated,
    LoopLimitCheck,
    TransferToInterpreter,
    RuntimeConstraint,
}

impl fmt::Display for DeoptimizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What the runtime should do with compiled code after it deoptimizes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeoptimizationAction {
    /// Resume in the interpreter, keep the compiled code
    None,
    /// Keep the compiled code, but recompile once deopts become frequent
    RecompileIfTooManyDeopts,
    /// Invalidate the compiled code and collect more profile before recompiling
    InvalidateReprofile,
    /// Invalidate the compiled code and recompile immediately
    InvalidateRecompile,
    /// Invalidate the compiled code and never compile this method again
    InvalidateStopCompiling,
}

impl fmt::Display for DeoptimizationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The attributes of a [NodeKind::Guard] or [NodeKind::FixedGuard]
///
/// A guard deoptimizes when its condition evaluates to `negated`, i.e. a non-negated guard
/// requires its condition to hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GuardInfo {
    pub reason: DeoptimizationReason,
    pub action: DeoptimizationAction,
    pub negated: bool,
    pub speculation: Speculation,
}

impl GuardInfo {
    pub const fn new(reason: DeoptimizationReason, action: DeoptimizationAction) -> Self {
        Self {
            reason,
            action,
            negated: false,
            speculation: Speculation::NONE,
        }
    }

    pub const fn negated(mut self, negated: bool) -> Self {
        self.negated = negated;
        self
    }

    pub const fn with_speculation(mut self, speculation: Speculation) -> Self {
        self.speculation = speculation;
        self
    }

    /// Returns true if a guard with these attributes fails when its condition is `value`
    #[inline(always)]
    pub const fn fails_on(&self, value: bool) -> bool {
        value == self.negated
    }
}

/// The attributes of a [NodeKind::Deoptimize]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeoptInfo {
    pub reason: DeoptimizationReason,
    pub action: DeoptimizationAction,
    pub speculation: Speculation,
}

impl DeoptInfo {
    pub const fn new(reason: DeoptimizationReason, action: DeoptimizationAction) -> Self {
        Self {
            reason,
            action,
            speculation: Speculation::NONE,
        }
    }
}

/// Whether a loop end or loop exit emits a safepoint poll
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SafepointState {
    /// A poll must be emitted. This is the initial state of every loop end and exit.
    #[default]
    MustSafepoint,
    /// The optimizer proved, or chose to assume, that a poll is unnecessary
    OptimizerDisabled,
    /// A poll must never be emitted here, regardless of what the optimizer decides
    MustNeverSafepoint,
}

impl SafepointState {
    #[inline(always)]
    pub const fn can_safepoint(&self) -> bool {
        matches!(self, Self::MustSafepoint)
    }
}

/// The role a loop plays after pre/main/post splitting
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoopKind {
    #[default]
    Regular,
    Pre,
    Main,
    Post,
}

/// The attributes of a [NodeKind::LoopBegin]
#[derive(Debug, Clone, PartialEq)]
pub struct LoopBeginInfo {
    /// The expected number of iterations per entry of the loop
    pub loop_frequency: f64,
    pub kind: LoopKind,
    /// The number of copies of the original body in one iteration of this loop
    pub unroll_factor: u32,
    /// The number of times this loop has been peeled
    pub peeled: u32,
    /// The number of times this loop has been unswitched
    pub unswitches: u32,
    /// The guard protecting this loop's counter from overflow, once one has been created
    pub overflow_guard: Option<Node>,
    /// The `Opaque` node wrapping the stride of an unrolled main loop
    pub opaque_stride: Option<Node>,
}

impl Default for LoopBeginInfo {
    fn default() -> Self {
        Self {
            loop_frequency: 1.0,
            kind: LoopKind::Regular,
            unroll_factor: 1,
            peeled: 0,
            unswitches: 0,
            overflow_guard: None,
            opaque_stride: None,
        }
    }
}

/// The kind of a node, along with any attributes which are not represented as inputs.
///
/// The meaning of each input and successor slot is fixed per kind:
///
/// | Kind            | Inputs                         | Successors            |
/// |-----------------|--------------------------------|-----------------------|
/// | `Start`/`Begin` | -                              | `[next]`              |
/// | `Merge`         | `[end0, end1, ..]`             | `[next]`              |
/// | `LoopBegin`     | `[forward_end, loop_end0, ..]` | `[next]`              |
/// | `LoopExit`      | `[loop_begin]`                 | `[next]`              |
/// | `End`/`LoopEnd` | -                              | -                     |
/// | `If`            | `[condition]`                  | `[true, false]`       |
/// | `FixedGuard`    | `[condition]`                  | `[next]`              |
/// | `Invoke` etc.   | `[args..]`                     | `[next]`              |
/// | `LoadIndexed`   | `[array, index, guard?]`       | `[next]`              |
/// | `StoreIndexed`  | `[array, index, value, guard?]`| `[next]`              |
/// | `Return`        | `[value?]`                     | -                     |
/// | `Phi`           | `[merge, value0, value1, ..]`  |                       |
/// | `ValueProxy`    | `[value, loop_exit]`           |                       |
/// | `Pi`            | `[value, guard]`               |                       |
/// | `InstanceOf`    | `[object, anchor?]`            |                       |
/// | `Guard`         | `[condition, anchor]`          |                       |
/// | `MultiGuard`    | `[guard0, guard1, ..]`         |                       |
///
/// Phi values are ordered like the ends of their merge.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    // Control
    Start,
    Begin,
    Merge,
    LoopBegin(LoopBeginInfo),
    LoopEnd(SafepointState),
    LoopExit(SafepointState),
    End,
    If { true_probability: f64 },
    FixedGuard(GuardInfo),
    Deoptimize(DeoptInfo),
    Return,
    Invoke { target: u32 },
    ForeignCall { target: u32, safepoint: bool },
    MonitorEnter { osr: bool },
    LoadIndexed,
    StoreIndexed,
    // Values
    Parameter(u32),
    Constant { value: i64, bits: u8 },
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Neg,
    Min,
    Max,
    Opaque,
    Phi,
    ValueProxy,
    Pi,
    ArrayLength,
    // Logic
    IntegerLessThan,
    IntegerBelow,
    IntegerEquals,
    InstanceOf { type_id: u32, profile: Option<f64> },
    LogicNegation,
    ShortCircuitOr { x_negated: bool, y_negated: bool },
    LogicConstant(bool),
    // Guards
    Guard(GuardInfo),
    MultiGuard,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::Begin => "Begin",
            Self::Merge => "Merge",
            Self::LoopBegin(_) => "LoopBegin",
            Self::LoopEnd(_) => "LoopEnd",
            Self::LoopExit(_) => "LoopExit",
            Self::End => "End",
            Self::If { .. } => "If",
            Self::FixedGuard(_) => "FixedGuard",
            Self::Deoptimize(_) => "Deoptimize",
            Self::Return => "Return",
            Self::Invoke { .. } => "Invoke",
            Self::ForeignCall { .. } => "ForeignCall",
            Self::MonitorEnter { .. } => "MonitorEnter",
            Self::LoadIndexed => "LoadIndexed",
            Self::StoreIndexed => "StoreIndexed",
            Self::Parameter(_) => "Parameter",
            Self::Constant { .. } => "Constant",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Shl => "Shl",
            Self::Neg => "Neg",
            Self::Min => "Min",
            Self::Max => "Max",
            Self::Opaque => "Opaque",
            Self::Phi => "Phi",
            Self::ValueProxy => "ValueProxy",
            Self::Pi => "Pi",
            Self::ArrayLength => "ArrayLength",
            Self::IntegerLessThan => "IntegerLessThan",
            Self::IntegerBelow => "IntegerBelow",
            Self::IntegerEquals => "IntegerEquals",
            Self::InstanceOf { .. } => "InstanceOf",
            Self::LogicNegation => "LogicNegation",
            Self::ShortCircuitOr { .. } => "ShortCircuitOr",
            Self::LogicConstant(_) => "LogicConstant",
            Self::Guard(_) => "Guard",
            Self::MultiGuard => "MultiGuard",
        }
    }

    /// Nodes which start a basic block
    #[inline]
    pub fn is_begin(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::Begin | Self::Merge | Self::LoopBegin(_) | Self::LoopExit(_)
        )
    }

    #[inline]
    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merge | Self::LoopBegin(_))
    }

    #[inline]
    pub fn is_loop_begin(&self) -> bool {
        matches!(self, Self::LoopBegin(_))
    }

    /// Nodes which transfer control to a merge
    #[inline]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End | Self::LoopEnd(_))
    }

    /// Nodes which are pinned in the control-flow chain
    pub fn is_fixed(&self) -> bool {
        self.is_begin() || self.is_end() || self.is_fixed_with_next() || self.is_control_split()
            || self.is_control_sink()
    }

    /// Fixed nodes with exactly one control successor
    pub fn is_fixed_with_next(&self) -> bool {
        self.is_begin()
            || matches!(
                self,
                Self::FixedGuard(_)
                    | Self::Invoke { .. }
                    | Self::ForeignCall { .. }
                    | Self::MonitorEnter { .. }
                    | Self::LoadIndexed
                    | Self::StoreIndexed
            )
    }

    #[inline]
    pub fn is_control_split(&self) -> bool {
        matches!(self, Self::If { .. })
    }

    /// Fixed nodes with no successors which do not flow into a merge
    #[inline]
    pub fn is_control_sink(&self) -> bool {
        matches!(self, Self::Return | Self::Deoptimize(_))
    }

    #[inline]
    pub fn is_floating(&self) -> bool {
        !self.is_fixed()
    }

    pub fn is_logic(&self) -> bool {
        matches!(
            self,
            Self::IntegerLessThan
                | Self::IntegerBelow
                | Self::IntegerEquals
                | Self::InstanceOf { .. }
                | Self::LogicNegation
                | Self::ShortCircuitOr { .. }
                | Self::LogicConstant(_)
        )
    }

    /// Integer comparisons
    #[inline]
    pub fn is_compare(&self) -> bool {
        matches!(self, Self::IntegerLessThan | Self::IntegerBelow | Self::IntegerEquals)
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Shl
                | Self::Neg
                | Self::Min
                | Self::Max
        )
    }

    /// Nodes which may be used as the guard input of a guarded operation
    pub fn is_guarding(&self) -> bool {
        self.is_begin() || matches!(self, Self::Guard(_) | Self::FixedGuard(_) | Self::MultiGuard)
    }

    #[inline]
    pub fn guard_info(&self) -> Option<&GuardInfo> {
        match self {
            Self::Guard(info) | Self::FixedGuard(info) => Some(info),
            _ => None,
        }
    }

    #[inline]
    pub fn guard_info_mut(&mut self) -> Option<&mut GuardInfo> {
        match self {
            Self::Guard(info) | Self::FixedGuard(info) => Some(info),
            _ => None,
        }
    }

    #[inline]
    pub fn loop_begin_info(&self) -> Option<&LoopBeginInfo> {
        match self {
            Self::LoopBegin(info) => Some(info),
            _ => None,
        }
    }

    #[inline]
    pub fn loop_begin_info_mut(&mut self) -> Option<&mut LoopBeginInfo> {
        match self {
            Self::LoopBegin(info) => Some(info),
            _ => None,
        }
    }

    /// The safepoint state of a loop end or loop exit
    #[inline]
    pub fn safepoint_state(&self) -> Option<SafepointState> {
        match self {
            Self::LoopEnd(state) | Self::LoopExit(state) => Some(*state),
            _ => None,
        }
    }

    /// Fixed nodes with an effect that must not be skipped or reordered across a deoptimization
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Self::Invoke { .. }
                | Self::ForeignCall { .. }
                | Self::StoreIndexed
                | Self::MonitorEnter { .. }
        )
    }

    /// Nodes which always poll for a safepoint when executed
    pub fn is_guaranteed_safepoint(&self) -> bool {
        matches!(self, Self::Invoke { .. } | Self::ForeignCall { safepoint: true, .. })
    }

    /// Floating nodes which are equal whenever their kind and inputs are equal
    pub fn is_value_numberable(&self) -> bool {
        matches!(
            self,
            Self::Constant { .. }
                | Self::LogicConstant(_)
                | Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Shl
                | Self::Neg
                | Self::Min
                | Self::Max
                | Self::ArrayLength
                | Self::IntegerLessThan
                | Self::IntegerBelow
                | Self::IntegerEquals
                | Self::LogicNegation
                | Self::ShortCircuitOr { .. }
                | Self::Guard(_)
                | Self::MultiGuard
        )
    }

    /// Returns true for binary operations whose operands may be swapped
    #[inline]
    pub fn is_commutative(&self) -> bool {
        matches!(self, Self::Add | Self::Mul | Self::Min | Self::Max | Self::IntegerEquals)
    }

    /// Evaluate an integer operation of this kind on constant operands, wrapping at `bits`.
    ///
    /// Returns `None` if this is not an integer operation, or the operation is undefined for the
    /// given operands (e.g. division by zero).
    pub fn fold_integer(&self, bits: u8, operands: &[i64]) -> Option<i64> {
        let wide = |i: usize| operands.get(i).map(|v| *v as i128);
        let value = match self {
            Self::Add => wide(0)? + wide(1)?,
            Self::Sub => wide(0)? - wide(1)?,
            Self::Mul => wide(0)? * wide(1)?,
            Self::Div => {
                let y = wide(1)?;
                if y == 0 {
                    return None;
                }
                wide(0)? / y
            }
            Self::Shl => {
                let shift = (operands.get(1)? & (bits as i64 - 1)) as u32;
                wide(0)? << shift
            }
            Self::Neg => -wide(0)?,
            Self::Min => wide(0)?.min(wide(1)?),
            Self::Max => wide(0)?.max(wide(1)?),
            _ => return None,
        };
        Some(crate::stamp::wrap(bits, value))
    }

    /// Evaluate an integer comparison of this kind on constant operands of width `bits`.
    pub fn fold_compare(&self, bits: u8, x: i64, y: i64) -> Option<bool> {
        match self {
            Self::IntegerLessThan => Some(x < y),
            Self::IntegerBelow => {
                let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
                Some((x as u64 & mask) < (y as u64 & mask))
            }
            Self::IntegerEquals => Some(x == y),
            _ => None,
        }
    }

    /// Rewrite any node references held in attributes, e.g. after duplicating a loop
    pub fn remap_references(&mut self, mut f: impl FnMut(Node) -> Node) {
        if let Self::LoopBegin(info) = self {
            info.opaque_stride = info.opaque_stride.map(&mut f);
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { value, bits } => write!(f, "Constant({value}:i{bits})"),
            Self::LogicConstant(value) => write!(f, "LogicConstant({value})"),
            Self::Parameter(index) => write!(f, "Parameter({index})"),
            Self::If { true_probability } => write!(f, "If(p={true_probability})"),
            Self::LoopBegin(info) => {
                write!(f, "LoopBegin(freq={}, kind={:?}", info.loop_frequency, info.kind)?;
                if info.unroll_factor > 1 {
                    write!(f, ", unroll={}", info.unroll_factor)?;
                }
                f.write_str(")")
            }
            Self::LoopEnd(state) => write!(f, "LoopEnd({state:?})"),
            Self::LoopExit(state) => write!(f, "LoopExit({state:?})"),
            Self::Guard(info) | Self::FixedGuard(info) => {
                write!(f, "{}({}, {}", self.name(), info.reason, info.action)?;
                if info.negated {
                    f.write_str(", negated")?;
                }
                if let Some(id) = info.speculation.id() {
                    write!(f, ", speculation={id}")?;
                }
                f.write_str(")")
            }
            Self::Deoptimize(info) => write!(f, "Deoptimize({}, {})", info.reason, info.action),
            Self::Invoke { target } => write!(f, "Invoke(#{target})"),
            Self::ForeignCall { target, safepoint } => {
                write!(f, "ForeignCall(#{target}, safepoint={safepoint})")
            }
            Self::MonitorEnter { osr } => write!(f, "MonitorEnter(osr={osr})"),
            Self::InstanceOf { type_id, .. } => write!(f, "InstanceOf(type={type_id})"),
            Self::ShortCircuitOr {
                x_negated,
                y_negated,
            } => {
                let not = |negated: bool| if negated { "!" } else { "" };
                write!(f, "ShortCircuitOr({}x, {}y)", not(*x_negated), not(*y_negated))
            }
            other => f.write_str(other.name()),
        }
    }
}

/// The default stamp for a value produced by a node of the given kind, before input stamps are
/// taken into account.
pub(crate) fn default_stamp(kind: &NodeKind) -> Stamp {
    match kind {
        NodeKind::Constant { value, bits } => Stamp::constant(*bits, *value),
        NodeKind::Parameter(_) | NodeKind::LoadIndexed | NodeKind::Invoke { .. } => Stamp::int(32),
        NodeKind::ArrayLength => Stamp::array_length(),
        kind if kind.is_logic() => Stamp::Logic,
        _ => Stamp::Void,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fold_integer_wraps_at_width() {
        assert_eq!(NodeKind::Add.fold_integer(32, &[i32::MAX as i64, 1]), Some(i32::MIN as i64));
        assert_eq!(
            NodeKind::Add.fold_integer(64, &[i32::MAX as i64, 1]),
            Some(i32::MAX as i64 + 1)
        );
        assert_eq!(NodeKind::Div.fold_integer(32, &[7, 0]), None);
        assert_eq!(NodeKind::Div.fold_integer(32, &[-7, 2]), Some(-3));
        assert_eq!(NodeKind::Shl.fold_integer(32, &[1, 33]), Some(2));
    }

    #[test]
    fn below_is_unsigned() {
        assert_eq!(NodeKind::IntegerBelow.fold_compare(32, -1, 10), Some(false));
        assert_eq!(NodeKind::IntegerBelow.fold_compare(32, 3, 10), Some(true));
        assert_eq!(NodeKind::IntegerLessThan.fold_compare(32, -1, 10), Some(true));
    }

    #[test]
    fn guard_polarity() {
        let info = GuardInfo::new(
            DeoptimizationReason::BoundsCheckException,
            DeoptimizationAction::InvalidateReprofile,
        );
        assert!(info.fails_on(false));
        assert!(!info.fails_on(true));
        assert!(info.negated(true).fails_on(true));
    }
}
