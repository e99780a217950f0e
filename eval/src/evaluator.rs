use alloc::vec::Vec;

use seajit_ir::{
    DeoptimizationReason, FxHashMap, Graph, Node, NodeKind, SmallVec,
};

use crate::{Heap, Value};

/// The number of fixed nodes an evaluation may execute by default
const DEFAULT_FUEL: u64 = 1_000_000;

/// An error raised while evaluating a graph.
///
/// These indicate a malformed graph, or a transformation which broke the graph's meaning (e.g.
/// an array access whose range check was removed). A deoptimization is not an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("missing argument for parameter {index}")]
    MissingArgument { index: u32 },
    #[error("{node}: index {index} is out of bounds for an array of length {length}")]
    OutOfBounds {
        node: Node,
        index: i64,
        length: usize,
    },
    #[error("{node}: expected a value of kind {expected}, got {found}")]
    TypeMismatch {
        node: Node,
        expected: &'static str,
        found: Value,
    },
    #[error("{node}: division by zero")]
    DivisionByZero { node: Node },
    #[error("{node}: {reason}")]
    Malformed { node: Node, reason: &'static str },
    #[error("evaluation ran out of fuel after {steps} steps")]
    FuelExhausted { steps: u64 },
}

/// How an evaluation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Returned(Option<Value>),
    /// Control reached a failing guard or a `Deoptimize`
    Deoptimized {
        reason: DeoptimizationReason,
        node: Node,
    },
}

impl Outcome {
    #[inline]
    pub fn is_deoptimized(&self) -> bool {
        matches!(self, Self::Deoptimized { .. })
    }

    /// The returned value, if the evaluation returned one
    pub fn value(&self) -> Option<Value> {
        match self {
            Self::Returned(value) => *value,
            Self::Deoptimized { .. } => None,
        }
    }
}

/// A call made by an `Invoke` or `ForeignCall`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub target: u32,
    pub args: SmallVec<[Value; 4]>,
}

/// The observable behavior of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: Outcome,
    /// The calls made, in order
    pub calls: Vec<Call>,
    /// The number of safepoint polls executed, by calls and by loop ends and exits
    pub safepoint_polls: u64,
    /// The number of floating guard checks performed
    pub guards_checked: u64,
    /// The number of fixed nodes executed
    pub steps: u64,
}

impl Execution {
    /// Returns true if `other` made the same calls and ended the same way.
    ///
    /// Safepoint polls, guard checks and steps are expected to differ between a graph and its
    /// optimized form.
    pub fn same_behavior(&self, other: &Self) -> bool {
        let same_outcome = match (&self.outcome, &other.outcome) {
            (Outcome::Returned(a), Outcome::Returned(b)) => a == b,
            (Outcome::Deoptimized { .. }, Outcome::Deoptimized { .. }) => true,
            _ => false,
        };
        same_outcome && self.calls == other.calls
    }
}

/// Executes a [Graph] on concrete arguments
pub struct Evaluator<'g> {
    graph: &'g Graph,
    fuel: u64,
}

impl<'g> Evaluator<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            fuel: DEFAULT_FUEL,
        }
    }

    /// Bound the number of fixed nodes executed before giving up
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    /// Run the graph with `args` bound to its parameters, and objects allocated in `heap`
    pub fn run(&self, args: &[Value], heap: &mut Heap) -> Result<Execution, EvalError> {
        let mut frame = Frame {
            graph: self.graph,
            args,
            heap,
            phis: FxHashMap::default(),
            fixed: FxHashMap::default(),
            cache: FxHashMap::default(),
            calls: Vec::new(),
            safepoint_polls: 0,
            guards_checked: 0,
        };
        let mut steps = 0u64;
        let mut current = self.graph.start();
        let outcome = loop {
            steps += 1;
            if steps > self.fuel {
                return Err(EvalError::FuelExhausted { steps: self.fuel });
            }
            match frame.step(current)? {
                Step::Continue(next) => current = next,
                Step::Done(outcome) => break outcome,
            }
        };
        log::trace!(target: "eval", "{outcome:?} after {steps} steps");
        Ok(Execution {
            outcome,
            calls: frame.calls,
            safepoint_polls: frame.safepoint_polls,
            guards_checked: frame.guards_checked,
            steps,
        })
    }
}

enum Step {
    Continue(Node),
    Done(Outcome),
}

struct Frame<'a> {
    graph: &'a Graph,
    args: &'a [Value],
    heap: &'a mut Heap,
    /// The current value of every phi whose merge was reached
    phis: FxHashMap<Node, Value>,
    /// The most recent result of value-producing fixed nodes
    fixed: FxHashMap<Node, Value>,
    /// Floating values computed since the last merge was entered
    cache: FxHashMap<Node, Value>,
    calls: Vec<Call>,
    safepoint_polls: u64,
    guards_checked: u64,
}

impl Frame<'_> {
    fn malformed(node: Node, reason: &'static str) -> EvalError {
        EvalError::Malformed { node, reason }
    }

    fn next(&self, node: Node) -> Result<Node, EvalError> {
        self.graph.next(node).ok_or(Self::malformed(node, "fixed node has no successor"))
    }

    fn step(&mut self, node: Node) -> Result<Step, EvalError> {
        let graph = self.graph;
        let kind = graph.kind(node);
        if kind.is_begin() {
            if let NodeKind::LoopExit(state) = kind {
                if state.can_safepoint() {
                    self.safepoint_polls += 1;
                }
            }
            if let Some(deopt) = self.check_guards(node)? {
                return Ok(Step::Done(deopt));
            }
            return self.next(node).map(Step::Continue);
        }
        match kind {
            NodeKind::End | NodeKind::LoopEnd(_) => {
                if let NodeKind::LoopEnd(state) = kind {
                    if state.can_safepoint() {
                        self.safepoint_polls += 1;
                    }
                }
                let merge = graph.merge_of(node).ok_or(Self::malformed(node, "end without merge"))?;
                let index = graph
                    .end_index(merge, node)
                    .ok_or(Self::malformed(node, "end not registered with its merge"))?;
                let phis = graph.phis(merge);
                let mut values: SmallVec<[Value; 4]> = SmallVec::with_capacity(phis.len());
                for &phi in phis.iter() {
                    values.push(self.value(graph.phi_value_at(phi, index))?);
                }
                for (phi, value) in phis.into_iter().zip(values) {
                    self.phis.insert(phi, value);
                }
                self.cache.clear();
                Ok(Step::Continue(merge))
            }
            NodeKind::If { .. } => {
                let condition = self.bool_value(graph.input(node, 0))?;
                let successor = if condition {
                    graph.true_successor(node)
                } else {
                    graph.false_successor(node)
                };
                successor.map(Step::Continue).ok_or(Self::malformed(node, "missing branch"))
            }
            NodeKind::FixedGuard(info) => {
                let condition = self.bool_value(graph.input(node, 0))?;
                if info.fails_on(condition) {
                    return Ok(Step::Done(Outcome::Deoptimized {
                        reason: info.reason,
                        node,
                    }));
                }
                self.next(node).map(Step::Continue)
            }
            NodeKind::Deoptimize(info) => Ok(Step::Done(Outcome::Deoptimized {
                reason: info.reason,
                node,
            })),
            NodeKind::Return => {
                let value = match graph.inputs(node).first() {
                    Some(value) => Some(self.value(*value)?),
                    None => None,
                };
                Ok(Step::Done(Outcome::Returned(value)))
            }
            NodeKind::Invoke { target } | NodeKind::ForeignCall { target, .. } => {
                let mut args = SmallVec::new();
                for &arg in graph.inputs(node) {
                    args.push(self.value(arg)?);
                }
                self.calls.push(Call {
                    target: *target,
                    args,
                });
                if kind.is_guaranteed_safepoint() {
                    self.safepoint_polls += 1;
                }
                self.fixed.insert(node, Value::Void);
                self.next(node).map(Step::Continue)
            }
            NodeKind::MonitorEnter { .. } => self.next(node).map(Step::Continue),
            NodeKind::LoadIndexed => {
                let (object, index) = self.element(node)?;
                let value = self.heap.get(object).map(|o| o.elements[index]).unwrap_or(0);
                self.fixed.insert(node, Value::Int(value));
                self.next(node).map(Step::Continue)
            }
            NodeKind::StoreIndexed => {
                let (object, index) = self.element(node)?;
                let value = self.int_value(graph.input(node, 2))?;
                if let Some(object) = self.heap.get_mut(object) {
                    object.elements[index] = value;
                }
                self.fixed.insert(node, Value::Void);
                self.next(node).map(Step::Continue)
            }
            _ => Err(Self::malformed(node, "floating node in the control-flow chain")),
        }
    }

    /// Resolve the array and index of an indexed access, checking bounds
    fn element(&mut self, node: Node) -> Result<(crate::ObjectId, usize), EvalError> {
        let array = self.value(self.graph.input(node, 0))?;
        let object = array.as_ref().ok_or(EvalError::TypeMismatch {
            node,
            expected: "reference",
            found: array,
        })?;
        let index = self.int_value(self.graph.input(node, 1))?;
        let length = self.heap.get(object).map(|o| o.elements.len()).unwrap_or(0);
        if index < 0 || index as usize >= length {
            return Err(EvalError::OutOfBounds {
                node,
                index,
                length,
            });
        }
        Ok((object, index as usize))
    }

    /// Check the floating guards anchored at `begin`, returning the deoptimization of the first
    /// one which fails
    fn check_guards(&mut self, begin: Node) -> Result<Option<Outcome>, EvalError> {
        for guard in self.graph.guards_anchored_at(begin) {
            let info = self.graph.guard_info(guard);
            let condition = self.bool_value(self.graph.guard_condition(guard))?;
            self.guards_checked += 1;
            if info.fails_on(condition) {
                log::trace!(target: "eval", "{guard} failed at {begin}");
                return Ok(Some(Outcome::Deoptimized {
                    reason: info.reason,
                    node: guard,
                }));
            }
        }
        Ok(None)
    }

    fn int_value(&mut self, node: Node) -> Result<i64, EvalError> {
        let value = self.value(node)?;
        value.as_int().ok_or(EvalError::TypeMismatch {
            node,
            expected: "integer",
            found: value,
        })
    }

    fn bool_value(&mut self, node: Node) -> Result<bool, EvalError> {
        let value = self.value(node)?;
        value.as_bool().ok_or(EvalError::TypeMismatch {
            node,
            expected: "boolean",
            found: value,
        })
    }

    /// The current value of `node`
    fn value(&mut self, node: Node) -> Result<Value, EvalError> {
        let graph = self.graph;
        if graph.is_fixed(node) {
            return match self.fixed.get(&node) {
                Some(value) => Ok(*value),
                // Begin nodes used as guards
                None if graph.kind(node).is_begin() => Ok(Value::Void),
                None => Err(Self::malformed(node, "value of a fixed node used before it executed")),
            };
        }
        if let Some(value) = self.cache.get(&node) {
            return Ok(*value);
        }
        let value = self.compute(node)?;
        if !matches!(graph.kind(node), NodeKind::Phi) {
            self.cache.insert(node, value);
        }
        Ok(value)
    }

    fn compute(&mut self, node: Node) -> Result<Value, EvalError> {
        let graph = self.graph;
        let kind = graph.kind(node);
        let value = match kind {
            NodeKind::Parameter(index) => *self
                .args
                .get(*index as usize)
                .ok_or(EvalError::MissingArgument { index: *index })?,
            NodeKind::Constant { value, .. } => Value::Int(*value),
            NodeKind::LogicConstant(value) => Value::Bool(*value),
            kind if kind.is_arithmetic() => {
                let mut operands: SmallVec<[i64; 2]> = SmallVec::new();
                for &input in graph.inputs(node) {
                    operands.push(self.int_value(input)?);
                }
                let result = kind.fold_integer(graph.bits(node), &operands);
                Value::Int(result.ok_or(EvalError::DivisionByZero { node })?)
            }
            kind if kind.is_compare() => {
                let x = self.int_value(graph.input(node, 0))?;
                let y = self.int_value(graph.input(node, 1))?;
                let bits = graph.bits(graph.input(node, 0));
                let result = kind
                    .fold_compare(bits, x, y)
                    .ok_or(Self::malformed(node, "unsupported comparison"))?;
                Value::Bool(result)
            }
            NodeKind::LogicNegation => Value::Bool(!self.bool_value(graph.input(node, 0))?),
            NodeKind::ShortCircuitOr { x_negated, y_negated } => {
                let (x_negated, y_negated) = (*x_negated, *y_negated);
                let x = self.bool_value(graph.input(node, 0))? != x_negated;
                let result = x || self.bool_value(graph.input(node, 1))? != y_negated;
                Value::Bool(result)
            }
            NodeKind::InstanceOf { type_id, .. } => {
                let type_id = *type_id;
                let object = self.value(graph.input(node, 0))?;
                let matches = object
                    .as_ref()
                    .and_then(|id| self.heap.get(id))
                    .is_some_and(|object| object.type_id == type_id);
                Value::Bool(matches)
            }
            NodeKind::ArrayLength => {
                let array = self.value(graph.input(node, 0))?;
                let object = array.as_ref().ok_or(EvalError::TypeMismatch {
                    node,
                    expected: "reference",
                    found: array,
                })?;
                Value::Int(self.heap.get(object).map(|o| o.elements.len() as i64).unwrap_or(0))
            }
            NodeKind::Phi => *self
                .phis
                .get(&node)
                .ok_or(Self::malformed(node, "phi read before its merge was reached"))?,
            NodeKind::Opaque | NodeKind::ValueProxy | NodeKind::Pi => {
                self.value(graph.input(node, 0))?
            }
            NodeKind::Guard(_) | NodeKind::MultiGuard => Value::Void,
            _ => return Err(Self::malformed(node, "cannot evaluate node")),
        };
        Ok(value)
    }
}
