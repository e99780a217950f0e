//! A reference interpreter for seajit graphs.
//!
//! The evaluator executes a [seajit_ir::Graph] directly, following fixed nodes from the start
//! node and computing floating nodes on demand. It exists to check that transformations
//! preserve the meaning of a graph: run the graph before and after, on the same inputs, and
//! compare the [Execution]s.
#![no_std]

#[cfg(any(feature = "std", test))]
extern crate std;

extern crate alloc;

mod evaluator;
#[cfg(test)]
mod tests;
mod value;

pub use self::{
    evaluator::{Call, EvalError, Evaluator, Execution, Outcome},
    value::{Heap, Object, ObjectId, Value},
};
