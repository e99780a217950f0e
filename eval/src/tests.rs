use pretty_assertions::assert_eq;
use seajit_ir::{
    DeoptimizationAction, DeoptimizationReason, Graph, GraphBuilder, MethodId, Node, SafepointState,
};

use crate::*;

fn init_logging() {
    let _ = env_logger::Builder::from_env("SEAJIT_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// `sum = 0; for (i = 0; i < a.length; i++) { guard(i |<| a.length); sum += a[i] }; return sum`
fn array_sum() -> (Graph, Node) {
    let mut graph = Graph::new(MethodId(0));
    let mut b = GraphBuilder::new(&mut graph);
    let array = b.array_parameter(0);
    let length = b.array_length(array);
    let zero = b.int(0);
    let one = b.int(1);
    let scaffold = b.loop_begin(10.0);
    let i = b.loop_phi(&scaffold, zero);
    let sum = b.loop_phi(&scaffold, zero);
    let cond = b.less_than(i, length);
    let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
    let in_bounds = b.below(i, length);
    let guard = b.guard(in_bounds, DeoptimizationReason::BoundsCheckException, false);
    let element = b.load_indexed(array, i, Some(guard));
    let next_sum = b.add(sum, element);
    let next_i = b.add(i, one);
    let loop_end = b.loop_end(&scaffold, &[(i, next_i), (sum, next_sum)]);
    b.position_at(exit);
    let result = b.proxy(sum, exit);
    b.return_value(Some(result));
    (graph, loop_end)
}

#[test]
fn evaluates_loops() -> Result<(), EvalError> {
    init_logging();
    let (graph, _) = array_sum();
    let mut heap = Heap::new();
    let array = heap.alloc(1, [3, 4, 5]);
    let execution = Evaluator::new(&graph).run(&[array], &mut heap)?;
    assert_eq!(execution.outcome, Outcome::Returned(Some(Value::Int(12))));
    assert_eq!(execution.guards_checked, 3);
    // three backedges and one exit
    assert_eq!(execution.safepoint_polls, 4);
    assert!(execution.calls.is_empty());
    Ok(())
}

#[test]
fn disabled_safepoints_do_not_poll() -> Result<(), EvalError> {
    let (mut graph, loop_end) = array_sum();
    *graph.kind_mut(loop_end) = seajit_ir::NodeKind::LoopEnd(SafepointState::OptimizerDisabled);
    let mut heap = Heap::new();
    let array = heap.alloc(1, [1, 1]);
    let execution = Evaluator::new(&graph).run(&[array], &mut heap)?;
    assert_eq!(execution.outcome.value(), Some(Value::Int(2)));
    assert_eq!(execution.safepoint_polls, 1);
    Ok(())
}

#[test]
fn failing_guards_deoptimize() -> Result<(), EvalError> {
    // if (x < 0) deoptimize; invoke(x); return x
    let mut graph = Graph::new(MethodId(0));
    let mut b = GraphBuilder::new(&mut graph);
    let x = b.int_parameter(0);
    let zero = b.int(0);
    let negative = b.less_than(x, zero);
    let (t, f) = b.branch(negative, 0.01);
    b.position_at(t);
    let deopt = b.deoptimize(
        DeoptimizationReason::RuntimeConstraint,
        DeoptimizationAction::InvalidateReprofile,
    );
    b.position_at(f);
    b.invoke(7, &[x]);
    b.return_value(Some(x));

    let mut heap = Heap::new();
    let evaluator = Evaluator::new(&graph);
    let passed = evaluator.run(&[Value::Int(4)], &mut heap)?;
    assert_eq!(passed.outcome.value(), Some(Value::Int(4)));
    assert_eq!(passed.calls.len(), 1);
    assert_eq!(passed.calls[0].target, 7);
    assert_eq!(passed.safepoint_polls, 1);

    let failed = evaluator.run(&[Value::Int(-1)], &mut heap)?;
    assert_eq!(
        failed.outcome,
        Outcome::Deoptimized {
            reason: DeoptimizationReason::RuntimeConstraint,
            node: deopt,
        }
    );
    assert!(failed.calls.is_empty());
    assert!(!passed.same_behavior(&failed));
    Ok(())
}

#[test]
fn unguarded_out_of_bounds_is_an_error() {
    let mut graph = Graph::new(MethodId(0));
    let mut b = GraphBuilder::new(&mut graph);
    let array = b.array_parameter(0);
    let index = b.int(5);
    let load = b.load_indexed(array, index, None);
    b.return_value(Some(load));

    let mut heap = Heap::new();
    let array = heap.alloc(1, [0; 2]);
    let result = Evaluator::new(&graph).run(&[array], &mut heap);
    assert_eq!(
        result,
        Err(EvalError::OutOfBounds {
            node: load,
            index: 5,
            length: 2,
        })
    );
}

#[test]
fn infinite_loops_run_out_of_fuel() {
    let mut graph = Graph::new(MethodId(0));
    let mut b = GraphBuilder::new(&mut graph);
    let scaffold = b.loop_begin(100.0);
    b.loop_end(&scaffold, &[]);

    let mut heap = Heap::new();
    let result = Evaluator::new(&graph).with_fuel(50).run(&[], &mut heap);
    assert_eq!(result, Err(EvalError::FuelExhausted { steps: 50 }));
}

#[test]
fn missing_arguments_are_reported() {
    let (graph, _) = array_sum();
    let mut heap = Heap::new();
    let result = Evaluator::new(&graph).run(&[], &mut heap);
    assert_eq!(result, Err(EvalError::MissingArgument { index: 0 }));
}
