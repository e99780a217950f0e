//! Fixtures and helpers shared by the tests of this crate
use alloc::vec::Vec;

use seajit_eval::{Evaluator, Execution, Heap, Value};
use seajit_ir::{
    CompilationError, Graph, GraphBuilder, InMemorySpeculationLog, MethodId, Options, Phase,
    PhaseContext, PhaseStatistics, PhaseStatus, StaticProfile, apply_phase,
};

/// An argument passed to a graph under evaluation
#[derive(Debug, Copy, Clone)]
pub(crate) enum Arg<'a> {
    Int(i64),
    /// Allocated as an object of type 1 before the evaluation starts
    Array(&'a [i64]),
}

pub(crate) fn execute(graph: &Graph, args: &[Arg<'_>]) -> Execution {
    let mut heap = Heap::new();
    let args = args
        .iter()
        .map(|arg| match arg {
            Arg::Int(value) => Value::Int(*value),
            Arg::Array(elements) => heap.alloc(1, elements.iter().copied()),
        })
        .collect::<Vec<_>>();
    Evaluator::new(graph).run(&args, &mut heap).expect("evaluation failed")
}

#[track_caller]
pub(crate) fn assert_same_behavior(before: &Graph, after: &Graph, args: &[Arg<'_>]) {
    let expected = execute(before, args);
    let actual = execute(after, args);
    assert!(
        expected.same_behavior(&actual),
        "behavior changed for {args:?}\nbefore: {expected:?}\nafter: {actual:?}\n\n{after}"
    );
}

/// `i = 0; sum = 0; while (i < n) { sum += i; i++ }; return sum`, with `n` as parameter 0
pub(crate) fn counted_sum() -> Graph {
    let mut graph = Graph::new(MethodId(0));
    let mut b = GraphBuilder::new(&mut graph);
    let n = b.int_parameter(0);
    let zero = b.int(0);
    let one = b.int(1);
    let scaffold = b.loop_begin(10.0);
    let i = b.loop_phi(&scaffold, zero);
    let sum = b.loop_phi(&scaffold, zero);
    let cond = b.less_than(i, n);
    let exit = b.loop_exit_if(&scaffold, cond, true, 0.9);
    let next_sum = b.add(sum, i);
    let next_i = b.add(i, one);
    b.loop_end(&scaffold, &[(i, next_i), (sum, next_sum)]);
    b.position_at(exit);
    let result = b.proxy(sum, exit);
    b.return_value(Some(result));
    graph
}

/// Everything a phase needs besides the graph, owned so tests can inspect it afterwards
pub(crate) struct Harness {
    pub options: Options,
    pub log: InMemorySpeculationLog,
    pub profile: StaticProfile,
    /// The statistics of the most recent [Harness::apply]
    pub statistics: PhaseStatistics,
}

impl Harness {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            log: InMemorySpeculationLog::new(),
            profile: StaticProfile::new(),
            statistics: PhaseStatistics::default(),
        }
    }

    pub fn apply<P: Phase + ?Sized>(
        &mut self,
        graph: &mut Graph,
        phase: &mut P,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut context = PhaseContext::new(&self.options, &mut self.log, &self.profile);
        let result = apply_phase(phase, graph, &mut context);
        self.statistics = context.statistics().clone();
        result
    }

    pub fn context(&mut self) -> PhaseContext<'_> {
        PhaseContext::new(&self.options, &mut self.log, &self.profile)
    }
}

mod properties {
    use proptest::prelude::*;

    use super::*;
    use crate::LoopPartialUnrollPhase;

    fn unrolled_sum(factor: u32) -> Result<Graph, CompilationError> {
        let mut graph = counted_sum();
        let mut options = Options::none();
        options.set_partial_unroll(true).set_unroll_factor(factor).set_verify_graphs(true);
        Harness::new(options).apply(&mut graph, &mut LoopPartialUnrollPhase::new())?;
        Ok(graph)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn unrolling_keeps_the_trip_count(factor in 2u32..=6, n in -4i64..120) {
            let original = counted_sum();
            let graph = unrolled_sum(factor).expect("unrolling failed");
            let expected = execute(&original, &[Arg::Int(n)]);
            let actual = execute(&graph, &[Arg::Int(n)]);
            prop_assert!(expected.same_behavior(&actual), "{expected:?} != {actual:?}");
            prop_assert_eq!(actual.outcome.value(), Some(Value::Int((0..n.max(0)).sum())));
        }
    }
}
