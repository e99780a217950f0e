use seajit_ir::{Options, PhaseSuite};

use crate::{
    ConvertDeoptimizeToGuardPhase, FloatFixedGuardsPhase, LoopFullUnrollPhase,
    LoopPartialUnrollPhase, LoopPeelingPhase, LoopPredicationPhase, LoopSafepointEliminationPhase,
    LoopUnswitchingPhase, SpeculativeGuardMovementPhase,
};

/// Builds the suites of loop and guard optimizations run on a graph in the high tier.
pub struct LoopPipeline;

impl LoopPipeline {
    /// The standard order of the loop and guard optimizations.
    ///
    /// Deoptimizations are first turned into guards, and guards made to float, so that the loop
    /// transformations see them as part of the loop bodies they duplicate. Loops are reshaped
    /// before their guards are optimized, and safepoints are eliminated last, once no further
    /// loop-limit guard is needed.
    ///
    /// Optional transformations disabled in `options` are left out. The suite expects a graph
    /// which still allows floating guards.
    pub fn standard(options: &Options) -> PhaseSuite {
        let mut suite = PhaseSuite::new("loop-pipeline");
        suite.append(ConvertDeoptimizeToGuardPhase::new());
        suite.append(FloatFixedGuardsPhase::new());
        if options.loop_peeling {
            suite.append(LoopPeelingPhase::new());
        }
        if options.loop_unswitch {
            suite.append(LoopUnswitchingPhase::new());
        }
        if options.full_unroll {
            suite.append(LoopFullUnrollPhase::new());
        }
        if options.partial_unroll {
            suite.append(LoopPartialUnrollPhase::new());
        }
        if options.loop_predication {
            suite.append(LoopPredicationPhase::new());
        }
        if options.speculative_guard_movement {
            suite.append(SpeculativeGuardMovementPhase::new());
        }
        if options.safepoint_elimination {
            suite.append(LoopSafepointEliminationPhase::new());
        }
        suite
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use pretty_assertions::assert_eq;
    use seajit_ir::{CompilationError, GuardsStage, StageFlags};

    use super::*;
    use crate::tests::{Arg, Harness, assert_same_behavior, counted_sum};

    #[test]
    fn phases_run_in_order() {
        let suite = LoopPipeline::standard(&Options::default());
        assert_eq!(
            suite.phase_names().collect::<Vec<_>>(),
            [
                "convert-deoptimize-to-guard",
                "float-fixed-guards",
                "loop-peeling",
                "loop-unswitching",
                "loop-full-unroll",
                "loop-partial-unroll",
                "loop-predication",
                "speculative-guard-movement",
                "loop-safepoint-elimination",
            ]
        );
        let suite = LoopPipeline::standard(&Options::none());
        assert_eq!(
            suite.phase_names().collect::<Vec<_>>(),
            ["convert-deoptimize-to-guard", "float-fixed-guards"]
        );
    }

    #[test]
    fn fixed_deopt_graphs_are_refused() {
        let mut graph = counted_sum();
        graph.state_mut().set_guards_stage(GuardsStage::FixedDeopts);
        let mut suite = LoopPipeline::standard(&Options::none());
        let mut harness = Harness::new(Options::none());
        let result = harness.apply(&mut graph, &mut suite);
        assert!(matches!(
            result,
            Err(CompilationError::PhaseNotApplicable {
                phase: "float-fixed-guards",
                ..
            })
        ));
    }

    #[test]
    fn the_standard_pipeline_preserves_behavior() -> Result<(), CompilationError> {
        crate::init_logging();
        let mut graph = counted_sum();
        let original = graph.clone();
        let mut options = Options::default();
        options.set_verify_graphs(true);
        let mut suite = LoopPipeline::standard(&options);
        let mut harness = Harness::new(options);
        harness.apply(&mut graph, &mut suite)?;
        assert!(graph.state().is_after_stage(StageFlags::SAFEPOINT_ELIMINATION));
        for n in [-1, 0, 1, 2, 7, 13] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n)]);
        }
        Ok(())
    }
}
