use seajit_ir::{
    CompilationError, Graph, GraphState, NodeKind, NotApplicable, Phase, PhaseContext,
    PhaseStatus, StageFlags,
};

/// Replaces every value proxy by the value it proxies.
///
/// Proxies mark where values computed in a loop are used after it, which loop transformations
/// rely on to find the values they need to merge. Once they are removed, loops may no longer be
/// duplicated.
#[derive(Debug, Default)]
pub struct RemoveValueProxyPhase;

impl RemoveValueProxyPhase {
    pub fn new() -> Self {
        Self
    }
}

impl Phase for RemoveValueProxyPhase {
    fn name(&self) -> &'static str {
        "remove-value-proxies"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::if_applied(StageFlags::VALUE_PROXY_REMOVAL, state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let proxies = graph.nodes_matching(|kind| matches!(kind, NodeKind::ValueProxy));
        for &proxy in proxies.iter() {
            let value = graph.input(proxy, 0);
            graph.replace_at_usages(proxy, value);
            graph.delete(proxy);
        }
        context.statistics_mut().increment("proxies-removed", proxies.len() as u64);
        Ok(PhaseStatus::changed_if(!proxies.is_empty()))
    }

    fn update_graph_state(&self, state: &mut GraphState) {
        state.add_stage_flag(StageFlags::VALUE_PROXY_REMOVAL);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use seajit_ir::Options;

    use super::*;
    use crate::{
        LoopPeelingPhase,
        tests::{Arg, Harness, assert_same_behavior, counted_sum},
    };

    #[test]
    fn proxies_are_replaced_by_their_values() -> Result<(), CompilationError> {
        crate::init_logging();
        let mut graph = counted_sum();
        let original = graph.clone();
        let mut harness = Harness::new(Options::none());
        let status = harness.apply(&mut graph, &mut RemoveValueProxyPhase::new())?;
        assert_eq!(status, PhaseStatus::Changed);
        assert!(graph.nodes_matching(|kind| matches!(kind, NodeKind::ValueProxy)).is_empty());
        assert!(!graph.state().allows_loop_duplication());
        for n in [0, 4] {
            assert_same_behavior(&original, &graph, &[Arg::Int(n)]);
        }
        Ok(())
    }

    #[test]
    fn duplication_is_refused_afterwards() -> Result<(), CompilationError> {
        let mut graph = counted_sum();
        let mut options = Options::none();
        options.set_loop_peeling(true);
        let mut harness = Harness::new(options);
        harness.apply(&mut graph, &mut RemoveValueProxyPhase::new())?;
        let result = harness.apply(&mut graph, &mut LoopPeelingPhase::new());
        assert!(matches!(result, Err(CompilationError::PhaseNotApplicable { .. })));
        Ok(())
    }
}
