//! Pre/main/post loop splitting and partial unrolling.
//!
//! A counted loop is first split into three copies of itself, run one after the other: a *pre*
//! loop running at most one iteration, a *main* loop, and a *post* loop running whatever
//! iterations remain. The main loop can then be unrolled: its body is repeated `N` times per
//! iteration, and its limit pulled in so that all `N` copies stay within the original bounds.
//! The post loop picks up the at most `N - 1` iterations the main loop leaves behind.
//!
//! The stride of an unrolled main loop is wrapped in an `Opaque` node, so that the canonicalizer
//! does not fold the repeated bodies back into a shape other transformations would mistake for
//! the original loop. [remove_opaque_strides] unwraps them once loop transformations are done.
use alloc::{format, vec::Vec};

use seajit_ir::{
    CompilationError, DeoptimizationAction, DeoptimizationReason, FxHashMap, Graph, GraphState,
    GuardInfo, Loop, LoopKind, Node, NodeKind, NotApplicable, Phase, PhaseContext, PhaseStatus,
    SpeculationGroup, SpeculationReason, StageFlags,
    stamp::{max_value, min_value},
};
use seajit_ir_analysis::{CountedLoopInfo, Direction, LoopsData};

use crate::{
    DefaultLoopPolicies, LoopFragment, LoopPolicies,
    fragment::{clone_nodes, is_proxy_of, link_nodes},
    peel::check_duplication_allowed,
};

/// The loops created by [insert_pre_post_loops], identified by their loop begins
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrePostLoops {
    pub pre: Node,
    /// The original loop
    pub main: Node,
    pub post: Node,
}

/// Check the shape restrictions of splitting and unrolling `counted`.
///
/// The loop must test its basic counter against the limit at the top of the loop, leave only
/// through that test, and have a single backedge.
fn check_splittable(graph: &Graph, counted: &CountedLoopInfo) -> Result<(), &'static str> {
    let begin = counted.loop_begin();
    if counted.is_inverted() {
        return Err("the exit test is at the bottom of the loop");
    }
    if counted.is_not_equal() {
        return Err("the exit test is an inequality");
    }
    if !counted.ivs()[counted.iv()].is_basic() {
        return Err("the exit test is not on a basic induction variable");
    }
    if graph.next(begin) != Some(counted.control()) {
        return Err("the exit test is not the first node of the loop");
    }
    if graph.loop_exits(begin).as_slice() != [counted.exit()] {
        return Err("the loop has more than one exit");
    }
    if graph.loop_ends(begin).len() != 1 {
        return Err("the loop has more than one backedge");
    }
    if counted.constant_stride(graph).is_none() {
        return Err("the stride is not constant");
    }
    Ok(())
}

fn counted_loop<'a>(
    loops: &'a LoopsData,
    lp: Loop,
    transformation: &'static str,
) -> Result<&'a CountedLoopInfo, CompilationError> {
    loops
        .loop_ex(lp)
        .counted()
        .ok_or_else(|| CompilationError::precondition(transformation, "the loop is not counted"))
}

/// Rebuild the exit test of `control` with `limit` in place of the loop's limit.
///
/// The old test is left to the canonicalizer if it became unused.
fn replace_limit(graph: &mut Graph, control: Node, old_limit: Node, limit: Node) {
    let test = graph.input(control, 0);
    let kind = graph.kind(test).clone();
    let inputs: Vec<Node> = graph
        .inputs(test)
        .iter()
        .map(|input| if *input == old_limit { limit } else { *input })
        .collect();
    let new_test = graph.unique(kind, &inputs);
    graph.set_input(control, 0, new_test);
    graph.kill_if_unused(test);
}

/// Split the counted loop `lp` into a pre loop, a main loop and a post loop.
///
/// The original loop becomes the main loop. The pre loop runs at most one iteration; the main
/// loop continues from where it stopped, and the post loop from where the main loop stopped.
/// Since the main loop runs the same test as the original, it would by itself run every
/// remaining iteration, leaving none to the post loop; it is [partial_unroll] which makes the
/// main loop stop early.
///
/// Requires the loop's counter to be proven, or guarded, not to overflow; a loop-limit guard is
/// created if needed.
pub fn insert_pre_post_loops(
    graph: &mut Graph,
    loops: &LoopsData,
    lp: Loop,
    context: &mut PhaseContext<'_>,
) -> Result<PrePostLoops, CompilationError> {
    const TRANSFORMATION: &str = "pre/main/post loop splitting";

    check_duplication_allowed(graph.state(), TRANSFORMATION)?;
    let counted = counted_loop(loops, lp, TRANSFORMATION)?;
    check_splittable(graph, counted)
        .map_err(|reason| CompilationError::precondition(TRANSFORMATION, reason))?;
    if counted.kind(graph) != LoopKind::Regular {
        return Err(CompilationError::precondition(TRANSFORMATION, "the loop was already split"));
    }
    if !counted.ensure_no_overflow(graph, context) {
        return Err(CompilationError::precondition(TRANSFORMATION, "the counter may overflow"));
    }

    let fragment = LoopFragment::new(graph, loops, lp);
    let begin = fragment.begin();
    let exit = counted.exit();
    let control = counted.control();
    let limit = counted.limit();
    let init = counted.init_node(graph);
    let stride = counted.stride_node(graph);
    let phis = graph.phis(begin);
    log::debug!(target: "loop-unroll", "splitting {begin} into pre/main/post loops");

    // pre: entered where the loop used to be, and continuing into the main loop
    let forward_end = graph.forward_end(begin);
    let main_entry = graph.add(NodeKind::End, &[]);
    graph.set_input(begin, 0, main_entry);
    let pre = fragment.duplicate(graph, forward_end);
    let pre_exit = pre.mapped(exit);
    graph.set_next(pre_exit, Some(main_entry));

    // post: entered when the main loop exits, and continuing to where the loop used to go
    let post_entry = graph.add(NodeKind::End, &[]);
    let post = fragment.duplicate(graph, post_entry);
    let post_exit = post.mapped(exit);
    let after = graph.next(exit);
    graph.set_next(exit, None);
    graph.set_next(exit, Some(post_entry));
    graph.set_next(post_exit, after);

    // Whatever used the values the loop computed now uses those of the post loop
    graph.replace_at_usages_where(exit, post_exit, |g, user| !is_proxy_of(g, user, exit));
    for proxy in graph.proxies(exit) {
        graph.replace_at_usages(proxy, post.mapped(proxy));
        graph.delete(proxy);
    }
    for proxy in graph.proxies(pre_exit) {
        graph.kill_if_unused(proxy);
    }

    // Each loop starts from the values the previous one stopped at
    for phi in phis.iter().copied() {
        let pre_phi = pre.mapped(phi);
        let from_pre = graph.add(NodeKind::ValueProxy, &[pre_phi, pre_exit]);
        graph.set_phi_value(phi, 0, from_pre);
        let from_main = graph.add(NodeKind::ValueProxy, &[phi, exit]);
        graph.set_phi_value(post.mapped(phi), 0, from_main);
    }

    // The pre loop stops after at most one iteration
    let bound = if counted.is_limit_inclusive() {
        init
    } else {
        graph.unique(NodeKind::Add, &[init, stride])
    };
    let pre_limit = match counted.direction() {
        Direction::Up => graph.unique(NodeKind::Min, &[limit, bound]),
        Direction::Down => graph.unique(NodeKind::Max, &[limit, bound]),
    };
    replace_limit(graph, pre.mapped(control), limit, pre_limit);

    let result = PrePostLoops {
        pre: pre.begin(),
        main: begin,
        post: post.begin(),
    };
    let kinds = [
        (result.pre, LoopKind::Pre),
        (begin, LoopKind::Main),
        (result.post, LoopKind::Post),
    ];
    for (node, kind) in kinds {
        if let Some(info) = graph.kind_mut(node).loop_begin_info_mut() {
            info.kind = kind;
            if kind == LoopKind::Pre {
                info.loop_frequency = 1.0;
            }
        }
    }
    Ok(result)
}

/// Unroll the main loop `lp` by `factor`, i.e. run `factor` copies of its body per iteration.
///
/// The loop must be the main loop of a pre/main/post split (see [insert_pre_post_loops]). Its
/// limit is pulled in by `factor - 1` strides; if the limit might underflow (or overflow, for a
/// loop counting down) in doing so, a loop-limit guard is created ahead of the loop. Returns
/// `Ok(false)` without changing anything if such a guard is needed but may not be created.
pub fn partial_unroll(
    graph: &mut Graph,
    loops: &LoopsData,
    lp: Loop,
    factor: u32,
    context: &mut PhaseContext<'_>,
) -> Result<bool, CompilationError> {
    const TRANSFORMATION: &str = "partial unrolling";

    check_duplication_allowed(graph.state(), TRANSFORMATION)?;
    if factor < 2 {
        return Err(CompilationError::precondition(
            TRANSFORMATION,
            format!("unroll factor {factor} is too small"),
        ));
    }
    let counted = counted_loop(loops, lp, TRANSFORMATION)?;
    check_splittable(graph, counted)
        .map_err(|reason| CompilationError::precondition(TRANSFORMATION, reason))?;
    if counted.kind(graph) != LoopKind::Main {
        return Err(CompilationError::precondition(
            TRANSFORMATION,
            "only the main loop of a pre/main/post split may be unrolled",
        ));
    }
    let stride = counted
        .constant_stride(graph)
        .ok_or_else(|| {
            CompilationError::precondition(TRANSFORMATION, "the stride is not constant")
        })?;

    let begin = counted.loop_begin();
    let control = counted.control();
    let body_begin = counted.body();
    let limit = counted.limit();
    let bits = graph.bits(limit);
    let Some(delta) = i64::try_from((factor as i128 - 1) * stride.unsigned_abs() as i128)
        .ok()
        .filter(|delta| *delta <= max_value(bits))
    else {
        return Err(CompilationError::precondition(TRANSFORMATION, "the unrolled stride overflows"));
    };
    let Some(unrolled_stride) = i64::try_from(factor as i128 * stride as i128)
        .ok()
        .filter(|s| *s >= min_value(bits) && *s <= max_value(bits))
    else {
        return Err(CompilationError::precondition(TRANSFORMATION, "the unrolled stride overflows"));
    };

    // Pulling the limit in must not wrap around; decide on the guard before changing anything
    let limit_stamp = graph.int_stamp(limit);
    let fits = limit_stamp.is_some_and(|stamp| match counted.direction() {
        Direction::Up => stamp.lower() as i128 - delta as i128 >= min_value(bits) as i128,
        Direction::Down => stamp.upper() as i128 + delta as i128 <= max_value(bits) as i128,
    });
    let limit_check = if fits {
        None
    } else {
        let reason = SpeculationReason::new(
            SpeculationGroup::LoopLimitCheck,
            graph.method(),
            graph.position(begin).unwrap_or(0),
        )
        .with_detail(1);
        let deopts = context.profile().deoptimization_count(DeoptimizationReason::LoopLimitCheck);
        if !graph.state().allows_overflow_guards()
            || !context.options().allows_loop_limit_checks(deopts)
            || !context.speculation_log().may_speculate(&reason)
        {
            log::debug!(
                target: "loop-unroll",
                "{begin}: cannot guard the unrolled limit, not unrolling"
            );
            return Ok(false);
        }
        Some(reason)
    };

    let loop_end = graph.loop_ends(begin)[0];
    let last = graph
        .predecessor(loop_end)
        .ok_or_else(|| CompilationError::InvalidGraph(format!("{loop_end} has no predecessor")))?;
    let phis = graph.phis(begin);
    let iv_phi = counted.ivs()[counted.iv()].value();
    let body: Vec<Node> = loops
        .inside(graph, lp)
        .iter()
        .filter(|node| {
            *node != begin && *node != control && *node != loop_end && !phis.contains(node)
        })
        .collect();
    log::debug!(
        target: "loop-unroll",
        "unrolling {begin} by {factor} ({} body nodes)",
        body.len()
    );

    // The backedge values reaching each copy, starting with those of the original body
    let mut backedges: Vec<Node> = phis.iter().map(|phi| graph.phi_value_at(*phi, 1)).collect();
    let mut tail = last;
    graph.set_next(last, None);
    for _ in 1..factor {
        let mut map = FxHashMap::default();
        clone_nodes(graph, &body, &mut map);
        map.insert(begin, map[&body_begin]);
        for (phi, value) in phis.iter().zip(backedges.iter()) {
            map.insert(*phi, *value);
        }
        link_nodes(graph, &body, &map);
        graph.set_next(tail, Some(map[&body_begin]));
        tail = map.get(&last).copied().unwrap_or(last);
        for (phi, value) in phis.iter().zip(backedges.iter_mut()) {
            let original = graph.phi_value_at(*phi, 1);
            *value = map.get(&original).copied().unwrap_or(original);
        }
    }
    graph.set_next(tail, Some(loop_end));

    let constant = graph.constant(bits, unrolled_stride);
    let opaque = graph.add(NodeKind::Opaque, &[constant]);
    for (phi, value) in phis.iter().zip(backedges) {
        let value = if *phi == iv_phi {
            graph.unique(NodeKind::Add, &[*phi, opaque])
        } else {
            value
        };
        graph.set_phi_value(*phi, 1, value);
    }

    let delta_node = graph.constant(bits, delta);
    let main_limit = match counted.direction() {
        Direction::Up => graph.unique(NodeKind::Sub, &[limit, delta_node]),
        Direction::Down => graph.unique(NodeKind::Add, &[limit, delta_node]),
    };
    replace_limit(graph, control, limit, main_limit);

    if let Some(reason) = limit_check {
        let boundary = match counted.direction() {
            Direction::Up => min_value(bits) + delta,
            Direction::Down => max_value(bits) - delta,
        };
        let boundary = graph.constant(bits, boundary);
        // deoptimize if the limit is too close to the end of the range to be pulled in
        let condition = match counted.direction() {
            Direction::Up => graph.unique(NodeKind::IntegerLessThan, &[limit, boundary]),
            Direction::Down => graph.unique(NodeKind::IntegerLessThan, &[boundary, limit]),
        };
        let speculation = context.speculation_log().speculate(reason);
        let anchor = graph.prev_begin(graph.forward_end(begin));
        let info = GuardInfo::new(
            DeoptimizationReason::LoopLimitCheck,
            DeoptimizationAction::InvalidateRecompile,
        )
        .negated(true)
        .with_speculation(speculation);
        let guard = graph.add_guard(condition, anchor, info);
        log::debug!(target: "loop-unroll", "{begin}: guarding the unrolled limit with {guard}");
    }

    if let Some(info) = graph.kind_mut(begin).loop_begin_info_mut() {
        info.unroll_factor *= factor;
        info.loop_frequency = (info.loop_frequency / factor as f64).max(1.0);
        info.opaque_stride = Some(opaque);
    }
    Ok(true)
}

/// Unwrap the `Opaque` strides of unrolled loops. Returns true if any was found.
pub fn remove_opaque_strides(graph: &mut Graph) -> bool {
    let opaques = graph.nodes_matching(|kind| matches!(kind, NodeKind::Opaque));
    for &opaque in opaques.iter() {
        let value = graph.input(opaque, 0);
        graph.replace_at_usages(opaque, value);
        graph.delete(opaque);
    }
    for begin in graph.nodes_matching(|kind| kind.is_loop_begin()) {
        if let Some(info) = graph.kind_mut(begin).loop_begin_info_mut() {
            info.opaque_stride = None;
        }
    }
    !opaques.is_empty()
}

/// Splits counted loops into pre/main/post loops, and unrolls the main loop by
/// [seajit_ir::Options::unroll_factor].
pub struct LoopPartialUnrollPhase<P = DefaultLoopPolicies> {
    policies: P,
}

impl LoopPartialUnrollPhase {
    pub fn new() -> Self {
        Self::with_policies(DefaultLoopPolicies)
    }
}

impl Default for LoopPartialUnrollPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LoopPolicies> LoopPartialUnrollPhase<P> {
    pub fn with_policies(policies: P) -> Self {
        Self { policies }
    }

    fn is_candidate(
        &self,
        graph: &Graph,
        loops: &LoopsData,
        lp: Loop,
        context: &mut PhaseContext<'_>,
    ) -> bool {
        let Some(counted) = loops.loop_ex(lp).counted() else {
            return false;
        };
        if counted.kind(graph) != LoopKind::Regular {
            return false;
        }
        if let Err(reason) = check_splittable(graph, counted) {
            log::trace!(target: "loop-unroll", "{}: not unrolling, {reason}", counted.loop_begin());
            return false;
        }
        if !self.policies.should_partial_unroll(graph, loops, lp, context.options()) {
            return false;
        }
        counted.counter_never_overflows(graph) || counted.may_create_overflow_guard(graph, context)
    }
}

impl<P: LoopPolicies> Phase for LoopPartialUnrollPhase<P> {
    fn name(&self) -> &'static str {
        "loop-partial-unroll"
    }

    fn not_applicable_to(&self, state: &GraphState) -> Option<NotApplicable> {
        NotApplicable::unless_run_before(StageFlags::VALUE_PROXY_REMOVAL | StageFlags::FSA, state)
    }

    fn run(
        &mut self,
        graph: &mut Graph,
        context: &mut PhaseContext<'_>,
    ) -> Result<PhaseStatus, CompilationError> {
        let mut loops = LoopsData::compute(graph);
        loops.detect_counted_loops(graph);
        let candidates: Vec<Node> = loops
            .inner_first()
            .into_iter()
            .filter(|lp| self.is_candidate(graph, &loops, *lp, context))
            .map(|lp| loops.loop_ex(lp).begin())
            .collect();

        let factor = context.options().unroll_factor;
        let mut status = PhaseStatus::Unchanged;
        for begin in candidates {
            let mut loops = LoopsData::compute(graph);
            loops.detect_counted_loops(graph);
            let Some(lp) = loops.loop_for_begin(begin).map(|lp| lp.id()) else {
                continue;
            };
            insert_pre_post_loops(graph, &loops, lp, context)?;
            status = PhaseStatus::Changed;
            context.statistics_mut().increment("loops-split", 1);

            let mut loops = LoopsData::compute(graph);
            loops.detect_counted_loops(graph);
            let Some(lp) = loops.loop_for_begin(begin).map(|lp| lp.id()) else {
                continue;
            };
            if partial_unroll(graph, &loops, lp, factor, context)? {
                context.statistics_mut().increment("loops-unrolled", 1);
            }
        }
        if remove_opaque_strides(graph) {
            status = PhaseStatus::Changed;
        }
        Ok(status)
    }
}
