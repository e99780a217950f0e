//! Loop transformations and guard optimizations.
//!
//! Every transformation here is packaged as a [seajit_ir::Phase], so that it is sequenced by a
//! [seajit_ir::PhaseSuite] which checks the graph's stage before running it, and canonicalizes
//! whatever it changed afterwards. The loop primitives ([peel], [insert_pre_post_loops],
//! [partial_unroll], [unswitch]) are also exported on their own, for drivers and tests which
//! want to apply them to a specific loop.
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod convert_deopt;
mod float_guards;
mod fragment;
mod full_unroll;
mod guard_movement;
mod peel;
mod pipeline;
mod policies;
mod predication;
mod proxies;
mod safepoint;
#[cfg(test)]
mod tests;
mod unroll;
mod unswitch;

pub use self::{
    convert_deopt::ConvertDeoptimizeToGuardPhase,
    float_guards::FloatFixedGuardsPhase,
    fragment::{DuplicatedLoop, LoopFragment},
    full_unroll::LoopFullUnrollPhase,
    guard_movement::SpeculativeGuardMovementPhase,
    peel::{LoopPeelingPhase, peel},
    pipeline::LoopPipeline,
    policies::{DefaultLoopPolicies, LoopPolicies},
    predication::LoopPredicationPhase,
    proxies::RemoveValueProxyPhase,
    safepoint::{LoopSafepointEliminationPhase, SafepointPlan},
    unroll::{
        LoopPartialUnrollPhase, PrePostLoops, insert_pre_post_loops, partial_unroll,
        remove_opaque_strides,
    },
    unswitch::{LoopUnswitchingPhase, unswitch},
};

/// Initialize test logging, controlled by the `SEAJIT_TRACE` environment variable
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env("SEAJIT_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}
