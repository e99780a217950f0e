#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod counted;
mod induction;
mod loops;
mod schedule;

pub use self::{
    counted::CountedLoopInfo,
    induction::{
        AffineRelation, Direction, InductionVariable, InductionVariables, IvId, IvKind, OffsetOp,
        ScaleOp, build_offset, constant_through_opaque,
    },
    loops::{LoopEx, LoopsData},
    schedule::EarliestSchedule,
};

/// Initialize test logging, controlled by the `SEAJIT_TRACE` environment variable
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env("SEAJIT_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}
