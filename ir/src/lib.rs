#![no_std]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub use smallvec::{SmallVec, smallvec};

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub type FxHashSet<K> = hashbrown::HashSet<K, rustc_hash::FxBuildHasher>;
pub use rustc_hash::{FxBuildHasher, FxHasher};

pub mod adt;
mod builder;
pub mod canonicalization;
pub mod cfg;
mod error;
mod graph;
mod guard;
mod node;
pub mod phase;
mod print;
mod profile;
mod speculation;
pub mod stamp;
mod state;
pub mod verify;

pub use self::{
    adt::{EntitySet, NodeSet},
    builder::{GraphBuilder, LoopScaffold},
    canonicalization::Canonicalizer,
    cfg::{Block, ControlFlowGraph, Loop},
    error::CompilationError,
    graph::{Graph, NodeData},
    node::{
        DeoptInfo, DeoptimizationAction, DeoptimizationReason, GuardInfo, LoopBeginInfo, LoopKind,
        Node, NodeKind, SafepointState,
    },
    phase::{
        FixpointPhase, Phase, PhaseContext, PhaseRuns, PhaseStatistics, PhaseStatus, PhaseSuite,
        apply_phase,
    },
    profile::{ProfilingInfo, StaticProfile},
    speculation::{
        InMemorySpeculationLog, MethodId, Speculation, SpeculationGroup, SpeculationLog,
        SpeculationReason,
    },
    stamp::{IntegerStamp, Stamp},
    state::{GraphState, GuardsStage, NotApplicable, StageFlags},
};
#[cfg(feature = "std")]
pub use self::speculation::{CompilationSpeculationLog, SharedSpeculationLog};

pub use seajit_session::Options;

/// Initialize test logging, controlled by the `SEAJIT_TRACE` environment variable
#[cfg(test)]
pub(crate) fn init_logging() {
    let _ = env_logger::Builder::from_env("SEAJIT_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}
