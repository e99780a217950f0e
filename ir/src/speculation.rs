use alloc::vec::Vec;
use core::fmt;

use crate::FxHashSet;

/// Identifies the method a graph was built from
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// A handle to a speculation made during compilation.
///
/// Deoptimizations carry this handle back to the runtime, which reports it to the
/// [SharedSpeculationLog] so that the same speculation is not made again.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Speculation(Option<u32>);

impl Speculation {
    pub const NONE: Self = Self(None);

    #[inline(always)]
    pub const fn new(id: u32) -> Self {
        Self(Some(id))
    }

    #[inline(always)]
    pub const fn id(&self) -> Option<u32> {
        self.0
    }

    #[inline(always)]
    pub const fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

/// The transformation which made a speculation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpeculationGroup {
    LoopPredication,
    GuardMovement,
    LoopLimitCheck,
}

/// The identity of a speculation, stable across compilations of the same method.
///
/// `position` is the bytecode position the speculation is about, usually the loop header, and
/// `detail` disambiguates several speculations of the same group at that position (e.g. the
/// position of the guard being hoisted).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeculationReason {
    pub group: SpeculationGroup,
    pub method: MethodId,
    pub position: u32,
    pub detail: u32,
}

impl SpeculationReason {
    pub const fn new(group: SpeculationGroup, method: MethodId, position: u32) -> Self {
        Self {
            group,
            method,
            position,
            detail: 0,
        }
    }

    pub const fn with_detail(mut self, detail: u32) -> Self {
        self.detail = detail;
        self
    }
}

/// The capability to make speculative assumptions during one compilation.
///
/// Only code that actually speculates is handed a log, so the set of phases able to make
/// speculative decisions is visible in their signatures.
pub trait SpeculationLog {
    /// Returns false if a speculation with this reason already failed in an earlier compilation
    fn may_speculate(&self, reason: &SpeculationReason) -> bool;
    /// Record a speculation, returning the handle to attach to the guard that depends on it
    fn speculate(&mut self, reason: SpeculationReason) -> Speculation;
    /// Returns true if any speculation has been made during this compilation
    fn has_speculations(&self) -> bool;
}

/// A self-contained speculation log, for single-threaded embeddings and tests
#[derive(Debug, Default)]
pub struct InMemorySpeculationLog {
    failed: FxHashSet<SpeculationReason>,
    speculations: Vec<SpeculationReason>,
}

impl InMemorySpeculationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log in which the given speculations have already failed
    pub fn with_failed(failed: impl IntoIterator<Item = SpeculationReason>) -> Self {
        Self {
            failed: failed.into_iter().collect(),
            speculations: Vec::new(),
        }
    }

    /// Mark a speculation as failed, as if the guard relying on it had deoptimized
    pub fn record_failure(&mut self, speculation: Speculation) -> bool {
        match self.reason_of(speculation) {
            Some(reason) => self.failed.insert(reason),
            None => false,
        }
    }

    pub fn reason_of(&self, speculation: Speculation) -> Option<SpeculationReason> {
        let id = speculation.id()? as usize;
        self.speculations.get(id).copied()
    }

    pub fn speculations(&self) -> &[SpeculationReason] {
        &self.speculations
    }
}

impl SpeculationLog for InMemorySpeculationLog {
    fn may_speculate(&self, reason: &SpeculationReason) -> bool {
        !self.failed.contains(reason)
    }

    fn speculate(&mut self, reason: SpeculationReason) -> Speculation {
        debug_assert!(self.may_speculate(&reason));
        let id = self.speculations.len() as u32;
        self.speculations.push(reason);
        Speculation::new(id)
    }

    fn has_speculations(&self) -> bool {
        !self.speculations.is_empty()
    }
}

#[cfg(feature = "std")]
pub use self::shared::{CompilationSpeculationLog, SharedSpeculationLog};

#[cfg(feature = "std")]
mod shared {
    use alloc::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::FxHashMap;

    #[derive(Default)]
    struct SharedState {
        failed: FxHashSet<SpeculationReason>,
        issued: FxHashMap<u32, SpeculationReason>,
        next_id: u32,
    }

    /// The speculation state shared by all compilations, and updated by the runtime.
    ///
    /// This is the only state that crosses compilation boundaries. Compilations never read it
    /// directly: they take a snapshot of the failed speculations when they start (see
    /// [SharedSpeculationLog::compilation_log]), so a failure reported while a compilation is
    /// running is only observed by the next one.
    #[derive(Clone, Default)]
    pub struct SharedSpeculationLog {
        state: Arc<Mutex<SharedState>>,
    }

    impl SharedSpeculationLog {
        pub fn new() -> Self {
            Self::default()
        }

        /// Called by the runtime when a guard carrying `speculation` deoptimized
        pub fn record_failure(&self, speculation: Speculation) -> bool {
            let Some(id) = speculation.id() else {
                return false;
            };
            let mut state = self.state.lock();
            match state.issued.get(&id).copied() {
                Some(reason) => {
                    log::debug!(target: "speculation", "speculation {id} failed: {reason:?}");
                    state.failed.insert(reason)
                }
                None => false,
            }
        }

        pub fn failed_count(&self) -> usize {
            self.state.lock().failed.len()
        }

        /// Start a compilation, snapshotting the speculations which have failed so far
        pub fn compilation_log(&self) -> CompilationSpeculationLog {
            let mut log = CompilationSpeculationLog {
                shared: self.clone(),
                failed: FxHashSet::default(),
                made: 0,
            };
            log.collect_failed_speculations();
            log
        }
    }

    /// The view of a [SharedSpeculationLog] used by a single compilation
    pub struct CompilationSpeculationLog {
        shared: SharedSpeculationLog,
        failed: FxHashSet<SpeculationReason>,
        made: usize,
    }

    impl CompilationSpeculationLog {
        /// Refresh the snapshot of failed speculations from the shared log
        pub fn collect_failed_speculations(&mut self) {
            self.failed = self.shared.state.lock().failed.clone();
        }
    }

    impl SpeculationLog for CompilationSpeculationLog {
        fn may_speculate(&self, reason: &SpeculationReason) -> bool {
            !self.failed.contains(reason)
        }

        fn speculate(&mut self, reason: SpeculationReason) -> Speculation {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.issued.insert(id, reason);
            self.made += 1;
            Speculation::new(id)
        }

        fn has_speculations(&self) -> bool {
            self.made > 0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(position: u32) -> SpeculationReason {
        SpeculationReason::new(SpeculationGroup::LoopPredication, MethodId(1), position)
    }

    #[test]
    fn failed_speculations_are_not_repeated() {
        let mut log = InMemorySpeculationLog::new();
        assert!(!log.has_speculations());
        let speculation = log.speculate(reason(4));
        assert!(log.has_speculations());
        assert!(log.record_failure(speculation));
        assert!(!log.may_speculate(&reason(4)));
        assert!(log.may_speculate(&reason(5)));
    }

    #[cfg(feature = "std")]
    #[test]
    fn failures_are_observed_by_the_next_compilation() {
        let shared = SharedSpeculationLog::new();
        let mut first = shared.compilation_log();
        let speculation = first.speculate(reason(7));
        assert!(shared.record_failure(speculation));
        // The running compilation keeps its snapshot
        assert!(first.may_speculate(&reason(7)));
        let second = shared.compilation_log();
        assert!(!second.may_speculate(&reason(7)));
        assert_eq!(shared.failed_count(), 1);
    }
}
