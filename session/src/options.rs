// Names the `clap::Args` derive expects from the standard prelude
#[cfg(feature = "std")]
#[allow(unused_imports)]
use std::{
    borrow::ToOwned,
    boxed::Box,
    format,
    string::{String, ToString},
    vec,
    vec::Vec,
};

/// The set of knobs which control the loop and guard optimization pipeline.
///
/// Every threshold and iteration cap used by a phase or policy is read from here, rather than
/// from global state, so that two compilations with different options can never observe each
/// other's configuration.
///
/// When the `std` feature is enabled, this type can be flattened into a `clap` command, exposing
/// each option as a long flag.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(clap::Args))]
pub struct Options {
    /// Peel the first iteration of hot loops
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Loops"
    ))]
    pub loop_peeling: bool,
    /// The maximum number of passes the peeling phase makes over the loops of a graph
    #[cfg_attr(feature = "std", arg(long, default_value_t = 2, help_heading = "Loops"))]
    pub peeling_iterations: usize,
    /// Loops whose body is larger than this many nodes are never peeled
    #[cfg_attr(feature = "std", arg(long, default_value_t = 200, help_heading = "Loops"))]
    pub peeling_max_nodes: usize,
    /// The maximum number of times a single loop may be peeled
    #[cfg_attr(feature = "std", arg(long, default_value_t = 1, help_heading = "Loops"))]
    pub max_peel_count: u32,
    /// Split counted loops into pre/main/post loops and unroll the main loop
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Loops"
    ))]
    pub partial_unroll: bool,
    /// The number of body copies in an unrolled main loop
    #[cfg_attr(feature = "std", arg(long, default_value_t = 4, help_heading = "Loops"))]
    pub unroll_factor: u32,
    /// Loops whose body is larger than this many nodes are never partially unrolled
    #[cfg_attr(feature = "std", arg(long, default_value_t = 200, help_heading = "Loops"))]
    pub partial_unroll_max_nodes: usize,
    /// Completely unroll counted loops with a small constant trip count
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Loops"
    ))]
    pub full_unroll: bool,
    /// The largest constant trip count eligible for full unrolling
    #[cfg_attr(feature = "std", arg(long, default_value_t = 8, help_heading = "Loops"))]
    pub full_unroll_max_iterations: u64,
    /// The largest fully unrolled code size, in nodes (body size times trip count)
    #[cfg_attr(feature = "std", arg(long, default_value_t = 400, help_heading = "Loops"))]
    pub full_unroll_max_nodes: usize,
    /// Hoist loop-invariant branches out of loops by duplicating the loop
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Loops"
    ))]
    pub loop_unswitch: bool,
    /// The maximum number of times a single loop may be unswitched
    #[cfg_attr(feature = "std", arg(long, default_value_t = 2, help_heading = "Loops"))]
    pub max_unswitches: u32,
    /// Loops whose body is larger than this many nodes are never unswitched
    #[cfg_attr(feature = "std", arg(long, default_value_t = 300, help_heading = "Loops"))]
    pub unswitch_max_nodes: usize,
    /// Replace in-loop range checks with checks of the loop's first and last index
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Guards"
    ))]
    pub loop_predication: bool,
    /// Speculatively hoist guards out of loops
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Guards"
    ))]
    pub speculative_guard_movement: bool,
    /// The maximum number of outer iterations of speculative guard movement
    #[cfg_attr(feature = "std", arg(long, default_value_t = 3, help_heading = "Guards"))]
    pub guard_movement_iterations: usize,
    /// Hoist guards even into blocks that execute more often than their current block
    #[cfg_attr(feature = "std", arg(long, default_value_t = false, help_heading = "Guards"))]
    pub ignore_guard_movement_frequency: bool,
    /// Allow creating loop-limit guards which protect counted loops from counter overflow
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Guards"
    ))]
    pub use_loop_limit_checks: bool,
    /// Once a method has deoptimized this many times on loop-limit checks, stop emitting them
    #[cfg_attr(feature = "std", arg(long, default_value_t = 4, help_heading = "Guards"))]
    pub max_loop_limit_check_deopts: u32,
    /// Remove safepoint polls from loops which are guaranteed to poll elsewhere, or run briefly
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Safepoints"
    ))]
    pub safepoint_elimination: bool,
    /// Remove safepoint polls from short-running leaf loops, even without a call in the loop
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Safepoints"
    ))]
    pub optimistic_safepoint_elimination: bool,
    /// Verify the graph after every phase
    #[cfg_attr(feature = "std", arg(
        long,
        default_value_t = cfg!(debug_assertions),
        action = clap::ArgAction::Set,
        help_heading = "Diagnostics"
    ))]
    pub verify_graphs: bool,
    /// Log the textual form of the graph after every phase, at trace level
    #[cfg_attr(feature = "std", arg(long, default_value_t = false, help_heading = "Diagnostics"))]
    pub dump_graphs: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            loop_peeling: true,
            peeling_iterations: 2,
            peeling_max_nodes: 200,
            max_peel_count: 1,
            partial_unroll: true,
            unroll_factor: 4,
            partial_unroll_max_nodes: 200,
            full_unroll: true,
            full_unroll_max_iterations: 8,
            full_unroll_max_nodes: 400,
            loop_unswitch: true,
            max_unswitches: 2,
            unswitch_max_nodes: 300,
            loop_predication: true,
            speculative_guard_movement: true,
            guard_movement_iterations: 3,
            ignore_guard_movement_frequency: false,
            use_loop_limit_checks: true,
            max_loop_limit_check_deopts: 4,
            safepoint_elimination: true,
            optimistic_safepoint_elimination: true,
            verify_graphs: cfg!(debug_assertions),
            dump_graphs: false,
        }
    }
}

impl Options {
    /// Options with every optional transformation disabled.
    ///
    /// Useful as a starting point when exercising a single phase in isolation.
    pub fn none() -> Self {
        Self {
            loop_peeling: false,
            partial_unroll: false,
            full_unroll: false,
            loop_unswitch: false,
            loop_predication: false,
            speculative_guard_movement: false,
            safepoint_elimination: false,
            ..Self::default()
        }
    }

    pub fn set_loop_peeling(&mut self, yes: bool) -> &mut Self {
        self.loop_peeling = yes;
        self
    }

    pub fn set_partial_unroll(&mut self, yes: bool) -> &mut Self {
        self.partial_unroll = yes;
        self
    }

    pub fn set_unroll_factor(&mut self, factor: u32) -> &mut Self {
        self.unroll_factor = factor;
        self
    }

    pub fn set_full_unroll(&mut self, yes: bool) -> &mut Self {
        self.full_unroll = yes;
        self
    }

    pub fn set_loop_unswitch(&mut self, yes: bool) -> &mut Self {
        self.loop_unswitch = yes;
        self
    }

    pub fn set_loop_predication(&mut self, yes: bool) -> &mut Self {
        self.loop_predication = yes;
        self
    }

    pub fn set_speculative_guard_movement(&mut self, yes: bool) -> &mut Self {
        self.speculative_guard_movement = yes;
        self
    }

    pub fn set_ignore_guard_movement_frequency(&mut self, yes: bool) -> &mut Self {
        self.ignore_guard_movement_frequency = yes;
        self
    }

    pub fn set_safepoint_elimination(&mut self, yes: bool) -> &mut Self {
        self.safepoint_elimination = yes;
        self
    }

    pub fn set_verify_graphs(&mut self, yes: bool) -> &mut Self {
        self.verify_graphs = yes;
        self
    }

    /// Returns true if loop-limit guards may be created, given the number of times this method
    /// has already deoptimized because of one.
    #[inline]
    pub const fn allows_loop_limit_checks(&self, deopt_count: u32) -> bool {
        self.use_loop_limit_checks && deopt_count < self.max_loop_limit_check_deopts
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_caps() {
        let options = Options::default();
        assert_eq!(options.guard_movement_iterations, 3);
        assert_eq!(options.peeling_iterations, 2);
        assert!(!options.ignore_guard_movement_frequency);
    }

    #[test]
    fn none_keeps_thresholds() {
        let options = Options::none();
        assert!(!options.loop_peeling);
        assert!(!options.speculative_guard_movement);
        assert_eq!(options.unroll_factor, Options::default().unroll_factor);
    }

    #[test]
    fn loop_limit_checks_respect_deopt_budget() {
        let mut options = Options::default();
        assert!(options.allows_loop_limit_checks(0));
        assert!(!options.allows_loop_limit_checks(options.max_loop_limit_check_deopts));
        options.use_loop_limit_checks = false;
        assert!(!options.allows_loop_limit_checks(0));
    }

    #[cfg(feature = "std")]
    #[test]
    fn flags_default_to_options_default() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            options: Options,
        }

        let cli = Cli::parse_from(["seajit"]);
        assert_eq!(cli.options, Options::default());

        let cli = Cli::parse_from(["seajit", "--loop-peeling", "false", "--unroll-factor", "8"]);
        assert!(!cli.options.loop_peeling);
        assert_eq!(cli.options.unroll_factor, 8);
    }
}
