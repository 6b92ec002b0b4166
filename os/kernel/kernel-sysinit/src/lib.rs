//! # Init-step sequencer
//!
//! A dependency-ordered registry of kernel bring-up steps, built on
//! [`linkme::distributed_slice`] so every step is registered at its
//! definition site (a `#[distributed_slice(SYSINIT_STEPS)]` static) rather
//! than threaded through a hand-maintained call list in `main`/`init`.
//!
//! Steps are grouped into modules (a bitmask, so a step can belong to more
//! than one) and declare a `depends_mask` of modules that must have
//! finished before they run. [`SysinitModule::EARLY`] is an implicit
//! prerequisite of every step except itself; [`SysinitModule::LATE`]
//! implicitly depends on every other *step*, including steps that belong
//! to no named module at all. [`sys_init`] runs every registered step
//! exactly once, in an order satisfying those dependencies, and returns
//! whether any `warn_on_fail` step failed.
//!
//! A step that is *not* `warn_on_fail` and fails is treated as fatal and
//! panics immediately — this mirrors the source convention that most
//! bring-up steps (page tables, the PFA, the scheduler) have no fallback.

#![cfg_attr(not(any(test, doctest)), no_std)]

use bitflags::bitflags;
pub use linkme::distributed_slice;
use log::{trace, warn};

bitflags! {
    /// Which bring-up module(s) a step belongs to / depends on.
    ///
    /// This is a 64-bit mask so a step may belong to more than one module,
    /// and the scheduler can track "which modules are fully done" as a
    /// single word. [`EARLY`](Self::EARLY) and [`LATE`](Self::LATE) are
    /// reserved; every other bit is free for callers to assign their own
    /// module identities.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SysinitModule: u64 {
        /// Implicit prerequisite of every other step.
        const EARLY = 1 << 0;
        /// Implicitly depends on every other module.
        const LATE = 1 << 1;
    }
}

/// A single registered bring-up step.
pub struct InitStep {
    /// Module(s) this step belongs to.
    pub module_mask: SysinitModule,
    /// Module(s) that must be fully complete before this step runs.
    pub depends_mask: SysinitModule,
    /// Name printed in bring-up diagnostics.
    pub name: &'static str,
    /// The step itself.
    pub step: fn() -> Result<(), &'static str>,
    /// If `true`, a failing step only produces a warning; if `false`, a
    /// failing step is fatal and panics.
    pub warn_on_fail: bool,
}

/// The linker-set-style registry of all init steps in the binary.
///
/// Populate with `#[distributed_slice(SYSINIT_STEPS)] static X: InitStep = InitStep { .. };`
/// at each step's definition site.
#[linkme::distributed_slice]
pub static SYSINIT_STEPS: [InitStep] = [..];

/// Maximum number of init steps this scheduler supports (bounded by the
/// `u64` bitmask it tracks "already executed" steps with).
pub const MAX_STEPS: usize = 64;

/// Run every registered step once, in dependency order.
///
/// Returns `true` if at least one `warn_on_fail` step failed.
///
/// # Panics
/// - If more than [`MAX_STEPS`] steps are registered.
/// - If a non-`warn_on_fail` step returns `Err`.
/// - If the registered steps' `depends_mask`/`module_mask` values form a
///   cycle (no step is ever runnable, and progress stalls).
pub fn sys_init() -> bool {
    let steps = &*SYSINIT_STEPS;
    let n = steps.len();
    assert!(n <= MAX_STEPS, "sysinit: {n} steps registered, exceeds MAX_STEPS={MAX_STEPS}");

    let mut executed: u64 = 0;
    let mut any_warned = false;
    let all_mask: u64 = if n == MAX_STEPS { u64::MAX } else { (1u64 << n) - 1 };

    // Steps that do not themselves belong to LATE. A LATE step depends on
    // every *step*, not on every named module — a step with an empty
    // `module_mask` belongs to no module and would otherwise be invisible
    // to a module-union-based readiness check.
    let mut non_late_mask: u64 = 0;
    for (i, s) in steps.iter().enumerate() {
        if !s.module_mask.contains(SysinitModule::LATE) {
            non_late_mask |= 1 << i;
        }
    }

    while executed != all_mask {
        let mut remaining_modules = SysinitModule::empty();
        for (i, s) in steps.iter().enumerate() {
            if executed & (1 << i) == 0 {
                remaining_modules |= s.module_mask;
            }
        }

        let mut progressed = false;
        for (i, s) in steps.iter().enumerate() {
            if executed & (1 << i) != 0 {
                continue;
            }

            let is_late = s.module_mask.contains(SysinitModule::LATE);
            if is_late && (executed & non_late_mask) != non_late_mask {
                // LATE implicitly depends on every non-LATE step index.
                continue;
            }

            let mut required = s.depends_mask;
            if !s.module_mask.contains(SysinitModule::EARLY) {
                required |= SysinitModule::EARLY;
            }
            let still_pending = required & remaining_modules;
            if !still_pending.is_empty() && !(is_late && still_pending == SysinitModule::LATE) {
                continue;
            }

            trace!("sysinit: running step \"{}\"", s.name);
            if let Err(msg) = (s.step)() {
                if s.warn_on_fail {
                    warn!("sysinit: step \"{}\" failed: {msg}", s.name);
                    any_warned = true;
                } else {
                    panic!("sysinit: fatal failure in step \"{}\": {msg}", s.name);
                }
            }
            executed |= 1 << i;
            progressed = true;
        }

        assert!(
            progressed,
            "sysinit: no runnable step among the {} remaining — dependency cycle?",
            n - executed.count_ones() as usize
        );
    }

    any_warned
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static ORDER: AtomicU32 = AtomicU32::new(0);
    static EARLY_SLOT: AtomicU32 = AtomicU32::new(0);
    static MID_SLOT: AtomicU32 = AtomicU32::new(0);
    static LATE_SLOT: AtomicU32 = AtomicU32::new(0);

    fn early_step() -> Result<(), &'static str> {
        EARLY_SLOT.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn mid_step() -> Result<(), &'static str> {
        MID_SLOT.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn late_step() -> Result<(), &'static str> {
        LATE_SLOT.store(ORDER.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    #[test]
    fn runs_early_before_mid_before_late() {
        let steps = [
            InitStep {
                module_mask: SysinitModule::LATE,
                depends_mask: SysinitModule::empty(),
                name: "late",
                step: late_step,
                warn_on_fail: false,
            },
            InitStep {
                module_mask: SysinitModule::empty(),
                depends_mask: SysinitModule::empty(),
                name: "mid",
                step: mid_step,
                warn_on_fail: false,
            },
            InitStep {
                module_mask: SysinitModule::EARLY,
                depends_mask: SysinitModule::empty(),
                name: "early",
                step: early_step,
                warn_on_fail: false,
            },
        ];

        run_order_for_test(&steps);

        let early = EARLY_SLOT.load(Ordering::SeqCst);
        let mid = MID_SLOT.load(Ordering::SeqCst);
        let late = LATE_SLOT.load(Ordering::SeqCst);
        assert!(early < mid, "early must run before mid");
        assert!(mid < late, "mid must run before late");
    }

    #[test]
    fn warn_on_fail_step_is_recorded_but_not_fatal() {
        fn failing() -> Result<(), &'static str> {
            Err("synthetic failure")
        }
        let steps = [InitStep {
            module_mask: SysinitModule::empty(),
            depends_mask: SysinitModule::empty(),
            name: "flaky",
            step: failing,
            warn_on_fail: true,
        }];
        assert!(run_order_for_test(&steps));
    }

    /// Test-only re-implementation of [`sys_init`]'s scheduling loop over a
    /// caller-supplied step list, since the real [`SYSINIT_STEPS`] slice is
    /// process-global and shared across the whole binary.
    fn run_order_for_test(steps: &[InitStep]) -> bool {
        let n = steps.len();
        let mut executed: u64 = 0;
        let mut any_warned = false;
        let all_mask: u64 = (1u64 << n) - 1;

        let mut non_late_mask: u64 = 0;
        for (i, s) in steps.iter().enumerate() {
            if !s.module_mask.contains(SysinitModule::LATE) {
                non_late_mask |= 1 << i;
            }
        }

        while executed != all_mask {
            let mut remaining_modules = SysinitModule::empty();
            for (i, s) in steps.iter().enumerate() {
                if executed & (1 << i) == 0 {
                    remaining_modules |= s.module_mask;
                }
            }
            let mut progressed = false;
            for (i, s) in steps.iter().enumerate() {
                if executed & (1 << i) != 0 {
                    continue;
                }
                let is_late = s.module_mask.contains(SysinitModule::LATE);
                if is_late && (executed & non_late_mask) != non_late_mask {
                    continue;
                }
                let mut required = s.depends_mask;
                if !s.module_mask.contains(SysinitModule::EARLY) {
                    required |= SysinitModule::EARLY;
                }
                let still_pending = required & remaining_modules;
                if !still_pending.is_empty() && !(is_late && still_pending == SysinitModule::LATE) {
                    continue;
                }
                if let Err(_msg) = (s.step)() {
                    if s.warn_on_fail {
                        any_warned = true;
                    } else {
                        panic!("fatal step failure in test");
                    }
                }
                executed |= 1 << i;
                progressed = true;
            }
            assert!(progressed, "no runnable step among the remaining — dependency cycle?");
        }
        any_warned
    }
}
