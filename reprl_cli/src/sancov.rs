//! SanitizerCoverage `trace-pc-guard` callbacks.
//!
//! The compiler pass calls these from every instrumented edge of the Lua C
//! sources. They forward to the process-wide [`reprl_core::coverage`] context.
//! The Rust code itself must not be built with the pass, or the hooks would
//! instrument themselves.

use reprl_core::coverage::{self, InitOutcome};
use std::sync::atomic::AtomicU32;

/// Runs from a load-time constructor, before `main` and before logging is set
/// up, so failures go straight to stderr and end the process.
///
/// # Safety
///
/// Must only be called by the instrumentation with its own guard section.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard_init(start: *mut u32, stop: *mut u32) {
    // SAFETY: the guard section is a static u32 array that outlives the process
    // and is only touched through these hooks afterwards.
    match unsafe { coverage::global().initialize(start, stop) } {
        Ok(InitOutcome::Initialized { .. } | InitOutcome::Skipped) => {}
        Err(e) => {
            eprintln!("[COV] {e}");
            std::process::exit(-1);
        }
    }
}

/// # Safety
///
/// `guard` must point into the section registered through
/// [`__sanitizer_cov_trace_pc_guard_init`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __sanitizer_cov_trace_pc_guard(guard: *mut u32) {
    if let Some(ctx) = coverage::global_if_present() {
        // SAFETY: per the contract above the guard is live, aligned and only
        // accessed atomically.
        ctx.record_edge_hit(unsafe { AtomicU32::from_ptr(guard) });
    }
}
