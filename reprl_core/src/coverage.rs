//! Edge-coverage bookkeeping for SanitizerCoverage `trace-pc-guard`
//! instrumentation.
//!
//! The instrumented binary owns a table of 32-bit guards, one per edge, and
//! reports it once at load time. A [`CoverageContext`] numbers the guards,
//! and on every edge hit sets the matching bit in its [`CoverageRegion`] and
//! disarms the guard so further hits on that edge cost a single load until
//! the next [`CoverageContext::reset_edge_guards`].
//!
//! Index 0 is never assigned: two threads racing on a fresh edge may both see
//! the armed guard, and the offline consumer ignores the first edge, so no
//! locking is needed here.

use crate::region::{CoverageRegion, SHM_SIZE};
use std::io;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::info;

/// Environment variable holding the supervisor's shared-memory segment name.
pub const SHM_ID_ENV: &str = "SHM_ID";

/// Number of edge bits the region can hold. Bit 0 is unusable because a zero
/// guard means disarmed, so at most `MAX_EDGES - 1` guards get an index.
pub const MAX_EDGES: usize = (SHM_SIZE - 4) * 8;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Coverage instrumentation is only supported for a single module")]
    MultipleModules,
    #[error("Failed to open shared memory region {key:?}: {source}")]
    ShmOpen {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to mmap shared memory region {key:?}: {source}")]
    Mmap {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("Shared memory key {0:?} contains a NUL byte")]
    InvalidKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Initialized { edges: u32, shared: bool },
    /// Empty range, or a range whose guards were already numbered.
    Skipped,
}

struct Instrumented {
    region: CoverageRegion,
    guards: &'static [AtomicU32],
}

/// Process-lifetime coverage state. Hooks reach the process-wide instance
/// through [`global`]; tests build their own.
pub struct CoverageContext {
    shm_key: Option<String>,
    state: OnceLock<Instrumented>,
}

impl CoverageContext {
    pub fn new(shm_key: Option<String>) -> Self {
        Self {
            shm_key,
            state: OnceLock::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(SHM_ID_ENV).ok())
    }

    pub fn shm_key(&self) -> Option<&str> {
        self.shm_key.as_deref()
    }

    /// Registers the guard table `[start, stop)`, maps the bitmap and numbers
    /// every guard.
    ///
    /// # Safety
    ///
    /// `start..stop` must be a valid, properly aligned `u32` array that lives
    /// for the rest of the process and is only accessed atomically from now on.
    pub unsafe fn initialize(
        &self,
        start: *mut u32,
        stop: *mut u32,
    ) -> Result<InitOutcome, CoverageError> {
        if start.is_null() || start == stop {
            return Ok(InitOutcome::Skipped);
        }
        // SAFETY: non-empty range per the caller's contract.
        let first = unsafe { AtomicU32::from_ptr(start) };
        if first.load(Ordering::Relaxed) != 0 {
            return Ok(InitOutcome::Skipped);
        }
        if self.state.get().is_some() {
            return Err(CoverageError::MultipleModules);
        }

        // SAFETY: both pointers delimit the same table.
        let len = unsafe { stop.offset_from(start) }.max(0) as usize;
        // SAFETY: AtomicU32 has the layout of u32; lifetime per the caller's contract.
        let guards = unsafe { std::slice::from_raw_parts(start.cast::<AtomicU32>(), len) };

        let region = CoverageRegion::open(self.shm_key.as_deref())?;
        let shared = region.is_shared();
        let edges = u32::try_from(len).unwrap_or(u32::MAX);
        self.state
            .set(Instrumented { region, guards })
            .map_err(|_| CoverageError::MultipleModules)?;

        self.reset_edge_guards();
        if let Some(state) = self.state.get() {
            state.region.set_num_edges(edges);
        }
        info!(
            shm_key = ?self.shm_key,
            edges, shared, "edge counters initialized"
        );
        Ok(InitOutcome::Initialized { edges, shared })
    }

    /// Re-arms every guard with its sequential index, `1` upward. Guards past
    /// the bitmap capacity stay disarmed.
    pub fn reset_edge_guards(&self) {
        if let Some(state) = self.state.get() {
            for (guard, index) in state.guards.iter().zip(1..MAX_EDGES as u32) {
                guard.store(index, Ordering::Relaxed);
            }
        }
    }

    /// Records a hit on the edge owning `guard` and disarms it.
    #[inline]
    pub fn record_edge_hit(&self, guard: &AtomicU32) {
        let index = guard.load(Ordering::Relaxed);
        if index == 0 {
            return;
        }
        if let Some(state) = self.state.get() {
            state.region.set_edge(index);
        }
        guard.store(0, Ordering::Relaxed);
    }

    /// Zeroes the bitmap so the next execution reports only its own edges.
    pub fn clear_edges(&self) {
        if let Some(state) = self.state.get() {
            state.region.clear_edges();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    pub fn region(&self) -> Option<&CoverageRegion> {
        self.state.get().map(|state| &state.region)
    }

    pub fn guards(&self) -> &[AtomicU32] {
        self.state.get().map_or(&[], |state| state.guards)
    }
}

impl std::fmt::Debug for CoverageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageContext")
            .field("shm_key", &self.shm_key)
            .field("region", &self.region())
            .field("guards", &self.guards().len())
            .finish()
    }
}

static GLOBAL: OnceLock<CoverageContext> = OnceLock::new();

/// The context the exported sanitizer hooks feed, created from `SHM_ID` on first use.
pub fn global() -> &'static CoverageContext {
    GLOBAL.get_or_init(CoverageContext::from_env)
}

/// Like [`global`] but never creates the context; for the per-edge hot path.
#[inline]
pub fn global_if_present() -> Option<&'static CoverageContext> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_table(len: usize) -> &'static mut [u32] {
        Box::leak(vec![0u32; len].into_boxed_slice())
    }

    fn heap_context(len: usize) -> CoverageContext {
        let ctx = CoverageContext::new(None);
        let range = leaked_table(len).as_mut_ptr_range();
        let outcome = unsafe { ctx.initialize(range.start, range.end) }.unwrap();
        assert_eq!(
            outcome,
            InitOutcome::Initialized {
                edges: len as u32,
                shared: false
            }
        );
        ctx
    }

    fn guard_values(ctx: &CoverageContext) -> Vec<u32> {
        ctx.guards()
            .iter()
            .map(|g| g.load(Ordering::Relaxed))
            .collect()
    }

    #[test]
    fn initialize_without_key_falls_back_to_heap() {
        let ctx = heap_context(16);
        let region = ctx.region().unwrap();
        assert!(!region.is_shared());
        assert_eq!(region.num_edges(), 16);
        assert_eq!(guard_values(&ctx), (1..=16).collect::<Vec<u32>>());
    }

    #[test]
    fn reset_is_idempotent() {
        let ctx = heap_context(32);
        ctx.reset_edge_guards();
        let first = guard_values(&ctx);
        ctx.reset_edge_guards();
        assert_eq!(first, guard_values(&ctx));
        assert_eq!(first, (1..=32).collect::<Vec<u32>>());
    }

    #[test]
    fn hit_is_recorded_once_per_reset() {
        let ctx = heap_context(8);
        let guard = &ctx.guards()[4];
        assert_eq!(guard.load(Ordering::Relaxed), 5);

        ctx.record_edge_hit(guard);
        let region = ctx.region().unwrap();
        assert!(region.is_edge_set(5));
        assert_eq!(region.count_set_edges(), 1);
        assert_eq!(guard.load(Ordering::Relaxed), 0);

        region.clear_edges();
        ctx.record_edge_hit(guard);
        assert_eq!(region.count_set_edges(), 0);

        ctx.reset_edge_guards();
        ctx.record_edge_hit(guard);
        assert!(region.is_edge_set(5));
    }

    #[test]
    fn disarmed_guard_is_ignored() {
        let ctx = CoverageContext::new(None);
        let guard = AtomicU32::new(0);
        ctx.record_edge_hit(&guard);
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn degenerate_and_prenumbered_ranges_are_skipped() {
        let ctx = CoverageContext::new(None);
        let table = leaked_table(4);
        let start = table.as_mut_ptr();
        assert_eq!(
            unsafe { ctx.initialize(start, start) }.unwrap(),
            InitOutcome::Skipped
        );

        table[0] = 1;
        let range = table.as_mut_ptr_range();
        assert_eq!(
            unsafe { ctx.initialize(range.start, range.end) }.unwrap(),
            InitOutcome::Skipped
        );
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn second_module_is_rejected() {
        let ctx = heap_context(4);
        let other = leaked_table(4).as_mut_ptr_range();
        let err = unsafe { ctx.initialize(other.start, other.end) }.unwrap_err();
        assert!(matches!(err, CoverageError::MultipleModules));
    }

    #[test]
    fn same_module_registered_twice_is_a_no_op() {
        let ctx = CoverageContext::new(None);
        let range = leaked_table(4).as_mut_ptr_range();
        unsafe { ctx.initialize(range.start, range.end) }.unwrap();
        assert_eq!(
            unsafe { ctx.initialize(range.start, range.end) }.unwrap(),
            InitOutcome::Skipped
        );
    }

    #[test]
    fn guards_past_capacity_stay_disarmed() {
        let ctx = heap_context(MAX_EDGES + 2);
        let guards = ctx.guards();
        assert_eq!(guards[0].load(Ordering::Relaxed), 1);
        assert_eq!(
            guards[MAX_EDGES - 2].load(Ordering::Relaxed),
            MAX_EDGES as u32 - 1
        );
        assert_eq!(guards[MAX_EDGES - 1].load(Ordering::Relaxed), 0);
        assert_eq!(guards[MAX_EDGES + 1].load(Ordering::Relaxed), 0);

        ctx.record_edge_hit(&guards[MAX_EDGES - 2]);
        assert!(ctx.region().unwrap().is_edge_set(MAX_EDGES as u32 - 1));
    }

    #[test]
    fn missing_segment_fails_initialization() {
        let ctx = CoverageContext::new(Some("/reprl-core-no-such-segment".to_string()));
        let range = leaked_table(4).as_mut_ptr_range();
        let err = unsafe { ctx.initialize(range.start, range.end) }.unwrap_err();
        assert!(matches!(err, CoverageError::ShmOpen { .. }));
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn independent_contexts_do_not_share_bitmaps() {
        let a = heap_context(4);
        let b = heap_context(4);
        a.record_edge_hit(&a.guards()[0]);
        assert!(a.region().unwrap().is_edge_set(1));
        assert!(!b.region().unwrap().is_edge_set(1));
    }
}
