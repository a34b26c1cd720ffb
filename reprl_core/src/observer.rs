use crate::coverage::CoverageContext;
use crate::executor::ExecutionStatus;
use std::time::{Duration, Instant};
use tracing::info;

/// An `Observer` watches each iteration of the persistent loop.
///
/// The driver calls `pre_exec` after a payload has been received and before it
/// runs, and `post_exec` once its status has been sent back. Anything that must
/// be reset between iterations, or measured across them, hangs off these two
/// hooks.
pub trait Observer {
    /// Identifies the observer in error reports.
    fn name(&self) -> &'static str;

    /// Called immediately before the payload executes.
    ///
    /// # Returns
    /// `Ok(())` on success. An error stops the loop.
    fn pre_exec(&mut self) -> Result<(), anyhow::Error>;

    /// Called after the status word for the iteration has been written.
    ///
    /// # Arguments
    /// * `status`: what the payload did.
    fn post_exec(&mut self, status: &ExecutionStatus) -> Result<(), anyhow::Error>;
}

/// Keeps the coverage bitmap scoped to a single payload: bits are cleared
/// before it runs and guards are re-armed after the supervisor has been told
/// the result, so the supervisor never reads a half-cleared bitmap.
#[derive(Debug, Clone, Copy)]
pub struct CoverageObserver<'a> {
    context: &'a CoverageContext,
}

impl<'a> CoverageObserver<'a> {
    pub fn new(context: &'a CoverageContext) -> Self {
        Self { context }
    }
}

impl Observer for CoverageObserver<'_> {
    fn name(&self) -> &'static str {
        "CoverageObserver"
    }

    fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
        self.context.clear_edges();
        Ok(())
    }

    fn post_exec(&mut self, _status: &ExecutionStatus) -> Result<(), anyhow::Error> {
        self.context.reset_edge_guards();
        Ok(())
    }
}

/// Counts executions and logs a progress line every `interval` of them.
#[derive(Debug)]
pub struct ThroughputObserver {
    interval: u64,
    executions: u64,
    failures: u64,
    started: Instant,
}

impl ThroughputObserver {
    /// `interval == 0` counts without logging.
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            executions: 0,
            failures: 0,
            started: Instant::now(),
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn execs_per_sec(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.executions as f64 / secs
        } else {
            0.0
        }
    }
}

impl Observer for ThroughputObserver {
    fn name(&self) -> &'static str {
        "ThroughputObserver"
    }

    fn pre_exec(&mut self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn post_exec(&mut self, status: &ExecutionStatus) -> Result<(), anyhow::Error> {
        self.executions += 1;
        if !status.is_ok() {
            self.failures += 1;
        }
        if self.interval > 0 && self.executions % self.interval == 0 {
            let elapsed = self.started.elapsed();
            info!(
                executions = self.executions,
                failures = self.failures,
                execs_per_sec = format_args!("{:.2}", self.execs_per_sec(elapsed)),
                "progress"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn coverage_observer_scopes_bitmap_to_one_iteration() {
        let ctx = CoverageContext::new(None);
        let table = Box::leak(vec![0u32; 4].into_boxed_slice()).as_mut_ptr_range();
        unsafe { ctx.initialize(table.start, table.end) }.unwrap();
        let mut observer = CoverageObserver::new(&ctx);

        observer.pre_exec().unwrap();
        ctx.record_edge_hit(&ctx.guards()[1]);
        assert!(ctx.region().unwrap().is_edge_set(2));
        assert_eq!(ctx.guards()[1].load(Ordering::Relaxed), 0);

        observer.post_exec(&ExecutionStatus::Ok).unwrap();
        assert_eq!(ctx.guards()[1].load(Ordering::Relaxed), 2);
        assert!(ctx.region().unwrap().is_edge_set(2));

        observer.pre_exec().unwrap();
        assert_eq!(ctx.region().unwrap().count_set_edges(), 0);
    }

    #[test]
    fn coverage_observer_tolerates_uninstrumented_builds() {
        let ctx = CoverageContext::new(None);
        let mut observer = CoverageObserver::new(&ctx);
        observer.pre_exec().unwrap();
        observer.post_exec(&ExecutionStatus::Ok).unwrap();
        assert!(!ctx.is_initialized());
    }

    #[test]
    fn throughput_observer_counts_failures() {
        let mut observer = ThroughputObserver::new(2);
        observer.post_exec(&ExecutionStatus::Ok).unwrap();
        observer
            .post_exec(&ExecutionStatus::RuntimeError("boom".to_string()))
            .unwrap();
        observer
            .post_exec(&ExecutionStatus::SyntaxError("eof".to_string()))
            .unwrap();
        assert_eq!(observer.executions(), 3);
        assert_eq!(observer.failures(), 2);
    }

    #[test]
    fn execs_per_sec_handles_zero_elapsed() {
        let observer = ThroughputObserver::new(0);
        assert_eq!(observer.execs_per_sec(Duration::ZERO), 0.0);
    }
}
