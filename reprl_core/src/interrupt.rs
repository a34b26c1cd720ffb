//! Cooperative cancellation of running chunks.
//!
//! Nothing here touches an interpreter from a signal handler. A SIGINT only
//! flips an [`InterruptToken`]; the VM hook installed by
//! [`crate::interp::LuaSession::install_interrupt`] notices it at the next
//! check and raises `interrupted!` inside the chunk.

use signal_hook::SigId;
use signal_hook::consts::SIGINT;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit status used when a second SIGINT arrives before the first was handled.
pub const SIGINT_EXIT_STATUS: i32 = 130;

#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Consumes a pending cancellation.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Routes SIGINT to a token while alive. A second SIGINT that arrives while
/// the token is still set terminates the process.
#[derive(Debug)]
pub struct SigintGuard {
    ids: Vec<SigId>,
}

impl SigintGuard {
    pub fn install(token: &InterruptToken) -> io::Result<Self> {
        let shutdown = signal_hook::flag::register_conditional_shutdown(
            SIGINT,
            SIGINT_EXIT_STATUS,
            Arc::clone(&token.flag),
        )?;
        let set = match signal_hook::flag::register(SIGINT, Arc::clone(&token.flag)) {
            Ok(id) => id,
            Err(e) => {
                signal_hook::low_level::unregister(shutdown);
                return Err(e);
            }
        };
        Ok(Self {
            ids: vec![shutdown, set],
        })
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
