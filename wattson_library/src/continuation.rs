use crate::transaction::{TransactionId, INTERRUPT_TID};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use tracing::{debug, error, info, warn};

lazy_static::lazy_static! {
  /// A global static [Continuation] struct to enable proper exiting by informing background threads of an exit signal
  pub static ref GLOB_CONT_CHECK: Continuation = Continuation::new();
}

/// Exit code used after flushing on an interrupt, matching a shell's 128 + SIGINT.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

type FlushHook = Box<dyn Fn(&TransactionId) + Send + Sync>;

/// Tracks whether the process is shutting down and which partial results must be flushed first.
/// Sampler threads loop on `check_continue`; sessions register a flush hook for the lifetime of a measurement.
pub struct Continuation {
    signal: RwLock<bool>,
    hooks: Mutex<BTreeMap<u64, FlushHook>>,
    next_hook: AtomicU64,
}

/// Unregisters its flush hook when dropped.
pub struct FlushGuard<'a> {
    owner: &'a Continuation,
    id: u64,
}
impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.owner.hooks.lock().remove(&self.id);
    }
}

impl Continuation {
    fn new() -> Self {
        Continuation {
            signal: RwLock::new(true),
            hooks: Mutex::new(BTreeMap::new()),
            next_hook: AtomicU64::new(0),
        }
    }

    /// Signal background threads to exit and run every registered flush hook once.
    pub fn signal_application_exit(&self, tid: &TransactionId) {
        *self.signal.write() = false;
        info!(tid = tid, "Signalling application exit");
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (id, hook) in hooks {
            debug!(tid = tid, hook = id, "Running flush hook");
            hook(tid);
        }
    }

    /// Register a closure to run if the process is interrupted.
    pub fn register_flush(&self, hook: FlushHook) -> FlushGuard<'_> {
        let id = self.next_hook.fetch_add(1, Ordering::Relaxed);
        self.hooks.lock().insert(id, hook);
        FlushGuard { owner: self, id }
    }

    /// Returns true if the application should continue running
    /// If false, then background threads need to exit
    pub fn check_continue(&self) -> bool {
        *self.signal.read()
    }
}

static HANDLER: Once = Once::new();

/// Route SIGINT/SIGTERM into [Continuation::signal_application_exit], then exit.
/// Safe to call repeatedly; only the first call installs anything.
/// If the host application already owns those signals, a warning is logged and its handler is left alone.
pub fn install_interrupt_handler(tid: &TransactionId) {
    HANDLER.call_once(|| {
        let res = ctrlc::set_handler(|| {
            GLOB_CONT_CHECK.signal_application_exit(&INTERRUPT_TID);
            std::process::exit(INTERRUPT_EXIT_CODE);
        });
        match res {
            Ok(_) => debug!(tid = tid, "Interrupt handler installed"),
            Err(ctrlc::Error::MultipleHandlers) => {
                warn!(tid = tid, "Signal handler already present, partial results will not be flushed on interrupt")
            },
            Err(e) => error!(tid=tid, error=%e, "Failed to install interrupt handler"),
        }
    });
}
