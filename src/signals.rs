//! Signal handling for the reaper.
//!
//! SIGINT, SIGQUIT and SIGTERM are masked while the reaper starts waiting so a
//! stray Ctrl-C cannot cut the shutdown short. Once a phase has waited long
//! enough they are unmasked and routed to a handler that only clears the
//! `keep_waiting` flag; the wait loop notices it on its next poll.
use nix::libc::c_int;
use nix::sys::signal::{
    self, pthread_sigmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};

/// Signals that interrupt the wait once they are enabled.
pub const INTERRUPT_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM];

/// Process-wide state written by the signal handler.
static SIGNAL_STATE: SignalState = SignalState::new();

/// Flags shared between the wait loop and the signal handler.
///
/// Each field only ever moves in one direction during a run, so plain atomic
/// loads and stores are enough; no lock is taken anywhere.
#[derive(Debug)]
pub struct SignalState {
    signals_enabled: AtomicBool,
    keep_waiting: AtomicBool,
    keep_waiting_notified: AtomicBool,
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            signals_enabled: AtomicBool::new(false),
            keep_waiting: AtomicBool::new(true),
            keep_waiting_notified: AtomicBool::new(false),
        }
    }

    /// The instance the installed signal handler writes to.
    pub fn global() -> &'static SignalState {
        &SIGNAL_STATE
    }

    /// Return to the start-of-run state.
    pub fn reset(&self) {
        self.signals_enabled.store(false, Ordering::SeqCst);
        self.keep_waiting.store(true, Ordering::SeqCst);
        self.keep_waiting_notified.store(false, Ordering::SeqCst);
    }

    pub fn signals_enabled(&self) -> bool {
        self.signals_enabled.load(Ordering::SeqCst)
    }

    /// Flip `signals_enabled` to true. Returns false if it already was.
    pub fn enable_signals(&self) -> bool {
        self.signals_enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn keep_waiting(&self) -> bool {
        self.keep_waiting.load(Ordering::SeqCst)
    }

    /// Request cancellation. Async-signal-safe: a single atomic store.
    pub fn stop_waiting(&self) {
        self.keep_waiting.store(false, Ordering::SeqCst);
    }

    /// Mark the interruption as reported. Returns true only the first time.
    pub fn notify_interrupted(&self) -> bool {
        !self.keep_waiting_notified.swap(true, Ordering::SeqCst)
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal delivery used by the reaper.
pub trait Signaller {
    /// Send SIGTERM to `pid`.
    fn terminate(&self, pid: i32) -> nix::Result<()>;

    /// Install the cancellation handler and unmask the interrupt signals.
    fn enable_interrupts(&self) -> nix::Result<()>;
}

/// Real signal delivery through `nix`. The handler writes to [`SignalState::global`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl NixSignaller {
    /// Block the interrupt signals for the calling thread (the reaper is single-threaded).
    pub fn mask_interrupts() -> nix::Result<()> {
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&interrupt_set()), None)
    }
}

impl Signaller for NixSignaller {
    fn terminate(&self, pid: i32) -> nix::Result<()> {
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
    }

    fn enable_interrupts(&self) -> nix::Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(stop_process_waiting),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in INTERRUPT_SIGNALS {
            // SAFETY: the handler only performs an atomic store.
            unsafe { signal::sigaction(sig, &action) }?;
        }

        pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&interrupt_set()), None)
    }
}

fn interrupt_set() -> SigSet {
    let mut set = SigSet::empty();
    for sig in INTERRUPT_SIGNALS {
        set.add(sig);
    }
    set
}

/// No logging or allocation here; the wait loop reports the interruption.
extern "C" fn stop_process_waiting(_signum: c_int) {
    SIGNAL_STATE.stop_waiting();
}
