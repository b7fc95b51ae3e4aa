//! Two-phase shutdown of a container's leftover processes.
//!
//! Phase one waits for processes to exit on their own. Phase two sends each
//! survivor SIGTERM once and waits again. Whatever is still alive afterwards
//! is reported and left for the container teardown to kill. The wrapped
//! command's exit code is passed through untouched in every case.
use crate::procfs::{format_table, ProcessLister, ProcessTable};
use crate::schedule::{PhaseDuration, ShutdownSchedule, WaitPhase};
use crate::signals::{SignalState, Signaller};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Poll cadence and escalation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperTimings {
    /// Sleep between scans early in a phase.
    pub fast_tick: Duration,
    /// Sleep between scans once `throttle_after` has passed.
    pub slow_tick: Duration,
    pub throttle_after: Duration,
    /// How long a phase waits before warning and enabling interrupt signals.
    pub signal_enable_after: Duration,
}

impl Default for ReaperTimings {
    fn default() -> Self {
        Self {
            fast_tick: Duration::from_millis(10),
            slow_tick: Duration::from_millis(500),
            throttle_after: Duration::from_secs(2),
            signal_enable_after: Duration::from_secs(10),
        }
    }
}

/// How a wait phase ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Nothing left to wait for.
    AllExited,
    /// The phase duration elapsed with these processes still alive.
    TimedOut(ProcessTable),
    /// Cancellation was requested with these processes still alive.
    Interrupted(ProcessTable),
}

impl PhaseOutcome {
    fn survivors(self) -> ProcessTable {
        match self {
            PhaseOutcome::AllExited => ProcessTable::new(),
            PhaseOutcome::TimedOut(table) | PhaseOutcome::Interrupted(table) => table,
        }
    }
}

pub struct Reaper<'a, L, S> {
    lister: &'a L,
    signaller: &'a S,
    state: &'a SignalState,
    timings: ReaperTimings,
    own_pid: i32,
}

impl<'a, L: ProcessLister, S: Signaller> Reaper<'a, L, S> {
    pub fn new(lister: &'a L, signaller: &'a S, state: &'a SignalState) -> Self {
        Self {
            lister,
            signaller,
            state,
            timings: ReaperTimings::default(),
            own_pid: std::process::id() as i32,
        }
    }

    pub fn with_timings(mut self, timings: ReaperTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Pid excluded from scans as "ourselves".
    #[cfg(test)]
    fn with_own_pid(mut self, pid: i32) -> Self {
        self.own_pid = pid;
        self
    }

    /// Run both phases, report leftovers and hand back `exit_code` unchanged.
    pub fn reap(&self, schedule: &ShutdownSchedule, exit_code: i32) -> i32 {
        let left_running = self.run(schedule);

        if !left_running.is_empty() {
            tracing::warn!(
                "{} processes were left running!\n{}",
                left_running.len(),
                format_table(&left_running)
            );
        }

        exit_code
    }

    /// Run both phases and return the processes still alive at the end.
    pub fn run(&self, schedule: &ShutdownSchedule) -> ProcessTable {
        tracing::debug!("Wait times are {schedule}");

        tracing::info!("Waiting for processes to exit");
        let natural = self.wait_for_processes(
            WaitPhase::NaturalExit,
            schedule.duration(WaitPhase::NaturalExit),
        );

        match natural {
            PhaseOutcome::AllExited => ProcessTable::new(),
            PhaseOutcome::Interrupted(survivors) => survivors,
            PhaseOutcome::TimedOut(_) => {
                tracing::info!("Sending all processes SIGTERM");
                self.wait_for_processes(
                    WaitPhase::Terminate,
                    schedule.duration(WaitPhase::Terminate),
                )
                .survivors()
            }
        }
    }

    /// Poll the process table until it empties, the phase times out or
    /// cancellation is requested.
    pub fn wait_for_processes(&self, phase: WaitPhase, max_wait: PhaseDuration) -> PhaseOutcome {
        let start = Instant::now();
        let mut signalled: HashSet<i32> = HashSet::new();
        let mut sleep_time = self.timings.fast_tick;

        tracing::debug!(%phase, %max_wait, "Waiting for processes to exit");

        loop {
            let still_running = self.survivors(phase, &mut signalled);

            // Checked after the scan so the table is always fetched at least once.
            if still_running.is_empty() {
                tracing::debug!(%phase, "No more processes running");
                return PhaseOutcome::AllExited;
            }

            let elapsed = start.elapsed();

            if max_wait.is_expired(elapsed) {
                tracing::debug!(%phase, "Wait timed out");
                return PhaseOutcome::TimedOut(still_running);
            }

            if !self.state.keep_waiting() {
                if self.state.notify_interrupted() {
                    tracing::warn!("Waiting interrupted");
                }
                return PhaseOutcome::Interrupted(still_running);
            }

            if !self.state.signals_enabled() && elapsed > self.timings.signal_enable_after {
                self.enable_interrupts(still_running.len());
            }

            tracing::debug!(
                "Waiting for {} processes to exit\n{}",
                still_running.len(),
                format_table(&still_running)
            );

            if elapsed > self.timings.throttle_after {
                sleep_time = self.timings.slow_tick;
            }

            std::thread::sleep(sleep_time);
        }
    }

    /// Warn that shutdown is slow and let SIGINT/SIGQUIT/SIGTERM cut it short.
    fn enable_interrupts(&self, still_running: usize) {
        if !self.state.enable_signals() {
            return;
        }
        tracing::warn!("Waiting for {still_running} processes to exit...");
        if let Err(e) = self.signaller.enable_interrupts() {
            tracing::error!(error = %e, "failed to enable interrupt signals");
        }
    }

    /// Scan once and keep the processes that still block shutdown. In the
    /// terminate phase, anything not yet signalled gets SIGTERM now.
    fn survivors(&self, phase: WaitPhase, signalled: &mut HashSet<i32>) -> ProcessTable {
        let mut still_running = ProcessTable::new();

        for (pid, record) in self.lister.scan() {
            if record.is_already_dead() || pid == self.own_pid || pid == 1 {
                continue;
            }

            if phase == WaitPhase::Terminate && !signalled.contains(&pid) {
                tracing::info!("Killing {record}");
                if let Err(e) = self.signaller.terminate(pid) {
                    tracing::debug!(pid, error = %e, "SIGTERM failed, skipping");
                    continue;
                }
                signalled.insert(pid);
            }

            still_running.insert(pid, record);
        }

        still_running
    }
}
