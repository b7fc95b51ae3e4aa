//! Shutdown schedule: how long each wait phase may last.
//!
//! The schedule string accepts three shapes:
//! - a single non-negative number of seconds, split evenly over both phases
//! - a single negative number, meaning a short natural-exit phase followed by
//!   an unbounded terminate phase
//! - two comma-separated numbers, one per phase, where a negative value means
//!   that phase never times out
use std::fmt;
use std::time::Duration;

/// Schedule used when nothing is configured.
pub const DEFAULT_EXIT_WAIT: &str = "-1";

/// Number of wait phases. The schedule string must normalise to exactly this many.
const EXIT_WAIT_PHASES: usize = 2;

/// Natural-exit wait used when a single negative value is given.
const FOREVER_NATURAL_EXIT: Duration = Duration::from_millis(500);

/// The two ordered stages of shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// Processes get a grace period to exit on their own. Nothing is signalled.
    NaturalExit,
    /// Survivors are sent SIGTERM and given a second grace period.
    Terminate,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPhase::NaturalExit => write!(f, "natural-exit"),
            WaitPhase::Terminate => write!(f, "terminate"),
        }
    }
}

/// Maximum time a phase waits before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDuration {
    Bounded(Duration),
    /// No timeout; only cancellation or all processes exiting ends the phase.
    Forever,
}

impl PhaseDuration {
    /// Interpret a number of seconds, negative meaning forever.
    fn from_secs(secs: f64) -> Option<Self> {
        if secs.is_nan() {
            return None;
        }
        if secs < 0.0 || secs.is_infinite() {
            return Some(PhaseDuration::Forever);
        }
        Duration::try_from_secs_f64(secs)
            .ok()
            .map(PhaseDuration::Bounded)
    }

    /// True once `elapsed` is past the limit. Never true for `Forever`.
    pub fn is_expired(&self, elapsed: Duration) -> bool {
        match self {
            PhaseDuration::Bounded(max) => elapsed >= *max,
            PhaseDuration::Forever => false,
        }
    }
}

impl fmt::Display for PhaseDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseDuration::Bounded(d) => write!(f, "{}", d.as_secs_f64()),
            PhaseDuration::Forever => write!(f, "forever"),
        }
    }
}

/// Errors from parsing a schedule string.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// A comma-separated token was not a number.
    InvalidNumber { value: String, token: String },
    /// The string had neither one nor two values.
    WrongPhaseCount { value: String, count: usize },
}

impl ScheduleError {
    /// The raw schedule string that failed to parse.
    pub fn value(&self) -> &str {
        match self {
            ScheduleError::InvalidNumber { value, .. } => value,
            ScheduleError::WrongPhaseCount { value, .. } => value,
        }
    }
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::InvalidNumber { value, token } => {
                write!(f, "'{token}' is not a number of seconds in '{value}'")
            }
            ScheduleError::WrongPhaseCount { value, count } => {
                write!(
                    f,
                    "expected 1 or {EXIT_WAIT_PHASES} comma-separated values in '{value}', got {count}"
                )
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// The per-phase wait limits for one reaper run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSchedule {
    natural_exit: PhaseDuration,
    terminate: PhaseDuration,
}

impl ShutdownSchedule {
    pub fn new(natural_exit: PhaseDuration, terminate: PhaseDuration) -> Self {
        Self {
            natural_exit,
            terminate,
        }
    }

    /// Parse and normalise a schedule string into exactly two phases.
    pub fn parse(value: &str) -> Result<Self, ScheduleError> {
        let secs = value
            .split(',')
            .map(|token| {
                token
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|s| !s.is_nan())
                    .ok_or_else(|| ScheduleError::InvalidNumber {
                        value: value.to_string(),
                        token: token.to_string(),
                    })
            })
            .collect::<Result<Vec<f64>, _>>()?;

        let durations = match secs.as_slice() {
            [total] if *total < 0.0 => {
                return Ok(Self::new(
                    PhaseDuration::Bounded(FOREVER_NATURAL_EXIT),
                    PhaseDuration::Forever,
                ));
            }
            [total] => [*total / EXIT_WAIT_PHASES as f64; EXIT_WAIT_PHASES],
            [natural, terminate] => [*natural, *terminate],
            _ => {
                return Err(ScheduleError::WrongPhaseCount {
                    value: value.to_string(),
                    count: secs.len(),
                })
            }
        };

        let to_phase = |secs: f64| {
            PhaseDuration::from_secs(secs).ok_or_else(|| ScheduleError::InvalidNumber {
                value: value.to_string(),
                token: secs.to_string(),
            })
        };

        Ok(Self::new(to_phase(durations[0])?, to_phase(durations[1])?))
    }

    pub fn duration(&self, phase: WaitPhase) -> PhaseDuration {
        match phase {
            WaitPhase::NaturalExit => self.natural_exit,
            WaitPhase::Terminate => self.terminate,
        }
    }

    /// Phases in the order they run.
    pub fn phases(&self) -> [(WaitPhase, PhaseDuration); EXIT_WAIT_PHASES] {
        [
            (WaitPhase::NaturalExit, self.natural_exit),
            (WaitPhase::Terminate, self.terminate),
        ]
    }
}

impl Default for ShutdownSchedule {
    fn default() -> Self {
        Self::new(
            PhaseDuration::Bounded(FOREVER_NATURAL_EXIT),
            PhaseDuration::Forever,
        )
    }
}

impl fmt::Display for ShutdownSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.natural_exit, self.terminate)
    }
}
