//! Process table snapshots read from procfs.
//!
//! Every scan rebuilds the table from scratch. Processes that disappear
//! between listing `<root>/*/stat` and reading it are skipped without error.
use glob::glob;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default mount point of procfs.
pub const DEFAULT_PROC_ROOT: &str = "/proc";

/// Linux process states that no longer need waiting for.
const ALREADY_DEAD_STATES: [char; 3] = [
    'Z', // Zombie
    'X', // Dead (from Linux 2.6.0 onward)
    'x', // Dead (Linux 2.6.33 to 3.13 only)
];

/// The command name field of `stat`, which may itself contain spaces and parentheses.
static COMM_FIELD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(.*\)").unwrap());

/// One live process seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: i32,
    /// Single-character state code from `stat` (R, S, D, Z, ...).
    pub state: char,
    /// Space-joined command line, empty if it could not be read.
    pub command: String,
}

impl ProcessRecord {
    pub fn new(pid: i32, state: char, command: impl Into<String>) -> Self {
        Self {
            pid,
            state,
            command: command.into(),
        }
    }

    /// Zombies and dead tasks never block shutdown and are never signalled.
    pub fn is_already_dead(&self) -> bool {
        ALREADY_DEAD_STATES.contains(&self.state)
    }
}

impl fmt::Display for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID {} ({}): {}", self.pid, self.state, self.command)
    }
}

/// Snapshot of the process table, ordered by pid.
pub type ProcessTable = BTreeMap<i32, ProcessRecord>;

/// Render a table as an indented, pid-ordered listing.
pub fn format_table(table: &ProcessTable) -> String {
    table
        .values()
        .map(|record| format!("  {record}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Source of process table snapshots.
pub trait ProcessLister {
    /// Best-effort snapshot of every process currently visible.
    fn scan(&self) -> ProcessTable;
}

/// Reads the process table from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Paths of `<root>/<pid>/stat` for every numeric entry.
    fn stat_files(&self) -> Vec<PathBuf> {
        let pattern = self.root.join("*").join("stat");
        let entries = match glob(&pattern.to_string_lossy()) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, root = %self.root.display(), "invalid procfs glob pattern");
                return Vec::new();
            }
        };

        entries
            .flatten()
            .filter(|path| {
                path.parent()
                    .and_then(|dir| dir.file_name())
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
            })
            .collect()
    }

    /// Read one process. `None` if it vanished or its `stat` is unusable.
    fn read_process(&self, stat_path: &Path) -> Option<ProcessRecord> {
        let data = std::fs::read_to_string(stat_path).ok()?;
        if data.is_empty() {
            return None;
        }

        let (pid, state) = parse_stat(&data)?;
        let command = read_cmdline(&self.root.join(pid.to_string()).join("cmdline"));
        Some(ProcessRecord::new(pid, state, command))
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(DEFAULT_PROC_ROOT)
    }
}

impl ProcessLister for ProcFs {
    fn scan(&self) -> ProcessTable {
        let stat_files = self.stat_files();
        tracing::trace!(count = stat_files.len(), "found pid stat files");

        let mut table = ProcessTable::new();
        for path in stat_files {
            if let Some(record) = self.read_process(&path) {
                tracing::debug!("Found {record}");
                table.insert(record.pid, record);
            }
        }
        table
    }
}

/// Extract pid and state from the contents of a `stat` file.
fn parse_stat(data: &str) -> Option<(i32, char)> {
    let stripped = COMM_FIELD.replace(data, "");
    let mut fields = stripped.split_whitespace();
    let pid = fields.next()?.parse::<i32>().ok()?;
    let state = fields.next()?.chars().next()?;
    Some((pid, state))
}

/// Read a NUL-separated command line as a space-joined string.
fn read_cmdline(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let joined: Vec<u8> = bytes
                .into_iter()
                .map(|b| if b == 0 { b' ' } else { b })
                .collect();
            String::from_utf8_lossy(&joined).trim_end().to_string()
        }
        Err(_) => String::new(),
    }
}
