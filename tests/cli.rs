//! Binary-level tests. Cases that actually wait scan a fake procfs tree whose
//! only pid is above `pid_max`, and never reach the SIGTERM phase, so nothing on
//! the host is signalled.
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use tempfile::tempdir;

const ENV_VARS: [&str; 3] = [
    "PYREX_CLEANUP_LOG_FILE",
    "PYREX_CLEANUP_LOG_LEVEL",
    "PYREX_CLEANUP_EXIT_WAIT",
];

fn cleanup(args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pyrex-cleanup"));
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd.args(args).envs(env.iter().copied());
    cmd.output().expect("failed to run pyrex-cleanup")
}

/// Start a real wait on a fake process that never exits. Interrupts are
/// enabled after 0.3s.
fn spawn_waiting(dir: &Path, exit_code: &str) -> Child {
    let proc_root = dir.join("proc");
    let pid_dir = proc_root.join("4194999");
    std::fs::create_dir_all(&pid_dir).unwrap();
    std::fs::write(pid_dir.join("stat"), "4194999 (sleeper) S 1 4194999 4194999").unwrap();
    std::fs::write(pid_dir.join("cmdline"), b"sleep\0infinity\0").unwrap();

    let config = dir.join("cleanup.toml");
    std::fs::write(&config, "[timing]\nsignal_enable_after_secs = 0.3\n").unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pyrex-cleanup"));
    for var in ENV_VARS {
        cmd.env_remove(var);
    }
    cmd.args(["--config", config.to_str().unwrap()])
        .args(["--proc-root", proc_root.to_str().unwrap()])
        .args(["--exit-wait", "-1,-1", "--log-level", "info", exit_code])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn pyrex-cleanup")
}

/// Collect stderr lines until one contains `needle`.
fn read_until(lines: &mut impl Iterator<Item = String>, seen: &mut Vec<String>, needle: &str) {
    for line in lines.by_ref() {
        let found = line.contains(needle);
        seen.push(line);
        if found {
            return;
        }
    }
    panic!("stderr ended before {needle:?}: {seen:#?}");
}

fn count(seen: &[String], needle: &str) -> usize {
    seen.iter().filter(|line| line.contains(needle)).count()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn dry_run_prints_default_schedule() {
    let output = cleanup(&["--dry-run", "0"], &[]);
    assert_eq!(output.status.code(), Some(0));
    let out = stdout(&output);
    assert!(out.contains("Wait times: 0.5,forever"), "{out}");
    assert!(out.contains("Log destination: stderr"));
    assert!(out.contains("Log level: WARNING"));
}

#[test]
fn dry_run_reads_exit_wait_from_env() {
    let output = cleanup(
        &["--dry-run", "3"],
        &[("PYREX_CLEANUP_EXIT_WAIT", "3,-1")],
    );
    assert_eq!(output.status.code(), Some(0));
    let out = stdout(&output);
    assert!(out.contains("natural-exit: 3"), "{out}");
    assert!(out.contains("terminate: forever"));
    assert!(out.contains("Exit code: 3"));
}

#[test]
fn flag_overrides_env() {
    let output = cleanup(
        &["--dry-run", "--exit-wait", "10", "0"],
        &[("PYREX_CLEANUP_EXIT_WAIT", "garbage")],
    );
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert!(stdout(&output).contains("Wait times: 5,5"));
}

#[test]
fn negative_values_are_accepted() {
    let output = cleanup(&["--dry-run", "--exit-wait", "-1,-1", "-15"], &[]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Wait times: forever,forever"), "{out}");
    assert!(out.contains("Exit code: -15"));
}

#[test]
fn config_file_values_are_used() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cleanup.toml");
    std::fs::write(&path, "[shutdown]\nexit_wait = \"1,2\"\n[log]\nlevel = \"error\"\n").unwrap();

    let output = cleanup(&["--dry-run", "--config", path.to_str().unwrap(), "0"], &[]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("Wait times: 1,2"), "{out}");
    assert!(out.contains("Log level: ERROR"));
}

#[test]
fn too_many_phases_is_fatal() {
    let output = cleanup(&["0"], &[("PYREX_CLEANUP_EXIT_WAIT", "1,2,3")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Invalid value for PYREX_CLEANUP_EXIT_WAIT: 1,2,3"));
}

#[test]
fn non_numeric_schedule_is_fatal_even_with_other_exit_code() {
    let output = cleanup(&["42"], &[("PYREX_CLEANUP_EXIT_WAIT", "later")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("later"));
}

#[test]
fn schedule_error_goes_to_configured_log_file() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("cleanup.log");

    let output = cleanup(
        &["0"],
        &[
            ("PYREX_CLEANUP_EXIT_WAIT", "x,y"),
            ("PYREX_CLEANUP_LOG_FILE", log.to_str().unwrap()),
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(!stderr(&output).contains("Invalid value"));
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("ERROR"));
    assert!(contents.contains("Invalid value for PYREX_CLEANUP_EXIT_WAIT: x,y"));
}

#[test]
fn invalid_log_level_is_fatal() {
    let output = cleanup(&["0"], &[("PYREX_CLEANUP_LOG_LEVEL", "chatty")]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Invalid value for PYREX_CLEANUP_LOG_LEVEL: chatty"));
}

#[test]
fn missing_config_file_is_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    let output = cleanup(&["--config", path.to_str().unwrap(), "0"], &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("failed to read config file"));
}

#[test]
fn missing_exit_code_is_usage_error() {
    let output = cleanup(&[], &[]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn non_integer_exit_code_is_usage_error() {
    let output = cleanup(&["--dry-run", "ok"], &[]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn sigint_after_escalation_stops_waiting() {
    let dir = tempdir().unwrap();
    let mut child = spawn_waiting(dir.path(), "7");
    let pid = Pid::from_raw(child.id() as i32);
    let mut lines = BufReader::new(child.stderr.take().unwrap())
        .lines()
        .map_while(Result::ok);
    let mut seen = Vec::new();

    read_until(&mut lines, &mut seen, "Waiting for 1 processes to exit...");
    kill(pid, Signal::SIGINT).unwrap();
    seen.extend(lines);

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(7), "{seen:#?}");
    assert_eq!(count(&seen, "Waiting for 1 processes to exit..."), 1);
    assert_eq!(count(&seen, "Waiting interrupted"), 1, "{seen:#?}");
    assert_eq!(count(&seen, "1 processes were left running!"), 1);
    assert_eq!(count(&seen, "Killing"), 0);
}

#[test]
fn early_sigterm_is_held_until_escalation() {
    let dir = tempdir().unwrap();
    let mut child = spawn_waiting(dir.path(), "3");
    let pid = Pid::from_raw(child.id() as i32);
    let mut lines = BufReader::new(child.stderr.take().unwrap())
        .lines()
        .map_while(Result::ok);
    let mut seen = Vec::new();

    read_until(&mut lines, &mut seen, "Waiting for processes to exit");
    kill(pid, Signal::SIGTERM).unwrap();
    seen.extend(lines);

    let status = child.wait().unwrap();
    assert_eq!(status.signal(), None, "killed by a signal: {seen:#?}");
    assert_eq!(status.code(), Some(3));
    let escalated = seen
        .iter()
        .position(|line| line.contains("Waiting for 1 processes to exit..."))
        .expect("escalation warning");
    let interrupted = seen
        .iter()
        .position(|line| line.contains("Waiting interrupted"))
        .expect("interruption warning");
    assert!(escalated < interrupted);
    assert_eq!(count(&seen, "Waiting interrupted"), 1);
}

#[test]
fn piped_stderr_has_no_color_codes() {
    let output = cleanup(&["0"], &[("PYREX_CLEANUP_EXIT_WAIT", "1,2,3")]);
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("ERROR"), "{err}");
    assert!(!err.contains('\u{1b}'), "{err:?}");
}
