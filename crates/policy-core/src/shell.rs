//! Bounded `sh -c` execution for command actions.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::warn;

/// Combined output is capped to this many bytes, keeping the tail.
pub const MAX_OUTPUT: usize = 10 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub success: bool,
    /// `None` when the process was killed or never started.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
    pub duration: Duration,
}

/// Run `command` through `sh -c` in `cwd`, killing it after `timeout`.
///
/// Spawn failures are reported as an unsuccessful run rather than an error so
/// that callers can record them on the queue entry like any other failure.
pub fn run(command: &str, cwd: &Path, timeout: Duration) -> ShellOutput {
    let started = Instant::now();
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Own process group so a timeout kill reaches grandchildren too.
        .process_group(0)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            return ShellOutput {
                success: false,
                exit_code: None,
                timed_out: false,
                output: format!("failed to spawn: {e}"),
                duration: started.elapsed(),
            }
        }
    };

    let child_pid = child.id();

    // Read stdout/stderr in dedicated threads to avoid pipe-buffer deadlocks
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || read_all(stdout_handle));
    let stderr_thread = std::thread::spawn(move || read_all(stderr_handle));

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(child.wait());
    });

    let wait_result = match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            // The reader threads get EOF once the group is gone; they are
            // not joined here so a stuck descendant cannot hang the caller.
            kill_group(child_pid);
            warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
            return ShellOutput {
                success: false,
                exit_code: None,
                timed_out: true,
                output: format!("timed out after {}s", timeout.as_secs()),
                duration: started.elapsed(),
            };
        }
    };

    let stdout_buf = stdout_thread.join().unwrap_or_default();
    let stderr_buf = stderr_thread.join().unwrap_or_default();
    let duration = started.elapsed();

    match wait_result {
        Ok(status) => ShellOutput {
            success: status.success(),
            exit_code: status.code(),
            timed_out: false,
            output: combine_output(&stdout_buf, &stderr_buf),
            duration,
        },
        Err(e) => ShellOutput {
            success: false,
            exit_code: None,
            timed_out: false,
            output: format!("wait failed: {e}"),
            duration,
        },
    }
}

fn read_all<R: Read>(handle: Option<R>) -> String {
    let mut bytes = Vec::new();
    if let Some(mut r) = handle {
        let _ = r.read_to_end(&mut bytes);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Combine stdout/stderr and cap to `MAX_OUTPUT` (keeping the tail).
fn combine_output(stdout: &str, stderr: &str) -> String {
    let output = if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    };
    tail(output.trim(), MAX_OUTPUT).to_string()
}

/// The last `max` bytes of `s`, moved forward to a char boundary.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// SIGKILL the process group led by `pid`. Best-effort.
fn kill_group(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SECS_10: Duration = Duration::from_secs(10);

    #[test]
    fn success_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let out = run("true", dir.path(), SECS_10);
        assert!(out.success);
        assert_eq!(out.exit_code, Some(0));

        let out = run("exit 3", dir.path(), SECS_10);
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
    }

    #[test]
    fn captures_both_streams() {
        let dir = TempDir::new().unwrap();
        let out = run("echo hello; echo oops >&2", dir.path(), SECS_10);
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
    }

    #[test]
    fn runs_in_the_given_directory() {
        let dir = TempDir::new().unwrap();
        run("echo x > marker.txt", dir.path(), SECS_10);
        assert!(dir.path().join("marker.txt").exists());
    }

    #[test]
    fn timeout_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        let out = run("sleep 30", dir.path(), Duration::from_millis(300));
        assert!(out.timed_out);
        assert!(!out.success);
        assert_eq!(out.exit_code, None);
        assert!(out.output.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn output_keeps_the_tail() {
        let dir = TempDir::new().unwrap();
        let out = run(
            "i=0; while [ $i -lt 3000 ]; do echo line$i; i=$((i+1)); done",
            dir.path(),
            SECS_10,
        );
        assert!(out.output.len() <= MAX_OUTPUT);
        assert!(out.output.ends_with("line2999"));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "ééééé";
        let t = tail(s, 3);
        assert_eq!(t, "é");
        assert_eq!(tail("abc", 10), "abc");
    }
}
