//! Labeled external-command runner.
//!
//! Every external tool the builder drives (tar, debootstrap, systemd-nspawn,
//! mount, ...) goes through here so its output shows up interleaved in the
//! build log, one line at a time, prefixed with the caller's label:
//!
//! ```text
//! unpack | ./etc/hostname
//! unpack E | tar: ./dev: implausibly old time stamp
//! ```
//!
//! Stdout and stderr are drained on two threads to avoid pipe back-pressure
//! deadlocks; both are joined before the exit status is reported.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;

/// Run a pre-built command, streaming its output under `label`.
///
/// Returns an error carrying the label and exit status when the child exits
/// non-zero or abnormally.
pub fn stream(label: &str, mut cmd: Command) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    println!("Running {}: {:?}", label, cmd);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command for '{}'", label))?;
    let stdout = child.stdout.take().context("Failed to capture stdout")?;
    let stderr = child.stderr.take().context("Failed to capture stderr")?;

    let (tx, rx) = mpsc::channel();
    let tx_err = tx.clone();

    let out_reader = std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if tx.send((false, line)).is_err() {
                break;
            }
        }
    });
    let err_reader = std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            if tx_err.send((true, line)).is_err() {
                break;
            }
        }
    });

    // Ends when both reader threads have dropped their senders.
    for (is_stderr, line) in rx {
        if is_stderr {
            println!("{} E | {}", label, line);
        } else {
            println!("{} | {}", label, line);
        }
    }

    let _ = out_reader.join();
    let _ = err_reader.join();

    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for '{}'", label))?;
    if !status.success() {
        bail!("{} failed: command exited with {}", label, status);
    }
    Ok(())
}

/// Convenience wrapper: run `program` with string arguments.
pub fn run(label: &str, program: &str, args: &[&str]) -> Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    stream(label, cmd)
}

/// Run a command and capture its trimmed stdout (for tools like `losetup
/// --show` and `blkid` whose single-line output we need back).
pub fn capture(label: &str, mut cmd: Command) -> Result<String> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to spawn command for '{}'", label))?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        println!("{} E | {}", label, line);
    }

    if !output.status.success() {
        bail!("{} failed: command exited with {}", label, output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_succeeds_for_zero_exit() {
        run("true", "true", &[]).unwrap();
    }

    #[test]
    fn run_reports_label_and_status_on_failure() {
        let err = run("failing-step", "false", &[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("failing-step"), "message was: {}", msg);
    }

    #[test]
    fn run_fails_for_missing_program() {
        let err = run("ghost", "definitely_not_a_real_command_12345", &[]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn capture_returns_trimmed_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = capture("echo", cmd).unwrap();
        assert_eq!(out, "hello");
    }
}
