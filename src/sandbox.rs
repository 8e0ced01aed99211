//! Sandbox provider contract.
//!
//! The orchestrator builds inside an ephemeral isolated environment that
//! re-invokes this same program with a marker set. The provider is an
//! external collaborator; this module defines the narrow contract the core
//! uses (register volumes, launch and join) plus a `systemd-nspawn` backed
//! implementation and the "already inside the sandbox" predicate.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Environment marker the launcher sets inside the sandbox.
pub const SANDBOX_ENV_MARKER: &str = "IMGBUILD_IN_SANDBOX";

/// True when this process is already running inside the sandbox.
pub fn in_machine() -> bool {
    std::env::var_os(SANDBOX_ENV_MARKER).is_some()
}

/// The contract actions and the orchestrator program against.
///
/// `add_volume` registrations must all happen before `run_with_args`;
/// launching blocks until the sandboxed re-invocation exits and returns its
/// exit code.
pub trait Machine {
    fn add_volume(&mut self, path: &Path);
    fn run_with_args(&mut self, args: &[String]) -> Result<i32>;
}

/// Sandbox built on `systemd-nspawn` with a volatile overlay of the host
/// filesystem, a tmpfs scratch area, and bind mounts for registered volumes.
#[derive(Default)]
pub struct NspawnMachine {
    volumes: Vec<PathBuf>,
}

impl NspawnMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Machine for NspawnMachine {
    fn add_volume(&mut self, path: &Path) {
        let path = path.to_path_buf();
        if !self.volumes.contains(&path) {
            self.volumes.push(path);
        }
    }

    fn run_with_args(&mut self, args: &[String]) -> Result<i32> {
        let exe = std::env::current_exe().context("Failed to locate own executable")?;

        let mut cmd = Command::new("systemd-nspawn");
        cmd.arg("-q")
            .arg("--volatile=overlay")
            .arg("-D")
            .arg("/")
            .arg("--tmpfs=/scratch")
            .arg(format!("--setenv={}=1", SANDBOX_ENV_MARKER));
        for volume in &self.volumes {
            cmd.arg(format!("--bind={}", volume.display()));
        }
        cmd.arg("--").arg(&exe).args(args);

        println!("Launching sandbox: {:?}", cmd);
        let status = cmd
            .status()
            .context("Failed to launch sandbox (is systemd-nspawn installed?)")?;
        Ok(status.code().unwrap_or(1))
    }
}
