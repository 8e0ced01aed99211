//! Run a shell command, inside the chroot or against the root tree.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::process::Command;

use super::{default_true, Action};
use crate::chroot::run_in_chroot;
use crate::command;
use crate::context::BuildContext;

#[derive(Debug, Deserialize)]
pub struct RunAction {
    /// Shell command line, passed to `sh -c`.
    pub script: String,
    /// Run inside the target root via the chroot runner (default), or on
    /// the host with `ROOTDIR` exported and the root tree as working
    /// directory.
    #[serde(default = "default_true")]
    pub chroot: bool,
    /// Log label; defaults to the script itself.
    #[serde(default)]
    pub label: Option<String>,
}

impl RunAction {
    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.script)
    }
}

impl Action for RunAction {
    fn name(&self) -> &str {
        "run"
    }

    fn verify(&self, _context: &BuildContext) -> Result<()> {
        if self.script.trim().is_empty() {
            bail!("run: 'script' must not be empty");
        }
        if self.chroot {
            which::which("systemd-nspawn")
                .map_err(|_| anyhow::anyhow!("run: 'systemd-nspawn' not found in PATH"))?;
        }
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        if self.chroot {
            run_in_chroot(context, self.label(), "sh", &["-c", &self.script])
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&self.script)
                .current_dir(&context.root_dir)
                .env("ROOTDIR", &context.root_dir);
            command::stream(self.label(), cmd)
        }
    }
}
