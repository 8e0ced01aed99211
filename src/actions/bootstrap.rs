//! Bootstrap a minimal root filesystem from a package feed.
//!
//! Thin wrapper around the external `debootstrap` tool. For a foreign
//! target architecture the bootstrap runs in two stages: `--foreign` on the
//! host, then the second stage inside the chroot runner (which injects the
//! qemu interpreter).

use anyhow::{bail, Result};
use serde::Deserialize;
use std::process::Command;

use super::Action;
use crate::chroot::{interpreter_for, run_in_chroot};
use crate::command;
use crate::context::BuildContext;
use crate::host::require_root;

#[derive(Debug, Deserialize)]
pub struct BootstrapAction {
    pub suite: String,
    #[serde(default)]
    pub mirror: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
}

impl Action for BootstrapAction {
    fn name(&self) -> &str {
        "bootstrap"
    }

    fn verify(&self, context: &BuildContext) -> Result<()> {
        if self.suite.trim().is_empty() {
            bail!("bootstrap: 'suite' must not be empty");
        }
        which::which("debootstrap")
            .map_err(|_| anyhow::anyhow!("bootstrap: 'debootstrap' not found in PATH"))?;
        // Fail on an unsupported architecture now, not after the first stage.
        interpreter_for(&context.architecture)?;
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        require_root("bootstrap")?;
        let foreign = interpreter_for(&context.architecture)?.is_some();

        let mut cmd = Command::new("debootstrap");
        if let Some(variant) = &self.variant {
            cmd.arg(format!("--variant={}", variant));
        }
        if !self.components.is_empty() {
            cmd.arg(format!("--components={}", self.components.join(",")));
        }
        cmd.arg(format!("--arch={}", context.architecture));
        if foreign {
            cmd.arg("--foreign");
        }
        cmd.arg(&self.suite).arg(&context.root_dir);
        if let Some(mirror) = &self.mirror {
            cmd.arg(mirror);
        }
        command::stream("bootstrap", cmd)?;

        if foreign {
            run_in_chroot(
                context,
                "second-stage",
                "/debootstrap/debootstrap",
                &["--second-stage"],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn verify_rejects_empty_suite() {
        let temp = TempDir::new().unwrap();
        let context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        let action = BootstrapAction {
            suite: "".to_string(),
            mirror: None,
            variant: None,
            components: vec![],
        };
        assert!(action.verify(&context).is_err());
    }

    #[test]
    fn verify_rejects_unsupported_architecture() {
        let temp = TempDir::new().unwrap();
        let context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "m68k".to_string(),
        );
        let action = BootstrapAction {
            suite: "stable".to_string(),
            mirror: None,
            variant: None,
            components: vec![],
        };
        // Either debootstrap is missing (fine) or the architecture check
        // must trip; both are verify-time failures.
        assert!(action.verify(&context).is_err());
    }
}
