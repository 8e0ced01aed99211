//! Unpack an archive from the artifact directory into the root tree.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::process::Command;

use super::Action;
use crate::command;
use crate::context::BuildContext;

#[derive(Debug, Deserialize)]
pub struct UnpackAction {
    pub file: String,
    #[serde(default)]
    pub compression: Option<String>,
}

impl UnpackAction {
    fn tar_flag(&self) -> Result<Option<&'static str>> {
        match self.compression.as_deref() {
            // tar auto-detects on extraction when no flag is given
            None => Ok(None),
            Some("gz") | Some("gzip") => Ok(Some("-z")),
            Some("xz") => Ok(Some("-J")),
            Some("bz2") | Some("bzip2") => Ok(Some("-j")),
            Some(other) => bail!("Unknown compression '{}' for unpack", other),
        }
    }
}

impl Action for UnpackAction {
    fn name(&self) -> &str {
        "unpack"
    }

    fn verify(&self, context: &BuildContext) -> Result<()> {
        if self.file.trim().is_empty() {
            bail!("unpack: 'file' must not be empty");
        }
        self.tar_flag()?;
        which::which("tar").map_err(|_| anyhow::anyhow!("unpack: 'tar' not found in PATH"))?;
        let infile = context.artifact_dir.join(&self.file);
        if !infile.is_file() {
            bail!("unpack: archive not found: {}", infile.display());
        }
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        let infile = context.artifact_dir.join(&self.file);
        fs::create_dir_all(&context.root_dir)
            .with_context(|| format!("Failed to create {}", context.root_dir.display()))?;

        println!("Unpacking {}", infile.display());
        let mut cmd = Command::new("tar");
        cmd.arg("-x");
        if let Some(flag) = self.tar_flag()? {
            cmd.arg(flag);
        }
        cmd.arg("-f").arg(&infile).arg("-C").arg(&context.root_dir);
        command::stream("unpack", cmd)
    }
}
