//! Pack the root tree into an archive in the artifact directory.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::process::Command;

use super::Action;
use crate::command;
use crate::context::BuildContext;

#[derive(Debug, Deserialize)]
pub struct PackAction {
    pub file: String,
    #[serde(default)]
    pub compression: Option<String>,
}

impl PackAction {
    fn tar_flag(&self) -> Result<Option<&'static str>> {
        match self.compression.as_deref() {
            // -a picks compression from the output file suffix
            None => Ok(Some("-a")),
            Some("gz") | Some("gzip") => Ok(Some("-z")),
            Some("xz") => Ok(Some("-J")),
            Some("bz2") | Some("bzip2") => Ok(Some("-j")),
            Some("none") => Ok(None),
            Some(other) => bail!("Unknown compression '{}' for pack", other),
        }
    }
}

impl Action for PackAction {
    fn name(&self) -> &str {
        "pack"
    }

    fn verify(&self, _context: &BuildContext) -> Result<()> {
        if self.file.trim().is_empty() {
            bail!("pack: 'file' must not be empty");
        }
        self.tar_flag()?;
        which::which("tar").map_err(|_| anyhow::anyhow!("pack: 'tar' not found in PATH"))?;
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        let outfile = context.artifact_dir.join(&self.file);
        if !context.root_dir.is_dir() {
            bail!(
                "pack: root tree {} does not exist",
                context.root_dir.display()
            );
        }

        println!("Packing {}", outfile.display());
        let mut cmd = Command::new("tar");
        cmd.arg("-c");
        if let Some(flag) = self.tar_flag()? {
            cmd.arg(flag);
        }
        cmd.arg("-f")
            .arg(&outfile)
            .arg("-C")
            .arg(&context.root_dir)
            .arg(".");
        command::stream("pack", cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn packs_root_tree_into_artifact_dir() {
        let temp = TempDir::new().unwrap();
        let mut context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        fs::create_dir_all(context.root_dir.join("etc")).unwrap();
        fs::write(context.root_dir.join("etc/hostname"), "box\n").unwrap();

        let action = PackAction {
            file: "out.tar".to_string(),
            compression: Some("none".to_string()),
        };
        action.verify(&context).unwrap();
        action.run(&mut context).unwrap();

        let mut archive = tar::Archive::new(fs::File::open(temp.path().join("out.tar")).unwrap());
        let paths: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(paths.iter().any(|p| p.contains("etc/hostname")));
    }

    #[test]
    fn run_fails_without_root_tree() {
        let temp = TempDir::new().unwrap();
        let mut context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        let action = PackAction {
            file: "out.tar".to_string(),
            compression: None,
        };
        assert!(action.run(&mut context).is_err());
    }
}
