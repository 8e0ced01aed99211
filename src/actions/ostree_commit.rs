//! Commit the root tree into a content-addressed repository.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;

use super::Action;
use crate::context::BuildContext;
use crate::store::Repo;

#[derive(Debug, Deserialize)]
pub struct OstreeCommitAction {
    /// Repository directory, relative to the artifact directory. Created on
    /// first commit.
    pub repository: String,
    pub branch: String,
    #[serde(default)]
    pub subject: Option<String>,
}

impl Action for OstreeCommitAction {
    fn name(&self) -> &str {
        "ostree-commit"
    }

    fn verify(&self, _context: &BuildContext) -> Result<()> {
        if self.repository.trim().is_empty() {
            bail!("ostree-commit: 'repository' must not be empty");
        }
        if self.branch.trim().is_empty() {
            bail!("ostree-commit: 'branch' must not be empty");
        }
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        if !context.root_dir.is_dir() {
            bail!(
                "ostree-commit: root tree {} does not exist",
                context.root_dir.display()
            );
        }

        // Device nodes cannot be committed; a bootstrapped tree has them
        // under /dev.
        let dev = context.root_dir.join("dev");
        if dev.is_dir() {
            for entry in fs::read_dir(&dev)
                .with_context(|| format!("Failed to read {}", dev.display()))?
            {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                }
                .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }

        let repo_path = context.artifact_dir.join(&self.repository);
        let repo = Repo::open_or_create(&repo_path)?;

        println!("Committing {} to {}", self.branch, repo_path.display());
        let subject = self
            .subject
            .clone()
            .unwrap_or_else(|| format!("Build of {}", self.branch));
        let mut txn = repo.prepare_transaction()?;
        let rev = txn.commit(&context.root_dir, &self.branch, &subject)?;
        txn.complete()?;
        println!("Commit: {}", rev);
        Ok(())
    }
}
