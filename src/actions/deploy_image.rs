//! Copy the prepared root tree onto the mounted image.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use super::Action;
use crate::context::BuildContext;
use crate::overlay::overlay_tree;

#[derive(Debug, Deserialize)]
pub struct DeployImageAction {}

impl Action for DeployImageAction {
    fn name(&self) -> &str {
        "deploy-image"
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        let mnt = context
            .image_mnt_dir
            .clone()
            .context("deploy-image: no mounted image (is there a setup-image action?)")?;

        println!("Deploying root tree to {}", mnt.display());
        overlay_tree(&context.root_dir, &mnt)?;

        if !context.image_fstab.is_empty() {
            let etc = mnt.join("etc");
            fs::create_dir_all(&etc)
                .with_context(|| format!("Failed to create {}", etc.display()))?;
            fs::write(etc.join("fstab"), &context.image_fstab)
                .with_context(|| format!("Failed to write {}", etc.join("fstab").display()))?;
        }
        Ok(())
    }
}
