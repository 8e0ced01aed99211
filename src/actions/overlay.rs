//! Overlay a recipe-provided file tree onto the root tree.

use anyhow::{bail, Result};
use serde::Deserialize;

use super::Action;
use crate::context::BuildContext;
use crate::overlay::overlay_tree;

#[derive(Debug, Deserialize)]
pub struct OverlayAction {
    /// Source directory, relative to the recipe file.
    pub source: String,
}

impl Action for OverlayAction {
    fn name(&self) -> &str {
        "overlay"
    }

    fn verify(&self, context: &BuildContext) -> Result<()> {
        if self.source.trim().is_empty() {
            bail!("overlay: 'source' must not be empty");
        }
        let source = context.recipe_dir.join(&self.source);
        if !source.is_dir() {
            bail!("overlay: source directory not found: {}", source.display());
        }
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        let source = context.recipe_dir.join(&self.source);
        overlay_tree(&source, &context.root_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn verify_requires_existing_source() {
        let temp = TempDir::new().unwrap();
        let context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        let action = OverlayAction {
            source: "files".to_string(),
        };
        assert!(action.verify(&context).is_err());

        fs::create_dir_all(temp.path().join("files")).unwrap();
        action.verify(&context).unwrap();
    }

    #[test]
    fn run_overlays_source_onto_root() {
        let temp = TempDir::new().unwrap();
        let mut context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        fs::create_dir_all(temp.path().join("files/etc")).unwrap();
        fs::write(temp.path().join("files/etc/issue"), "hi\n").unwrap();
        fs::create_dir_all(&context.root_dir).unwrap();

        let action = OverlayAction {
            source: "files".to_string(),
        };
        action.run(&mut context).unwrap();
        assert_eq!(
            fs::read_to_string(context.root_dir.join("etc/issue")).unwrap(),
            "hi\n"
        );
    }
}
