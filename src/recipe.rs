//! Recipe document: target architecture plus an ordered list of actions.
//!
//! Each `[[actions]]` table carries an `action` discriminator naming the
//! kind; the concrete variant is selected at parse time by the tagged enum
//! below, so an unknown discriminator fails the whole run before any phase
//! executes.
//!
//! ```toml
//! architecture = "amd64"
//!
//! [[actions]]
//! action = "unpack"
//! file = "base.tar.gz"
//!
//! [[actions]]
//! action = "run"
//! script = "touch /done"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::actions::{
    Action, BootstrapAction, DeployImageAction, OstreeCommitAction, OstreeDeployAction,
    OverlayAction, PackAction, RunAction, SetupImageAction, UnpackAction,
};

/// A parsed recipe. Immutable after parse.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub architecture: String,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Tagged union over the supported action kinds. The discriminator is the
/// `action` field of each serialized record.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ActionSpec {
    Unpack(UnpackAction),
    Pack(PackAction),
    Overlay(OverlayAction),
    Run(RunAction),
    Bootstrap(BootstrapAction),
    OstreeCommit(OstreeCommitAction),
    OstreeDeploy(OstreeDeployAction),
    SetupImage(SetupImageAction),
    DeployImage(DeployImageAction),
}

impl ActionSpec {
    /// The concrete action behind this variant.
    pub fn as_action(&self) -> &dyn Action {
        match self {
            ActionSpec::Unpack(a) => a,
            ActionSpec::Pack(a) => a,
            ActionSpec::Overlay(a) => a,
            ActionSpec::Run(a) => a,
            ActionSpec::Bootstrap(a) => a,
            ActionSpec::OstreeCommit(a) => a,
            ActionSpec::OstreeDeploy(a) => a,
            ActionSpec::SetupImage(a) => a,
            ActionSpec::DeployImage(a) => a,
        }
    }

    pub fn name(&self) -> &str {
        self.as_action().name()
    }
}

/// Load and validate a recipe file.
pub fn load_recipe(path: &Path) -> Result<Recipe> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read recipe '{}'", path.display()))?;
    let recipe: Recipe = toml::from_str(&text)
        .with_context(|| format!("Failed to parse recipe '{}'", path.display()))?;
    if recipe.architecture.trim().is_empty() {
        bail!("Recipe '{}' has an empty architecture", path.display());
    }
    Ok(recipe)
}
