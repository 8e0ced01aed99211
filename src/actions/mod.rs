//! The polymorphic action model.
//!
//! Every build step implements [`Action`]: five lifecycle phases, all
//! optional. `verify` and `pre_machine` run on the host before any sandbox
//! exists; `run` and `cleanup` run inside it (or directly in no-sandbox
//! mode); `post_machine` runs on the host after the sandbox has exited.
//! The orchestrator drives each phase across the whole action list before
//! moving to the next phase, in recipe order.

pub mod bootstrap;
pub mod deploy_image;
pub mod ostree_commit;
pub mod ostree_deploy;
pub mod overlay;
pub mod pack;
pub mod run;
pub mod setup_image;
pub mod unpack;

pub use bootstrap::BootstrapAction;
pub use deploy_image::DeployImageAction;
pub use ostree_commit::OstreeCommitAction;
pub use ostree_deploy::OstreeDeployAction;
pub use overlay::OverlayAction;
pub use pack::PackAction;
pub use run::RunAction;
pub use setup_image::SetupImageAction;
pub use unpack::UnpackAction;

use anyhow::Result;

use crate::context::BuildContext;
use crate::sandbox::Machine;

/// A single typed build step with a multi-phase lifecycle.
pub trait Action {
    /// Discriminator name, for logging and error messages.
    fn name(&self) -> &str;

    /// Validate this action's fields against the context. Host side, before
    /// any sandbox exists; must not mutate state. A failure here is a
    /// configuration error and aborts the run before any destructive work.
    fn verify(&self, _context: &BuildContext) -> Result<()> {
        Ok(())
    }

    /// Host side, before the sandbox launches: register required volume
    /// mounts and append arguments to forward into the sandboxed
    /// re-invocation. Must be idempotent.
    fn pre_machine(
        &self,
        _context: &mut BuildContext,
        _machine: &mut dyn Machine,
        _args: &mut Vec<String>,
    ) -> Result<()> {
        Ok(())
    }

    /// The action's primary effect, inside the sandbox.
    fn run(&self, _context: &mut BuildContext) -> Result<()> {
        Ok(())
    }

    /// Best-effort teardown inside the sandbox, after all runs complete.
    /// Failures are logged by the orchestrator, not propagated.
    fn cleanup(&self, _context: &mut BuildContext) -> Result<()> {
        Ok(())
    }

    /// Host side, after the sandbox has exited.
    fn post_machine(&self, _context: &mut BuildContext) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn default_true() -> bool {
    true
}
