//! imgbuild builds bootable OS images from declarative recipes.
//!
//! A recipe is an ordered list of typed actions (unpack, overlay, run,
//! commit, deploy, ...) executed against a shared [`BuildContext`]. The
//! orchestrator runs the host-side phases, launches an isolated sandbox that
//! re-invokes this program, and runs the actions inside it:
//!
//! ```text
//! imgbuild (host)
//!     │  parse recipe → verify → pre-machine
//!     ▼
//! sandbox (systemd-nspawn, volatile overlay)
//!     │  run each action → cleanup
//!     ▼
//! imgbuild (host)
//!        post-machine → exit with sandbox's code
//! ```
//!
//! Actions build a root filesystem tree, then either pack it into an
//! archive or commit it into a content-addressed store and deploy it into a
//! mounted image with a single atomic switch-over.

pub mod actions;
pub mod chroot;
pub mod command;
pub mod context;
pub mod host;
pub mod orchestrator;
pub mod overlay;
pub mod recipe;
pub mod sandbox;
pub mod store;

pub use context::BuildContext;
pub use orchestrator::{run_build, BuildOptions};
pub use recipe::{load_recipe, ActionSpec, Recipe};
