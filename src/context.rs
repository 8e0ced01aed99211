//! Build context threaded through the action pipeline.
//!
//! The context is created once at startup and passed by exclusive reference
//! through every lifecycle phase. Actions mutate it as the build progresses:
//! `unpack`/`bootstrap` populate the root tree, `setup-image` records the
//! mounted image, and `ostree-deploy` may promote the image mount to be the
//! root tree.

use std::path::PathBuf;

/// Mutable state shared by all actions in a build run.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// The working root filesystem tree being assembled.
    pub root_dir: PathBuf,
    /// Read-only inputs and build outputs (tarballs, repositories, images).
    pub artifact_dir: PathBuf,
    /// Directory containing the recipe file; overlay sources resolve here.
    pub recipe_dir: PathBuf,
    /// Target CPU architecture string from the recipe (e.g. "amd64", "arm64").
    pub architecture: String,
    /// Path of the image file, once one has been created.
    pub image: Option<PathBuf>,
    /// Mount point of the prepared image, once mounted.
    pub image_mnt_dir: Option<PathBuf>,
    /// Loop device backing the mounted image, for teardown.
    pub image_loop_device: Option<String>,
    /// Pending /etc/fstab contents, filled in by `setup-image` and written
    /// out by the deploy actions.
    pub image_fstab: String,
    /// Kernel root-device argument (e.g. "root=UUID=..."), filled in by
    /// `setup-image`.
    pub image_kernel_root: Option<String>,
}

impl BuildContext {
    pub fn new(
        root_dir: PathBuf,
        artifact_dir: PathBuf,
        recipe_dir: PathBuf,
        architecture: String,
    ) -> Self {
        Self {
            root_dir,
            artifact_dir,
            recipe_dir,
            architecture,
            image: None,
            image_mnt_dir: None,
            image_loop_device: None,
            image_fstab: String::new(),
            image_kernel_root: None,
        }
    }
}
