//! Deploy a committed revision into the mounted target image.
//!
//! The deploy runs against the image mount prepared by `setup-image`: it
//! seeds the mount with the working tree, initializes a store inside the
//! image, pulls the requested branch from the build repository and checks it
//! out as a deployment. Writing the active-deployment record is the single
//! atomic switch-over; everything before it leaves the previous deployment
//! in charge. Partial progress (a registered remote, a pulled ref) is not
//! rolled back on a later failure.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::process::Command;

use super::{default_true, Action};
use crate::command;
use crate::context::BuildContext;
use crate::store::sysroot::Sysroot;
use crate::store::{Repo, RemoteOptions};

#[derive(Debug, Deserialize)]
pub struct OstreeDeployAction {
    /// Source repository, relative to the artifact directory.
    pub repository: String,
    /// Pull URL to record in the deployed origin; defaults to the local
    /// repository path.
    #[serde(default)]
    pub remote_repository: Option<String>,
    pub branch: String,
    pub os: String,
    #[serde(default = "default_true")]
    pub setup_fstab: bool,
    #[serde(default = "default_true")]
    pub setup_kernel_cmdline: bool,
    #[serde(default)]
    pub append_kernel_cmdline: Option<String>,
}

/// Kernel arguments for a deployment: the root-device argument when
/// requested and available, then the user-supplied extras, whitespace-split.
pub fn compose_kernel_args(
    setup_kernel_cmdline: bool,
    kernel_root: Option<&str>,
    append: Option<&str>,
) -> Vec<String> {
    let mut args = Vec::new();
    if setup_kernel_cmdline {
        if let Some(root) = kernel_root {
            if !root.is_empty() {
                args.push(root.to_string());
            }
        }
    }
    if let Some(extra) = append {
        args.extend(extra.split_whitespace().map(str::to_string));
    }
    args
}

impl OstreeDeployAction {
    fn seed_image(&self, context: &BuildContext, mnt: &Path) -> Result<()> {
        // The working tree may contain symlinks and device nodes, which the
        // overlay engine refuses; an archive-mode copy handles them all.
        let mut source = context.root_dir.clone().into_os_string();
        source.push("/.");
        let mut cmd = Command::new("cp");
        cmd.arg("-a").arg(source).arg(mnt);
        command::stream("deploy-seed", cmd)
    }
}

impl Action for OstreeDeployAction {
    fn name(&self) -> &str {
        "ostree-deploy"
    }

    fn verify(&self, _context: &BuildContext) -> Result<()> {
        if self.repository.trim().is_empty() {
            bail!("ostree-deploy: 'repository' must not be empty");
        }
        if self.branch.trim().is_empty() {
            bail!("ostree-deploy: 'branch' must not be empty");
        }
        if self.os.trim().is_empty() {
            bail!("ostree-deploy: 'os' must not be empty");
        }
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        let mnt = context
            .image_mnt_dir
            .clone()
            .context("ostree-deploy: no mounted image (is there a setup-image action?)")?;

        println!("Deploying {} to {}", self.branch, mnt.display());

        self.seed_image(context, &mnt)?;
        // From here on the image mount is the tree later actions operate on.
        context.root_dir = mnt.clone();

        let mut sysroot = Sysroot::new(&mnt);
        sysroot.init_fs().context("Failed to initialize sysroot")?;
        sysroot.init_osname(&self.os)?;

        let dest_repo = Repo::open(&sysroot.repo_path())?;

        let local_repo = context.artifact_dir.join(&self.repository);
        let pull_url = format!("file://{}", local_repo.display());
        let origin_url = self
            .remote_repository
            .clone()
            .unwrap_or_else(|| pull_url.clone());
        dest_repo.remote_add(
            "origin",
            &origin_url,
            RemoteOptions {
                no_gpg_verify: true,
            },
        )?;

        dest_repo.pull(&pull_url, "origin", &self.branch)?;
        sysroot.load()?;

        let revision = dest_repo.resolve_rev(&self.branch)?;
        let kargs = compose_kernel_args(
            self.setup_kernel_cmdline,
            context.image_kernel_root.as_deref(),
            self.append_kernel_cmdline.as_deref(),
        );

        let refspec = format!("origin:{}", self.branch);
        let deployment = sysroot.deploy_tree(&self.os, &revision, &refspec, &kargs)?;

        if self.setup_fstab {
            let etc = mnt.join(deployment.dirpath()).join("etc");
            fs::create_dir_all(&etc)
                .with_context(|| format!("Failed to create {}", etc.display()))?;
            fs::write(etc.join("fstab"), &context.image_fstab)
                .with_context(|| format!("Failed to write {}", etc.join("fstab").display()))?;
        }

        sysroot.write_deployment(&self.os, &deployment)?;
        println!("Deployed {}.{}", deployment.csum, deployment.serial);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn kernel_args_compose_root_then_extras() {
        let args = compose_kernel_args(true, Some("root=/dev/sda1"), Some("quiet splash"));
        assert_eq!(args, vec!["root=/dev/sda1", "quiet", "splash"]);
    }

    #[test]
    fn kernel_args_skip_root_when_disabled() {
        let args = compose_kernel_args(false, Some("root=/dev/sda1"), Some("quiet"));
        assert_eq!(args, vec!["quiet"]);
    }

    #[test]
    fn kernel_args_tolerate_missing_root() {
        assert!(compose_kernel_args(true, None, None).is_empty());
        assert!(compose_kernel_args(true, Some(""), None).is_empty());
    }

    fn deploy_fixture(temp: &TempDir) -> (BuildContext, OstreeDeployAction) {
        let mut context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        fs::create_dir_all(context.root_dir.join("boot")).unwrap();
        fs::write(context.root_dir.join("boot/loader.conf"), "timeout 3\n").unwrap();

        // Commit a tree into the build repository.
        let tree = temp.path().join("tree");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/os-release"), "ID=test\n").unwrap();
        let repo = Repo::create(&temp.path().join("repo")).unwrap();
        let mut txn = repo.prepare_transaction().unwrap();
        txn.commit(&tree, "os/main", "payload").unwrap();
        txn.complete().unwrap();

        let mnt = temp.path().join("mnt");
        fs::create_dir_all(&mnt).unwrap();
        context.image_mnt_dir = Some(mnt);
        context.image_fstab = "UUID=abc / ext4 defaults 0 1\n".to_string();
        context.image_kernel_root = Some("root=UUID=abc".to_string());

        let action = OstreeDeployAction {
            repository: "repo".to_string(),
            remote_repository: None,
            branch: "os/main".to_string(),
            os: "testos".to_string(),
            setup_fstab: true,
            setup_kernel_cmdline: true,
            append_kernel_cmdline: Some("quiet".to_string()),
        };
        (context, action)
    }

    #[test]
    fn deploys_branch_into_image_mount() {
        let temp = TempDir::new().unwrap();
        let (mut context, action) = deploy_fixture(&temp);
        action.verify(&context).unwrap();
        action.run(&mut context).unwrap();

        let mnt = temp.path().join("mnt");
        // Seeded from the working tree.
        assert!(mnt.join("boot/loader.conf").is_file());
        // Root tree promoted to the image mount.
        assert_eq!(context.root_dir, mnt);

        let mut sysroot = Sysroot::new(&mnt);
        sysroot.load().unwrap();
        let active = sysroot.active_deployment("testos").unwrap().unwrap();
        let deploy_dir = mnt.join(active.dirpath());
        assert_eq!(
            fs::read_to_string(deploy_dir.join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
        assert_eq!(
            fs::read_to_string(deploy_dir.join("etc/fstab")).unwrap(),
            "UUID=abc / ext4 defaults 0 1\n"
        );
    }

    #[test]
    fn failed_pull_leaves_active_deployment_unchanged() {
        let temp = TempDir::new().unwrap();
        let (mut context, action) = deploy_fixture(&temp);
        action.run(&mut context).unwrap();

        let mnt = temp.path().join("mnt");
        let mut sysroot = Sysroot::new(&mnt);
        sysroot.load().unwrap();
        let before = sysroot.active_deployment("testos").unwrap();

        // Re-running with a branch the source repository does not have must
        // fail before the switch-over.
        context.root_dir = temp.path().join("seed2");
        fs::create_dir_all(&context.root_dir).unwrap();
        let broken = OstreeDeployAction {
            branch: "missing".to_string(),
            ..action
        };
        assert!(broken.run(&mut context).is_err());

        let mut after = Sysroot::new(&mnt);
        after.load().unwrap();
        assert_eq!(after.active_deployment("testos").unwrap(), before);
    }

    #[test]
    fn run_requires_a_mounted_image() {
        let temp = TempDir::new().unwrap();
        let (mut context, action) = deploy_fixture(&temp);
        context.image_mnt_dir = None;
        assert!(action.run(&mut context).is_err());
    }
}
