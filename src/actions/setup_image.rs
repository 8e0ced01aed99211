//! Create, attach and mount the target image file.
//!
//! The sparse image file is created on the host in `pre_machine` and its
//! path forwarded into the sandbox via the internal `--internal-image` flag.
//! Inside the sandbox `run` attaches a loop device, makes a filesystem and
//! mounts it; `cleanup` unmounts and detaches.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::process::Command;

use super::Action;
use crate::command;
use crate::context::BuildContext;
use crate::host::require_root;
use crate::sandbox::Machine;

#[derive(Debug, Deserialize)]
pub struct SetupImageAction {
    /// Image file name, created in the artifact directory.
    pub image: String,
    /// Image size, e.g. "2G" or "512M".
    pub size: String,
    #[serde(default = "default_fstype")]
    pub fstype: String,
    #[serde(default)]
    pub label: Option<String>,
}

fn default_fstype() -> String {
    "ext4".to_string()
}

/// Parse a size like "512M" or "2G" into bytes. Plain numbers are bytes.
fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim();
    let (digits, multiplier) = match size.chars().last() {
        Some('K') | Some('k') => (&size[..size.len() - 1], 1u64 << 10),
        Some('M') | Some('m') => (&size[..size.len() - 1], 1u64 << 20),
        Some('G') | Some('g') => (&size[..size.len() - 1], 1u64 << 30),
        _ => (size, 1),
    };
    let n: u64 = digits
        .parse()
        .with_context(|| format!("Invalid image size '{}'", size))?;
    if n == 0 {
        bail!("Image size must be non-zero");
    }
    Ok(n * multiplier)
}

impl Action for SetupImageAction {
    fn name(&self) -> &str {
        "setup-image"
    }

    fn verify(&self, _context: &BuildContext) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("setup-image: 'image' must not be empty");
        }
        parse_size(&self.size)?;
        if self.fstype.trim().is_empty() {
            bail!("setup-image: 'fstype' must not be empty");
        }
        Ok(())
    }

    fn pre_machine(
        &self,
        context: &mut BuildContext,
        _machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let path = context.artifact_dir.join(&self.image);
        let file = File::create(&path)
            .with_context(|| format!("Failed to create image file {}", path.display()))?;
        file.set_len(parse_size(&self.size)?)
            .with_context(|| format!("Failed to size image file {}", path.display()))?;

        context.image = Some(path.clone());
        args.push("--internal-image".to_string());
        args.push(path.display().to_string());
        Ok(())
    }

    fn run(&self, context: &mut BuildContext) -> Result<()> {
        require_root("setup-image")?;
        let image = context
            .image
            .clone()
            .context("setup-image: no image file (missing --internal-image?)")?;

        let loop_device = command::capture(
            "losetup",
            command_with_args("losetup", &["--show", "-f", &image.display().to_string()]),
        )?;
        if loop_device.is_empty() {
            bail!("losetup did not report a loop device");
        }
        context.image_loop_device = Some(loop_device.clone());

        let mut mkfs = Command::new(format!("mkfs.{}", self.fstype));
        if let Some(label) = &self.label {
            mkfs.arg("-L").arg(label);
        }
        mkfs.arg(&loop_device);
        command::stream("mkfs", mkfs)?;

        let mnt = context
            .root_dir
            .parent()
            .context("Root tree has no parent directory")?
            .join("mnt");
        fs::create_dir_all(&mnt)
            .with_context(|| format!("Failed to create mount point {}", mnt.display()))?;
        command::run("mount", "mount", &[&loop_device, &mnt.display().to_string()])?;
        context.image_mnt_dir = Some(mnt);

        let uuid = command::capture(
            "blkid",
            command_with_args("blkid", &["-o", "value", "-s", "UUID", &loop_device]),
        )?;
        if uuid.is_empty() {
            bail!("blkid did not report a filesystem UUID for {}", loop_device);
        }
        context.image_kernel_root = Some(format!("root=UUID={}", uuid));
        context.image_fstab = format!("UUID={} / {} defaults 0 1\n", uuid, self.fstype);
        Ok(())
    }

    fn cleanup(&self, context: &mut BuildContext) -> Result<()> {
        if let Some(mnt) = context.image_mnt_dir.take() {
            command::run("umount", "umount", &[&mnt.display().to_string()])?;
        }
        if let Some(loop_device) = context.image_loop_device.take() {
            command::run("losetup", "losetup", &["-d", &loop_device])?;
        }
        Ok(())
    }
}

fn command_with_args(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::NspawnMachine;
    use tempfile::TempDir;

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2M").unwrap(), 2 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert!(parse_size("").is_err());
        assert!(parse_size("0").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn verify_rejects_bad_config() {
        let temp = TempDir::new().unwrap();
        let context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        let action = SetupImageAction {
            image: "".to_string(),
            size: "1G".to_string(),
            fstype: "ext4".to_string(),
            label: None,
        };
        assert!(action.verify(&context).is_err());

        let action = SetupImageAction {
            image: "disk.img".to_string(),
            size: "huge".to_string(),
            fstype: "ext4".to_string(),
            label: None,
        };
        assert!(action.verify(&context).is_err());
    }

    #[test]
    fn pre_machine_creates_sparse_image_and_forwards_path() {
        let temp = TempDir::new().unwrap();
        let mut context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        let mut machine = NspawnMachine::new();
        let mut args = Vec::new();

        let action = SetupImageAction {
            image: "disk.img".to_string(),
            size: "4M".to_string(),
            fstype: "ext4".to_string(),
            label: Some("root".to_string()),
        };
        action
            .pre_machine(&mut context, &mut machine, &mut args)
            .unwrap();

        let image = temp.path().join("disk.img");
        assert_eq!(fs::metadata(&image).unwrap().len(), 4 << 20);
        assert_eq!(context.image.as_deref(), Some(image.as_path()));
        assert_eq!(
            args,
            vec!["--internal-image".to_string(), image.display().to_string()]
        );
    }

    #[test]
    fn cleanup_without_mount_is_a_no_op() {
        let temp = TempDir::new().unwrap();
        let mut context = BuildContext::new(
            temp.path().join("rootdir"),
            temp.path().to_path_buf(),
            temp.path().to_path_buf(),
            "amd64".to_string(),
        );
        let action = SetupImageAction {
            image: "disk.img".to_string(),
            size: "4M".to_string(),
            fstype: "ext4".to_string(),
            label: None,
        };
        action.cleanup(&mut context).unwrap();
    }
}
