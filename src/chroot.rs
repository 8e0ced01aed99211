//! Cross-architecture chroot runner.
//!
//! Runs a command inside a target root filesystem via `systemd-nspawn`. When
//! the target architecture differs from the host, a static qemu user-mode
//! interpreter is copied into the target tree first (at the same absolute
//! path it occupies on the host, so binfmt lookups resolve inside the
//! chroot) and removed again when the command finishes, pass or fail.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::command;
use crate::context::BuildContext;
use crate::host::host_architecture;
use crate::overlay::copy_file_atomic;

/// Target architecture → static interpreter binary. Data, not code: adding
/// an architecture means adding a row.
const QEMU_INTERPRETERS: &[(&str, &str)] = &[
    ("armhf", "/usr/bin/qemu-arm-static"),
    ("armel", "/usr/bin/qemu-arm-static"),
    ("arm", "/usr/bin/qemu-arm-static"),
    ("arm64", "/usr/bin/qemu-aarch64-static"),
];

/// Resolve the static interpreter needed to run `architecture` binaries on
/// this host. `Ok(None)` means the architecture runs natively.
///
/// An architecture this table doesn't know is a fatal setup error; a
/// mismatch must never be silently ignored.
pub fn interpreter_for(architecture: &str) -> Result<Option<&'static str>> {
    if architecture == host_architecture() {
        return Ok(None);
    }
    match QEMU_INTERPRETERS
        .iter()
        .find(|(arch, _)| *arch == architecture)
    {
        Some((_, interpreter)) => Ok(Some(interpreter)),
        None => bail!(
            "No interpreter known for architecture '{}' (host is {})",
            architecture,
            host_architecture()
        ),
    }
}

/// An interpreter binary injected into a target tree, removed on drop.
///
/// The guard covers every exit path out of the chroot invocation, including
/// command failure and error returns.
pub struct QemuBridge {
    target: Option<PathBuf>,
}

impl QemuBridge {
    /// Inject the interpreter for `architecture` into `root`, if one is
    /// needed.
    pub fn install(architecture: &str, root: &Path) -> Result<Self> {
        match interpreter_for(architecture)? {
            None => Ok(Self { target: None }),
            Some(interpreter) => Self::inject(Path::new(interpreter), root),
        }
    }

    /// Copy `source` into `root` at the same absolute path.
    fn inject(source: &Path, root: &Path) -> Result<Self> {
        let relative = source
            .strip_prefix("/")
            .with_context(|| format!("Interpreter path is not absolute: {}", source.display()))?;
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        copy_file_atomic(source, &target).with_context(|| {
            format!(
                "Failed to inject interpreter {} into target tree",
                source.display()
            )
        })?;
        Ok(Self {
            target: Some(target),
        })
    }
}

impl Drop for QemuBridge {
    fn drop(&mut self) {
        let Some(target) = &self.target else { return };
        if let Err(e) = fs::remove_file(target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                eprintln!(
                    "Failed to remove injected interpreter {}: {}",
                    target.display(),
                    e
                );
            }
        }
    }
}

/// Run `program args...` with the context's root tree as its root
/// filesystem, streaming output under `label`.
pub fn run_in_chroot(
    context: &BuildContext,
    label: &str,
    program: &str,
    args: &[&str],
) -> Result<()> {
    let _bridge = QemuBridge::install(&context.architecture, &context.root_dir)?;

    let mut cmd = Command::new("systemd-nspawn");
    cmd.arg("-q").arg("-D").arg(&context.root_dir).arg(program);
    cmd.args(args);
    command::stream(label, cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn interpreter_table_covers_arm_variants() {
        for arch in ["armhf", "armel", "arm"] {
            assert_eq!(
                interpreter_for(arch).unwrap(),
                Some("/usr/bin/qemu-arm-static")
            );
        }
        assert_eq!(
            interpreter_for("arm64").unwrap(),
            Some("/usr/bin/qemu-aarch64-static")
        );
    }

    #[test]
    fn native_architecture_needs_no_interpreter() {
        assert_eq!(interpreter_for(host_architecture()).unwrap(), None);
    }

    #[test]
    fn unknown_architecture_is_fatal() {
        let err = interpreter_for("m68k").unwrap_err();
        assert!(err.to_string().contains("m68k"));
    }

    #[test]
    fn bridge_injects_and_removes_on_drop() {
        let host = TempDir::new().unwrap();
        let fake = host.path().join("qemu-fake-static");
        fs::write(&fake, b"\x7fELF").unwrap();
        fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

        let root = TempDir::new().unwrap();
        let injected = root.path().join(fake.strip_prefix("/").unwrap());
        {
            let _bridge = QemuBridge::inject(&fake, root.path()).unwrap();
            assert!(injected.is_file());
            assert_eq!(
                fs::metadata(&injected).unwrap().permissions().mode() & 0o7777,
                0o755
            );
        }
        assert!(!injected.exists());
    }

    #[test]
    fn bridge_removes_interpreter_even_after_command_failure() {
        let host = TempDir::new().unwrap();
        let fake = host.path().join("qemu-fake-static");
        fs::write(&fake, b"\x7fELF").unwrap();

        let root = TempDir::new().unwrap();
        let injected = root.path().join(fake.strip_prefix("/").unwrap());

        let result: Result<()> = (|| {
            let _bridge = QemuBridge::inject(&fake, root.path())?;
            bail!("simulated chroot failure");
        })();
        assert!(result.is_err());
        assert!(!injected.exists());
    }

    #[test]
    fn no_bridge_file_for_native_runs() {
        let root = TempDir::new().unwrap();
        let bridge = QemuBridge::install(host_architecture(), root.path()).unwrap();
        assert!(bridge.target.is_none());
    }
}
