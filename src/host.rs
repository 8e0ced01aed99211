//! Host introspection helpers.

use anyhow::{bail, Result};

/// The host CPU architecture in the naming scheme recipes use.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "x86" => "i386",
        other => other,
    }
}

/// Fail unless the process is running as root.
///
/// Loop devices, mounts and chroots all need it; checking up front gives a
/// readable error instead of a string of EPERMs.
pub fn require_root(what: &str) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        bail!("{} requires root privileges", what);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_architecture_is_known() {
        // Whatever the build host is, the mapping must return something
        // non-empty and stable.
        let arch = host_architecture();
        assert!(!arch.is_empty());
        assert_eq!(arch, host_architecture());
    }
}
