//! Deployment side of the store: sysroot layout inside a target image.
//!
//! A sysroot hosts a repository plus checked-out deployments at
//! `ostree/deploy/<os>/deploy/<revision>.<serial>`. Exactly one deployment
//! per os name is active; switching is a single atomic rename of the
//! active-deployment record, so a crash mid-deploy leaves the previous
//! deployment in charge.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::Repo;

/// A checked-out revision inside a sysroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub osname: String,
    pub csum: String,
    pub serial: u32,
}

impl Deployment {
    /// Directory of this deployment, relative to the sysroot root.
    pub fn dirpath(&self) -> PathBuf {
        PathBuf::from("ostree/deploy")
            .join(&self.osname)
            .join("deploy")
            .join(format!("{}.{}", self.csum, self.serial))
    }

    fn record(&self) -> String {
        format!("{}.{}", self.csum, self.serial)
    }
}

/// Origin metadata written next to each deployment: where it came from and
/// which kernel arguments it boots with.
#[derive(Debug, Serialize, Deserialize)]
pub struct Origin {
    pub refspec: String,
    pub kargs: Vec<String>,
}

/// A deployment store rooted at an image mount point.
#[derive(Debug)]
pub struct Sysroot {
    root: PathBuf,
    deployments: Vec<Deployment>,
}

impl Sysroot {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            deployments: Vec::new(),
        }
    }

    /// Create the on-disk store layout (repository, deploy and boot
    /// directories). Idempotent.
    pub fn init_fs(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("ostree/deploy"))?;
        fs::create_dir_all(self.root.join("boot"))?;
        let repo_path = self.repo_path();
        if !repo_path.join("config").is_file() {
            Repo::create(&repo_path)?;
        }
        Ok(())
    }

    /// Register an os name identity. Idempotent.
    pub fn init_osname(&self, os: &str) -> Result<()> {
        validate_osname(os)?;
        let base = self.root.join("ostree/deploy").join(os);
        fs::create_dir_all(base.join("deploy"))?;
        fs::create_dir_all(base.join("var"))?;
        Ok(())
    }

    /// Path of the sysroot's own repository. Callers open it directly by
    /// path; going through a higher-level handle makes config resolution
    /// ambiguous between the store-local and system-wide locations.
    pub fn repo_path(&self) -> PathBuf {
        self.root.join("ostree/repo")
    }

    /// Re-read deployment state from disk. Required after pulling into the
    /// sysroot repository so later steps see the new data.
    pub fn load(&mut self) -> Result<()> {
        self.deployments.clear();
        let deploy_root = self.root.join("ostree/deploy");
        if !deploy_root.is_dir() {
            return Ok(());
        }
        for os_entry in fs::read_dir(&deploy_root)? {
            let os_entry = os_entry?;
            if !os_entry.file_type()?.is_dir() {
                continue;
            }
            let osname = os_entry.file_name().to_string_lossy().to_string();
            let deploy_dir = os_entry.path().join("deploy");
            if !deploy_dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&deploy_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some((csum, serial)) = parse_deployment_name(&name) {
                    self.deployments.push(Deployment {
                        osname: osname.clone(),
                        csum,
                        serial,
                    });
                }
            }
        }
        Ok(())
    }

    /// Check out `revision` as a new deployment for `os`, recording its
    /// origin refspec and kernel arguments. The checkout happens in a
    /// scratch directory and is renamed into place; does NOT touch the
    /// active-deployment record.
    pub fn deploy_tree(
        &mut self,
        os: &str,
        revision: &str,
        refspec: &str,
        kargs: &[String],
    ) -> Result<Deployment> {
        validate_osname(os)?;
        let repo = Repo::open(&self.repo_path())?;

        let serial = self.next_serial(os, revision);
        let deployment = Deployment {
            osname: os.to_string(),
            csum: revision.to_string(),
            serial,
        };

        let final_dir = self.root.join(deployment.dirpath());
        let parent = final_dir
            .parent()
            .context("Deployment path has no parent")?
            .to_path_buf();
        fs::create_dir_all(&parent)?;

        let scratch = parent.join(tmp_name("deploy"));
        let result = repo.checkout(revision, &scratch);
        if result.is_err() {
            let _ = fs::remove_dir_all(&scratch);
        }
        result?;
        fs::rename(&scratch, &final_dir).with_context(|| {
            format!("Failed to move deployment into place at {}", final_dir.display())
        })?;

        let origin = Origin {
            refspec: refspec.to_string(),
            kargs: kargs.to_vec(),
        };
        let origin_path = parent.join(format!("{}.origin", deployment.record()));
        fs::write(&origin_path, toml::to_string_pretty(&origin)?)
            .with_context(|| format!("Failed to write {}", origin_path.display()))?;

        self.deployments.push(deployment.clone());
        Ok(deployment)
    }

    /// Atomically make `deployment` the active deployment for `os`. This is
    /// the single switch-over point of the whole deploy protocol.
    pub fn write_deployment(&self, os: &str, deployment: &Deployment) -> Result<()> {
        if deployment.osname != os {
            bail!(
                "Deployment belongs to os '{}', not '{}'",
                deployment.osname,
                os
            );
        }
        let dir = self.root.join("ostree/deploy").join(os);
        let current = dir.join("current");
        let tmp = dir.join(tmp_name("current"));
        fs::write(&tmp, format!("{}\n", deployment.record()))
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &current)
            .with_context(|| format!("Failed to activate deployment for '{}'", os))?;
        Ok(())
    }

    /// The currently active deployment for `os`, if any.
    pub fn active_deployment(&self, os: &str) -> Result<Option<Deployment>> {
        let current = self.root.join("ostree/deploy").join(os).join("current");
        if !current.is_file() {
            return Ok(None);
        }
        let record = fs::read_to_string(&current)
            .with_context(|| format!("Failed to read {}", current.display()))?;
        let record = record.trim();
        let (csum, serial) = parse_deployment_name(record)
            .with_context(|| format!("Corrupt active-deployment record: '{}'", record))?;
        Ok(Some(Deployment {
            osname: os.to_string(),
            csum,
            serial,
        }))
    }

    fn next_serial(&self, os: &str, revision: &str) -> u32 {
        self.deployments
            .iter()
            .filter(|d| d.osname == os && d.csum == revision)
            .map(|d| d.serial + 1)
            .max()
            .unwrap_or(0)
    }
}

fn parse_deployment_name(name: &str) -> Option<(String, u32)> {
    let (csum, serial) = name.rsplit_once('.')?;
    if !super::is_hex_64(csum) {
        return None;
    }
    Some((csum.to_string(), serial.parse().ok()?))
}

fn validate_osname(os: &str) -> Result<()> {
    if os.is_empty() {
        bail!("os name must not be empty");
    }
    if os.contains('/') || os.contains("..") {
        bail!("os name must be a plain name: {}", os);
    }
    Ok(())
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".{prefix}-{n}")
}
