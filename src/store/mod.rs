//! Content-addressed tree repository with transactional commits.
//!
//! Backing store for the `ostree-commit` / `ostree-deploy` actions:
//! filesystem trees are committed under branch names, pulled between
//! repositories, and resolved to content-hash revisions.
//!
//! Layout:
//! - `objects/sha256/<2-char prefix>/<hash>` — file blobs and commit objects
//! - `refs/heads/<branch>` — branch heads (one hex revision per file)
//! - `refs/remotes/<remote>/<branch>` — heads learned via pull
//! - `remotes/<name>.toml` — named pull sources
//! - `tmp/`, `locks/` — transaction scratch and the repo lock
//!
//! Atomicity: a commit writes all of its objects into a transaction staging
//! directory; `Transaction::complete` publishes the objects and then updates
//! the branch ref by atomic rename. Readers either see the old head or the
//! new one, never a partial commit. An uncompleted transaction leaves no
//! trace beyond its staging directory, which is removed on drop.

pub mod sysroot;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::os::unix::fs::{symlink, DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::overlay::copy_file_atomic;

const CONFIG_FILE: &str = "config";

/// Options for registering a pull remote.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteOptions {
    /// Skip signature verification when pulling from this remote.
    pub no_gpg_verify: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteConfig {
    url: String,
    no_gpg_verify: bool,
}

/// What kind of tree entry a commit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// One path in a committed tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    /// Blob hash, for regular files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Link target, for symlinks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A commit object: metadata plus the full tree manifest, sorted by path.
/// The commit's revision is the sha256 of its serialized form.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitObject {
    pub subject: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub tree: Vec<TreeEntry>,
}

/// A content-addressed repository on disk.
#[derive(Debug, Clone)]
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    /// Open an existing repository.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join(CONFIG_FILE).is_file() {
            bail!("No repository at {}", path.display());
        }
        Ok(Self {
            root: path.to_path_buf(),
        })
    }

    /// Create a repository at `path` (which must not already hold one).
    pub fn create(path: &Path) -> Result<Self> {
        if path.join(CONFIG_FILE).is_file() {
            bail!("Repository already exists at {}", path.display());
        }
        let repo = Self {
            root: path.to_path_buf(),
        };
        repo.ensure_layout()?;
        fs::write(path.join(CONFIG_FILE), "[core]\nmode = \"archive\"\n")
            .with_context(|| format!("Failed to write repo config in {}", path.display()))?;
        Ok(repo)
    }

    pub fn open_or_create(path: &Path) -> Result<Self> {
        if path.join(CONFIG_FILE).is_file() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("objects/sha256"))?;
        fs::create_dir_all(self.root.join("refs/heads"))?;
        fs::create_dir_all(self.root.join("refs/remotes"))?;
        fs::create_dir_all(self.root.join("remotes"))?;
        fs::create_dir_all(self.tmp_dir())?;
        fs::create_dir_all(self.root.join("locks"))?;
        Ok(())
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn object_path(&self, sha256: &str) -> PathBuf {
        self.root
            .join("objects/sha256")
            .join(&sha256[0..2])
            .join(sha256)
    }

    fn has_object(&self, sha256: &str) -> bool {
        is_hex_64(sha256) && self.object_path(sha256).is_file()
    }

    fn read_object(&self, sha256: &str) -> Result<Vec<u8>> {
        validate_rev(sha256)?;
        fs::read(self.object_path(sha256))
            .with_context(|| format!("Missing object {} in {}", sha256, self.root.display()))
    }

    /// Begin a transaction. Holds the repository lock until completed or
    /// dropped.
    pub fn prepare_transaction(&self) -> Result<Transaction<'_>> {
        let lock_path = self.root.join("locks/repo.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file {}", lock_path.display()))?;
        if lock_file.try_lock_exclusive().is_err() {
            bail!(
                "Repository is locked by another transaction: {}",
                self.root.display()
            );
        }

        let staging = self.tmp_dir().join(tmp_name("txn"));
        fs::create_dir_all(&staging)
            .with_context(|| format!("Failed to create staging dir {}", staging.display()))?;

        Ok(Transaction {
            repo: self,
            staging,
            _lock: lock_file,
            pending_refs: Vec::new(),
            completed: false,
        })
    }

    /// Resolve a branch name to its revision, checking local heads first and
    /// remote refs second.
    pub fn resolve_rev(&self, branch: &str) -> Result<String> {
        validate_ref(branch)?;
        if let Some(rev) = self.read_ref(&format!("heads/{}", branch))? {
            return Ok(rev);
        }
        let remotes_dir = self.root.join("refs/remotes");
        if remotes_dir.is_dir() {
            for entry in fs::read_dir(&remotes_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(rev) = self.read_ref(&format!("remotes/{}/{}", name, branch))? {
                    return Ok(rev);
                }
            }
        }
        bail!("No such branch '{}' in {}", branch, self.root.display());
    }

    /// Register a named pull source. Re-adding with the same URL is a no-op;
    /// a different URL for an existing name is an error (one remote per
    /// name).
    pub fn remote_add(&self, name: &str, url: &str, options: RemoteOptions) -> Result<()> {
        validate_ref(name)?;
        if name.contains('/') {
            bail!("Remote name must not contain '/': {}", name);
        }
        let path = self.root.join("remotes").join(format!("{}.toml", name));
        if path.is_file() {
            let existing: RemoteConfig = toml::from_str(&fs::read_to_string(&path)?)
                .with_context(|| format!("Failed to parse remote config {}", path.display()))?;
            if existing.url == url {
                return Ok(());
            }
            bail!(
                "Remote '{}' already exists with url {} (requested {})",
                name,
                existing.url,
                url
            );
        }
        let config = RemoteConfig {
            url: url.to_string(),
            no_gpg_verify: options.no_gpg_verify,
        };
        let bytes = toml::to_string_pretty(&config)?;
        let tmp = self.tmp_dir().join(tmp_name("remote"));
        fs::write(&tmp, bytes)?;
        atomic_rename(&tmp, &path)?;
        Ok(())
    }

    /// Pull `branch` from the repository at `url` (a local path or
    /// `file://` URL), publishing it as `refs/remotes/<remote_name>/<branch>`.
    ///
    /// Objects are copied blob by blob; the remote ref is written last, so a
    /// interrupted pull never publishes a branch whose objects are missing.
    pub fn pull(&self, url: &str, remote_name: &str, branch: &str) -> Result<()> {
        validate_ref(remote_name)?;
        validate_ref(branch)?;
        let source = Repo::open(&url_to_path(url)?)
            .with_context(|| format!("Failed to open pull source {}", url))?;
        let rev = source.resolve_rev(branch)?;

        let commit = source.read_commit(&rev)?;
        for entry in &commit.tree {
            let Some(sha) = &entry.content else { continue };
            if self.has_object(sha) {
                continue;
            }
            self.adopt_object(sha, &source.read_object(sha)?)?;
        }
        if !self.has_object(&rev) {
            self.adopt_object(&rev, &source.read_object(&rev)?)?;
        }

        self.write_ref(&format!("remotes/{}/{}", remote_name, branch), &rev)
    }

    /// Parse the commit object for `rev`.
    pub fn read_commit(&self, rev: &str) -> Result<CommitObject> {
        let bytes = self.read_object(rev)?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt commit object {} in {}", rev, self.root.display()))
    }

    /// Materialize the tree of `rev` into `dest` (created if missing), with
    /// the committed permission bits.
    pub fn checkout(&self, rev: &str, dest: &Path) -> Result<()> {
        let commit = self.read_commit(rev)?;
        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        // Entries are sorted by path, so parents precede children.
        for entry in &commit.tree {
            let target = dest.join(&entry.path);
            match entry.kind {
                EntryKind::Dir => {
                    if !target.is_dir() {
                        fs::DirBuilder::new()
                            .mode(entry.mode)
                            .create(&target)
                            .with_context(|| format!("Failed to create {}", target.display()))?;
                    }
                }
                EntryKind::File => {
                    let sha = entry.content.as_deref().with_context(|| {
                        format!("Commit {} has file entry '{}' without content", rev, entry.path)
                    })?;
                    let blob = self.object_path(sha);
                    if !blob.is_file() {
                        bail!("Missing blob {} for '{}'", sha, entry.path);
                    }
                    copy_file_atomic(&blob, &target)?;
                    fs::set_permissions(&target, fs::Permissions::from_mode(entry.mode))?;
                }
                EntryKind::Symlink => {
                    let link_target = entry.target.as_deref().with_context(|| {
                        format!("Commit {} has symlink entry '{}' without target", rev, entry.path)
                    })?;
                    if target.symlink_metadata().is_ok() {
                        fs::remove_file(&target)?;
                    }
                    symlink(link_target, &target).with_context(|| {
                        format!("Failed to create symlink {}", target.display())
                    })?;
                }
            }
        }
        Ok(())
    }

    fn adopt_object(&self, sha256: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.tmp_dir().join(tmp_name("object"));
        fs::write(&tmp, bytes)?;
        atomic_rename(&tmp, &self.object_path(sha256))
    }

    fn read_ref(&self, relative: &str) -> Result<Option<String>> {
        let path = self.root.join("refs").join(relative);
        if !path.is_file() {
            return Ok(None);
        }
        let rev = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read ref {}", path.display()))?
            .trim()
            .to_string();
        validate_rev(&rev)?;
        Ok(Some(rev))
    }

    fn write_ref(&self, relative: &str, rev: &str) -> Result<()> {
        validate_rev(rev)?;
        let path = self.root.join("refs").join(relative);
        let tmp = self.tmp_dir().join(tmp_name("ref"));
        fs::write(&tmp, format!("{}\n", rev))?;
        atomic_rename(&tmp, &path)
    }
}

/// An open commit transaction: staged objects plus the branch updates to
/// publish on completion.
pub struct Transaction<'a> {
    repo: &'a Repo,
    staging: PathBuf,
    _lock: File,
    pending_refs: Vec<(String, String)>,
    completed: bool,
}

impl<'a> Transaction<'a> {
    /// Commit the tree at `tree` under `branch` with a human-readable
    /// subject, returning the new revision. Nothing is visible to readers
    /// until [`Transaction::complete`].
    pub fn commit(&mut self, tree: &Path, branch: &str, subject: &str) -> Result<String> {
        validate_ref(branch)?;
        let entries = self.stage_tree(tree)?;

        let commit = CommitObject {
            subject: subject.to_string(),
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            parent: self.repo.read_ref(&format!("heads/{}", branch))?,
            tree: entries,
        };
        let bytes = serde_json::to_vec(&commit).context("Failed to serialize commit")?;
        let rev = sha256_bytes(&bytes);
        fs::write(self.staging.join(&rev), &bytes)
            .with_context(|| format!("Failed to stage commit object {}", rev))?;

        self.pending_refs.push((branch.to_string(), rev.clone()));
        Ok(rev)
    }

    /// Publish the staged objects, then flip the branch refs. The ref
    /// renames are the visibility point; a failure before them leaves every
    /// branch at its previous head.
    pub fn complete(mut self) -> Result<()> {
        self.completed = true;

        for entry in fs::read_dir(&self.staging)
            .with_context(|| format!("Failed to read staging dir {}", self.staging.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_hex_64(&name) {
                continue;
            }
            let dest = self.repo.object_path(&name);
            if dest.is_file() {
                let _ = fs::remove_file(entry.path());
            } else {
                atomic_rename(&entry.path(), &dest)?;
            }
        }

        for (branch, rev) in &self.pending_refs {
            self.repo.write_ref(&format!("heads/{}", branch), rev)?;
        }

        let _ = fs::remove_dir_all(&self.staging);
        Ok(())
    }

    fn stage_tree(&self, tree: &Path) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();

        for entry in WalkDir::new(tree).follow_links(false).min_depth(1) {
            let entry =
                entry.with_context(|| format!("Failed to walk tree {}", tree.display()))?;
            let rel = entry
                .path()
                .strip_prefix(tree)
                .with_context(|| format!("Path escapes tree: {}", entry.path().display()))?
                .to_string_lossy()
                .to_string();
            let metadata = entry.metadata()?;
            let mode = metadata.permissions().mode() & 0o7777;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                entries.push(TreeEntry {
                    path: rel,
                    kind: EntryKind::Dir,
                    mode,
                    content: None,
                    target: None,
                });
            } else if file_type.is_file() {
                let sha = self.stage_blob(entry.path())?;
                entries.push(TreeEntry {
                    path: rel,
                    kind: EntryKind::File,
                    mode,
                    content: Some(sha),
                    target: None,
                });
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                entries.push(TreeEntry {
                    path: rel,
                    kind: EntryKind::Symlink,
                    mode,
                    content: None,
                    target: Some(target.to_string_lossy().to_string()),
                });
            } else {
                bail!(
                    "Unsupported file type in commit tree: {} (remove device/special files before committing)",
                    entry.path().display()
                );
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn stage_blob(&self, path: &Path) -> Result<String> {
        let (sha, _size) = sha256_file(path)?;
        if !self.repo.has_object(&sha) && !self.staging.join(&sha).is_file() {
            fs::copy(path, self.staging.join(&sha))
                .with_context(|| format!("Failed to stage blob for {}", path.display()))?;
        }
        Ok(sha)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.completed {
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

fn url_to_path(url: &str) -> Result<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        Ok(PathBuf::from(rest))
    } else if url.contains("://") {
        bail!("Only file:// and local-path pull sources are supported, got '{}'", url)
    } else {
        Ok(PathBuf::from(url))
    }
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{n}")
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(src, dst)
        .with_context(|| format!("Failed to rename {} to {}", src.display(), dst.display()))
}

fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn validate_rev(rev: &str) -> Result<()> {
    if !is_hex_64(rev) {
        bail!("Invalid revision: {}", rev);
    }
    Ok(())
}

fn validate_ref(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("Ref name must not be empty");
    }
    if name.starts_with('/') || name.contains("..") || name.contains('\\') {
        bail!("Invalid ref name: {}", name);
    }
    Ok(())
}
