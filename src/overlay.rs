//! Crash-safe file-tree overlay engine.
//!
//! Copies a source tree onto a destination tree, file by file. Directories
//! are created with the source's permission bits; regular files are written
//! through a temporary file in the destination's parent and renamed into
//! place, so a destination path never observes a partially-written file.
//! Existing destination files are unconditionally replaced. Symlinks,
//! device nodes and other special files in the source are refused.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

/// Overlay `source` onto `dest`, preserving permission bits.
///
/// Traversal is depth-first with parents before children; it stops at the
/// first failure.
pub fn overlay_tree(source: &Path, dest: &Path) -> Result<()> {
    println!("Overlaying {} on {}", source.display(), dest.display());

    if !dest.exists() {
        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
    }

    for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("Path escapes source tree: {}", entry.path().display()))?;
        let target = dest.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            let mode = entry.metadata()?.permissions().mode();
            if !target.is_dir() {
                fs::DirBuilder::new()
                    .mode(mode)
                    .create(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
            }
        } else if file_type.is_file() {
            copy_file_atomic(entry.path(), &target)?;
        } else {
            bail!(
                "Unsupported file type in overlay source: {} (only directories and regular files)",
                entry.path().display()
            );
        }
    }

    Ok(())
}

/// Copy a regular file so the destination path flips atomically from the old
/// content (or absence) to the complete new content.
///
/// The temporary file lives in the destination's parent directory so the
/// final rename stays on one filesystem.
pub fn copy_file_atomic(src: &Path, dst: &Path) -> Result<()> {
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(tmp_name(".overlay"));

    let result = (|| -> Result<()> {
        fs::copy(src, &tmp).with_context(|| {
            format!("Failed to copy {} to {}", src.display(), tmp.display())
        })?;
        let perms = fs::metadata(src)
            .with_context(|| format!("Failed to stat {}", src.display()))?
            .permissions();
        fs::set_permissions(&tmp, perms)
            .with_context(|| format!("Failed to set permissions on {}", tmp.display()))?;
        fs::rename(&tmp, dst).with_context(|| {
            format!("Failed to rename {} to {}", tmp.display(), dst.display())
        })?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{n}")
}
