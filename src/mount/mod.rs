//! Host directory mount images
//!
//! A host directory is exposed to the guest as an extra ext4 block device
//! labelled with the mount's guest tag, so the guest can mount it by label
//! without knowing which vdX it landed on:
//!
//! ```text
//!  host                                  guest
//!  /home/me/src ──tar──► mounts/t1-code.ext4 ──drive mount0──► /dev/vdb (LABEL=code)
//! ```
//!
//! Images are rebuilt as an exact mirror of the host directory on every
//! sync. They grow when the directory grows and never shrink.

pub mod backend;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

pub use backend::{mount_loop, DiskBackend, LoopMount, ShellDiskBackend};

use crate::error::{Result, ResultExt, VmmError};
use crate::image::remove_if_exists;
use crate::vm::record::{validate_name, Mount};

pub const MB: u64 = 1024 * 1024;

/// Smallest image ever created
pub const MIN_IMAGE_MB: u64 = 16;

/// Directory reserved by ext4, kept across syncs
const RESERVED_DIR: &str = "lost+found";

pub struct MountManager {
    mounts_dir: PathBuf,
    backend: Arc<dyn DiskBackend>,
}

impl MountManager {
    pub fn new(mounts_dir: impl Into<PathBuf>, backend: Arc<dyn DiskBackend>) -> Self {
        Self {
            mounts_dir: mounts_dir.into(),
            backend,
        }
    }

    /// `{mounts_dir}/{vm_name}-{guest_tag}.ext4`
    pub fn image_path(&self, vm_name: &str, guest_tag: &str) -> PathBuf {
        self.mounts_dir.join(format!("{}-{}.ext4", vm_name, guest_tag))
    }

    /// Build a fresh image mirroring `mount.host_path`
    ///
    /// Any failure after the image file is created deletes the partial image.
    pub fn create_mount_image(&self, mount: &mut Mount, vm_name: &str) -> Result<()> {
        validate_host_dir(&mount.host_path)?;

        let image = self.image_path(vm_name, &mount.guest_tag);
        fs::create_dir_all(&self.mounts_dir)
            .with_context(|| format!("creating {}", self.mounts_dir.display()))?;

        let size_mb = required_size_mb(dir_size_bytes(&mount.host_path)?);
        info!(vm = %vm_name, tag = %mount.guest_tag, size_mb, "creating mount image");

        if let Err(e) = self.build_image(&mount.host_path, &image, size_mb, &mount.guest_tag) {
            if let Err(cleanup) = remove_if_exists(&image) {
                warn!(image = %image.display(), error = %cleanup, "failed to remove partial image");
            }
            return Err(e).with_context(|| {
                format!("creating mount image '{}' for VM '{}'", mount.guest_tag, vm_name)
            });
        }

        mount.image_path = Some(image);
        Ok(())
    }

    fn build_image(&self, host_dir: &Path, image: &Path, size_mb: u64, label: &str) -> Result<()> {
        self.backend.create_filesystem(image, size_mb, label)?;

        let mounted = mount_loop(self.backend.as_ref(), image)?;
        self.backend
            .archive_copy(host_dir, mounted.path())
            .context("copying files into mount image")?;
        mounted.unmount()
    }

    /// Refresh an existing image from the host directory's current contents
    ///
    /// Delegates to [`Self::create_mount_image`] when no image exists yet.
    /// Grows (never shrinks) the image when the directory outgrew it, then
    /// replaces everything but `lost+found` with a fresh copy.
    pub fn sync_mount_image(&self, mount: &mut Mount, vm_name: &str) -> Result<()> {
        let image = mount
            .image_path
            .clone()
            .unwrap_or_else(|| self.image_path(vm_name, &mount.guest_tag));

        if !image.exists() {
            return self.create_mount_image(mount, vm_name);
        }
        mount.image_path = Some(image.clone());

        validate_host_dir(&mount.host_path)?;

        let required_mb = required_size_mb(dir_size_bytes(&mount.host_path)?);
        let current_mb = fs::metadata(&image)
            .with_context(|| format!("reading size of {}", image.display()))?
            .len()
            / MB;

        if required_mb > current_mb {
            info!(vm = %vm_name, tag = %mount.guest_tag, from_mb = current_mb, to_mb = required_mb, "growing mount image");
            if let Err(e) = self.backend.check_filesystem(&image) {
                warn!(image = %image.display(), error = %e, "filesystem check failed, resizing anyway");
            }
            self.backend
                .grow_filesystem(&image, required_mb)
                .with_context(|| format!("growing {}", image.display()))?;
        }

        info!(vm = %vm_name, tag = %mount.guest_tag, "syncing mount image");
        let mounted = mount_loop(self.backend.as_ref(), &image)?;
        clear_dir(mounted.path())?;
        self.backend
            .archive_copy(&mount.host_path, mounted.path())
            .with_context(|| format!("copying {} into mount image", mount.host_path.display()))?;
        mounted.unmount()
    }

    /// Remove one image; already absent is success
    pub fn delete_mount_image(&self, vm_name: &str, guest_tag: &str) -> Result<()> {
        remove_if_exists(&self.image_path(vm_name, guest_tag))
    }

    pub fn delete_all_mount_images(&self, vm_name: &str, mounts: &[Mount]) -> Result<()> {
        for mount in mounts {
            self.delete_mount_image(vm_name, &mount.guest_tag)?;
        }
        Ok(())
    }
}

fn validate_host_dir(host_path: &Path) -> Result<()> {
    let meta = fs::metadata(host_path).map_err(|_| {
        VmmError::InvalidInput(format!("host path '{}' does not exist", host_path.display()))
    })?;
    if !meta.is_dir() {
        return Err(VmmError::InvalidInput(format!(
            "host path '{}' is not a directory",
            host_path.display()
        )));
    }
    Ok(())
}

/// Remove every entry of a mounted image except the ext4 recovery directory
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        if entry.file_name() == RESERVED_DIR {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.with_context(|| format!("removing {}", path.display()))?;
    }
    Ok(())
}

/// Total size of non-directory entries under `path`; symlinks are not followed
pub fn dir_size_bytes(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path).with_context(|| format!("reading {}", path.display()))? {
        let entry = entry?;
        let meta = fs::symlink_metadata(entry.path())?;
        if meta.is_dir() {
            total += dir_size_bytes(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Image size for `bytes` of content: whole MB rounded up, +20% for ext4
/// metadata and journal, at least [`MIN_IMAGE_MB`]
pub fn required_size_mb(bytes: u64) -> u64 {
    let content_mb = bytes.div_ceil(MB);
    let inflated = (content_mb * 6).div_ceil(5);
    inflated.max(MIN_IMAGE_MB)
}

/// Parse `host_path:guest_tag[:ro|rw]`
///
/// Scans from the right: the host path may itself contain colons
/// (`C:\data`, `smb://host/share`), the tag and mode never do.
pub fn parse_mount_spec(spec: &str) -> Result<Mount> {
    let invalid = || {
        VmmError::InvalidInput(format!(
            "invalid mount spec '{}': expected format 'host_path:tag[:ro|rw]'",
            spec
        ))
    };

    let (rest, last) = spec.rsplit_once(':').ok_or_else(invalid)?;
    let (host_path, guest_tag, read_only) = match last {
        // `dir:ro` with no further colon names a tag called `ro`
        "ro" | "rw" => match rest.rsplit_once(':') {
            Some((path, tag)) => (path, tag, last == "ro"),
            None => (rest, last, false),
        },
        tag => (rest, tag, false),
    };

    if host_path.is_empty() {
        return Err(invalid());
    }
    validate_name("mount tag", guest_tag)?;

    if !Path::new(host_path).exists() {
        return Err(VmmError::NotFound(format!("host path '{}'", host_path)));
    }

    Ok(Mount::new(host_path, guest_tag, read_only))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let spec = format!("{}:code:ro", dir.path().display());
        let mount = parse_mount_spec(&spec).unwrap();
        assert_eq!(mount.host_path, dir.path());
        assert_eq!(mount.guest_tag, "code");
        assert!(mount.read_only);
    }

    #[test]
    fn test_parse_defaults_to_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let mount = parse_mount_spec(&format!("{}:code", dir.path().display())).unwrap();
        assert!(!mount.read_only);

        let mount = parse_mount_spec(&format!("{}:code:rw", dir.path().display())).unwrap();
        assert!(!mount.read_only);
    }

    #[test]
    fn test_parse_path_containing_colons() {
        let dir = tempfile::tempdir().unwrap();
        let colon_dir = dir.path().join("C:\\data");
        fs::create_dir(&colon_dir).unwrap();

        let mount = parse_mount_spec(&format!("{}:code:rw", colon_dir.display())).unwrap();
        assert_eq!(mount.host_path, colon_dir);
        assert_eq!(mount.guest_tag, "code");
        assert!(!mount.read_only);

        let mount = parse_mount_spec(&format!("{}:data", colon_dir.display())).unwrap();
        assert_eq!(mount.host_path, colon_dir);
        assert_eq!(mount.guest_tag, "data");
    }

    #[test]
    fn test_parse_mode_word_alone_is_a_tag() {
        let dir = tempfile::tempdir().unwrap();
        let mount = parse_mount_spec(&format!("{}:ro", dir.path().display())).unwrap();
        assert_eq!(mount.host_path, dir.path());
        assert_eq!(mount.guest_tag, "ro");
        assert!(!mount.read_only);

        let mount = parse_mount_spec(&format!("{}:rw", dir.path().display())).unwrap();
        assert_eq!(mount.guest_tag, "rw");
        assert!(!mount.read_only);
    }

    #[test]
    fn test_parse_invalid_tag() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_mount_spec(&format!("{}:code!", dir.path().display())).unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[test]
    fn test_parse_missing_tag() {
        assert!(parse_mount_spec("/data").unwrap_err().is_invalid_input());
        assert!(parse_mount_spec(":code").unwrap_err().is_invalid_input());
    }

    #[test]
    fn test_parse_missing_host_path() {
        let err = parse_mount_spec("/definitely/not/here:code:ro").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_required_size_for_10mb() {
        assert_eq!(required_size_mb(10_485_760), 16);
    }

    #[test]
    fn test_required_size_inflates_and_rounds_up() {
        assert_eq!(required_size_mb(0), 16);
        // 20 MB → 24 MB
        assert_eq!(required_size_mb(20 * MB), 24);
        // 20 MB + 1 byte → 21 MB → ceil(25.2) = 26
        assert_eq!(required_size_mb(20 * MB + 1), 26);
    }

    #[test]
    fn test_dir_size_excludes_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), vec![0u8; 1000]).unwrap();
        fs::write(dir.path().join("sub/b"), vec![0u8; 24]).unwrap();
        assert_eq!(dir_size_bytes(dir.path()).unwrap(), 1024);
    }

    #[test]
    fn test_clear_dir_keeps_lost_and_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(RESERVED_DIR)).unwrap();
        fs::create_dir(dir.path().join("old")).unwrap();
        fs::write(dir.path().join("old/file"), b"x").unwrap();
        fs::write(dir.path().join("stale"), b"x").unwrap();

        clear_dir(dir.path()).unwrap();

        let left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from(RESERVED_DIR)]);
    }
}
