//! Kernel and rootfs image management
//!
//! The shared default images live in `kernels/` and `rootfs/`; every VM
//! boots from its own copy of the rootfs so guest writes never touch the
//! shared image. Downloading the defaults (`ensure_default_images`) is a
//! separate provisioning step, never part of the start path.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{Result, ResultExt, VmmError};

pub const DEFAULT_KERNEL_NAME: &str = "vmlinux.bin";
pub const DEFAULT_ROOTFS_NAME: &str = "rootfs.ext4";

pub struct ImageManager {
    kernel_dir: PathBuf,
    rootfs_dir: PathBuf,
    /// Where per-VM rootfs copies are written
    vm_dir: PathBuf,
}

impl ImageManager {
    pub fn new(kernel_dir: impl Into<PathBuf>, rootfs_dir: impl Into<PathBuf>, vm_dir: impl Into<PathBuf>) -> Self {
        Self {
            kernel_dir: kernel_dir.into(),
            rootfs_dir: rootfs_dir.into(),
            vm_dir: vm_dir.into(),
        }
    }

    pub fn default_kernel_path(&self) -> PathBuf {
        self.kernel_dir.join(DEFAULT_KERNEL_NAME)
    }

    pub fn default_rootfs_path(&self) -> PathBuf {
        self.rootfs_dir.join(DEFAULT_ROOTFS_NAME)
    }

    pub fn vm_rootfs_path(&self, vm_name: &str) -> PathBuf {
        self.vm_dir.join(format!("{}.ext4", vm_name))
    }

    /// Absolute path of the default kernel; `NotFound` until images are pulled
    pub fn resolve_default_kernel(&self) -> Result<PathBuf> {
        resolve_existing("default kernel", &self.default_kernel_path())
    }

    pub fn resolve_default_rootfs(&self) -> Result<PathBuf> {
        resolve_existing("default rootfs", &self.default_rootfs_path())
    }

    /// Copy the default rootfs for `vm_name`
    ///
    /// Idempotent: an existing copy is returned untouched, so a VM keeps its
    /// disk across stop/start and a retried start never re-copies.
    pub fn create_vm_rootfs(&self, vm_name: &str) -> Result<PathBuf> {
        let dst = self.vm_rootfs_path(vm_name);
        if dst.exists() {
            return Ok(dst);
        }

        let src = self.default_rootfs_path();
        if !src.exists() {
            return Err(VmmError::not_found_path("default rootfs", &src));
        }

        fs::create_dir_all(&self.vm_dir)?;
        info!(vm = %vm_name, "creating rootfs copy");

        // Copy to a temp name so an interrupted copy is never mistaken for a finished one
        let tmp = dst.with_extension("ext4.tmp");
        if let Err(e) = fs::copy(&src, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("copying rootfs for VM '{}'", vm_name));
        }
        fs::rename(&tmp, &dst).with_context(|| format!("finalizing rootfs {}", dst.display()))?;

        Ok(dst)
    }

    /// Remove the per-VM rootfs; already absent is success
    pub fn delete_vm_rootfs(&self, vm_name: &str) -> Result<()> {
        remove_if_exists(&self.vm_rootfs_path(vm_name))
    }

    pub fn list_kernels(&self) -> Result<BTreeSet<String>> {
        list_files(&self.kernel_dir)
    }

    pub fn list_rootfs(&self) -> Result<BTreeSet<String>> {
        list_files(&self.rootfs_dir)
    }

    /// Download the default kernel and rootfs if they are not present
    pub async fn ensure_default_images(&self, kernel_url: &str, rootfs_url: &str) -> Result<()> {
        let kernel = self.default_kernel_path();
        if !kernel.exists() {
            info!(url = kernel_url, "downloading default kernel");
            download_file(kernel_url, &kernel)
                .await
                .context("downloading kernel")?;
        }

        let rootfs = self.default_rootfs_path();
        if !rootfs.exists() {
            info!(url = rootfs_url, "downloading default rootfs (this may take a while)");
            download_file(rootfs_url, &rootfs)
                .await
                .context("downloading rootfs")?;
        }

        Ok(())
    }
}

fn resolve_existing(what: &str, path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(VmmError::NotFound(format!(
            "{} at {} (run `vmm images pull` first)",
            what,
            path.display()
        )));
    }
    Ok(fs::canonicalize(path)?)
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Plain files in `dir`; an absent directory is an empty set
fn list_files(dir: &Path) -> Result<BTreeSet<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };

    let mut files = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.insert(name.to_string());
        }
    }
    Ok(files)
}

/// Stream `url` into `{dest}.tmp`, then rename; the temp file never survives a failure
async fn download_file(url: &str, dest: &Path) -> Result<()> {
    if let Some(dir) = dest.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = async {
        let resp = reqwest::get(url).await?.error_for_status()?;
        let mut out = tokio::fs::File::create(&tmp).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        Ok::<(), VmmError>(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, dest).with_context(|| format!("renaming {}", dest.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> ImageManager {
        ImageManager::new(root.join("kernels"), root.join("rootfs"), root.join("vms"))
    }

    #[test]
    fn test_resolve_default_kernel_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path()).resolve_default_kernel().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_resolve_default_rootfs_is_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let images = manager(dir.path());
        fs::create_dir_all(dir.path().join("rootfs")).unwrap();
        fs::write(images.default_rootfs_path(), b"fs").unwrap();
        assert!(images.resolve_default_rootfs().unwrap().is_absolute());
    }

    #[test]
    fn test_create_vm_rootfs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let images = manager(dir.path());
        fs::create_dir_all(dir.path().join("rootfs")).unwrap();
        fs::write(images.default_rootfs_path(), b"original").unwrap();

        let first = images.create_vm_rootfs("t1").unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"original");

        // Guest writes to its copy; a second call must not overwrite them
        fs::write(&first, b"guest-modified").unwrap();
        let mtime = fs::metadata(&first).unwrap().modified().unwrap();

        let second = images.create_vm_rootfs("t1").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"guest-modified");
        assert_eq!(fs::metadata(&second).unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_create_vm_rootfs_source_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = manager(dir.path()).create_vm_rootfs("t1").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_vm_rootfs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let images = manager(dir.path());
        fs::create_dir_all(dir.path().join("vms")).unwrap();
        fs::write(images.vm_rootfs_path("t1"), b"x").unwrap();
        images.delete_vm_rootfs("t1").unwrap();
        images.delete_vm_rootfs("t1").unwrap();
        assert!(!images.vm_rootfs_path("t1").exists());
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(manager(dir.path()).list_kernels().unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let kernels = dir.path().join("kernels");
        fs::create_dir_all(kernels.join("nested")).unwrap();
        fs::write(kernels.join("vmlinux.bin"), b"k").unwrap();
        fs::write(kernels.join("vmlinux-6.1"), b"k").unwrap();

        let names = manager(dir.path()).list_kernels().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("vmlinux.bin"));
        assert!(!names.contains("nested"));
    }
}
