//! Disk image backend
//!
//! The only genuinely OS-specific part of mount image handling: sparse
//! files, ext4, loop mounts and tar pipes. [`ShellDiskBackend`] shells out
//! to the usual tools; tests substitute an in-process fake so the sizing
//! and sync logic runs without root.
//!
//! Loop mounts are always taken through [`mount_loop`], which returns a
//! [`LoopMount`] guard. The guard unmounts and removes its temporary mount
//! point on every exit path, so an error halfway through a copy never
//! leaves a dangling loop device or a stray directory behind.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Result, ResultExt, VmmError};

/// Filesystem operations on image files
pub trait DiskBackend: Send + Sync {
    /// Allocate a sparse file of `size_mb` and format it ext4 with `label`
    fn create_filesystem(&self, image: &Path, size_mb: u64, label: &str) -> Result<()>;

    /// Loop-mount `image` on the existing directory `mount_point`
    fn mount(&self, image: &Path, mount_point: &Path) -> Result<()>;

    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Consistency check (`e2fsck -f -y`)
    fn check_filesystem(&self, image: &Path) -> Result<()>;

    /// Grow the file to `new_size_mb` and the filesystem to fill it
    fn grow_filesystem(&self, image: &Path, new_size_mb: u64) -> Result<()>;

    /// Copy the contents of `src` into `dst`, preserving modes, ownership,
    /// symlinks and device nodes
    fn archive_copy(&self, src: &Path, dst: &Path) -> Result<()>;
}

/// A mounted image; unmounted when dropped or via [`LoopMount::unmount`]
pub struct LoopMount<'a> {
    backend: &'a dyn DiskBackend,
    dir: Option<TempDir>,
}

/// Mount `image` on a fresh temporary directory
pub fn mount_loop<'a>(backend: &'a dyn DiskBackend, image: &Path) -> Result<LoopMount<'a>> {
    let dir = tempfile::Builder::new()
        .prefix("vmm-mount-")
        .tempdir()
        .context("creating temporary mount point")?;

    backend
        .mount(image, dir.path())
        .with_context(|| format!("mounting {}", image.display()))?;
    debug!(image = %image.display(), mount_point = %dir.path().display(), "loop mounted");

    Ok(LoopMount {
        backend,
        dir: Some(dir),
    })
}

impl LoopMount<'_> {
    pub fn path(&self) -> &Path {
        self.dir.as_ref().map(|d| d.path()).unwrap_or_else(|| Path::new(""))
    }

    /// Unmount now and report failure, instead of only logging it on drop
    pub fn unmount(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };

        match self.backend.unmount(dir.path()) {
            Ok(()) => {
                // Mount point is empty again; TempDir removes it
                drop(dir);
                Ok(())
            }
            Err(e) => {
                // Still mounted: recursive removal would delete the image contents
                #[allow(deprecated)]
                let leaked = dir.into_path();
                Err(e).with_context(|| format!("unmounting {}", leaked.display()))
            }
        }
    }
}

impl Drop for LoopMount<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to unmount loop mount");
        }
    }
}

/// Real backend: truncate, mkfs.ext4, mount, umount, e2fsck, resize2fs, tar
pub struct ShellDiskBackend;

impl ShellDiskBackend {
    fn truncate(image: &Path, size_mb: u64) -> Result<()> {
        run_tool(
            Command::new("truncate")
                .arg("-s")
                .arg(format!("{}M", size_mb))
                .arg(image),
            "truncate",
        )
    }
}

impl DiskBackend for ShellDiskBackend {
    fn create_filesystem(&self, image: &Path, size_mb: u64, label: &str) -> Result<()> {
        Self::truncate(image, size_mb)?;
        run_tool(
            Command::new("mkfs.ext4").arg("-F").arg("-L").arg(label).arg(image),
            "mkfs.ext4",
        )
    }

    fn mount(&self, image: &Path, mount_point: &Path) -> Result<()> {
        run_tool(
            Command::new("mount").arg("-o").arg("loop").arg(image).arg(mount_point),
            "mount",
        )
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        run_tool(Command::new("umount").arg(mount_point), "umount")
    }

    fn check_filesystem(&self, image: &Path) -> Result<()> {
        // e2fsck exits 1 when it corrected errors; only >= 4 is a failure
        let output = Command::new("e2fsck")
            .arg("-f")
            .arg("-y")
            .arg(image)
            .output()
            .context("spawning e2fsck")?;
        match output.status.code() {
            Some(code) if code < 4 => Ok(()),
            _ => Err(tool_failure("e2fsck", &output)),
        }
    }

    fn grow_filesystem(&self, image: &Path, new_size_mb: u64) -> Result<()> {
        Self::truncate(image, new_size_mb)?;
        run_tool(Command::new("resize2fs").arg(image), "resize2fs")
    }

    fn archive_copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut create = Command::new("tar")
            .arg("-cf")
            .arg("-")
            .arg("-C")
            .arg(src)
            .arg(".")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning tar (create)")?;

        let Some(archive) = create.stdout.take() else {
            let _ = create.kill();
            let _ = create.wait();
            return Err(VmmError::ExternalToolFailure {
                tool: "tar".to_string(),
                status: "no stdout".to_string(),
                output: String::new(),
            });
        };

        let extract = Command::new("tar")
            .arg("-xf")
            .arg("-")
            .arg("-C")
            .arg(dst)
            .stdin(Stdio::from(archive))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let extract = match extract {
            Ok(child) => child,
            Err(e) => {
                let _ = create.kill();
                let _ = create.wait();
                return Err(e).context("spawning tar (extract)");
            }
        };

        // Drained concurrently: a full stderr pipe would stall `tar -c` and with it `tar -x`
        let create_stderr = create.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let extracted = extract.wait_with_output().context("waiting for tar (extract)")?;
        let status = create.wait().context("waiting for tar (create)")?;
        let stderr = create_stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let created = Output {
                status,
                stdout: Vec::new(),
                stderr,
            };
            return Err(tool_failure("tar -c", &created));
        }
        if !extracted.status.success() {
            return Err(tool_failure("tar -x", &extracted));
        }
        Ok(())
    }
}

/// Run a tool to completion; non-zero exit carries its combined output
fn run_tool(cmd: &mut Command, tool: &str) -> Result<()> {
    let output = cmd
        .output()
        .with_context(|| format!("spawning {}", tool))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(tool_failure(tool, &output))
    }
}

fn tool_failure(tool: &str, output: &Output) -> VmmError {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    VmmError::ExternalToolFailure {
        tool: tool.to_string(),
        status: output.status.to_string(),
        output: combined.trim().to_string(),
    }
}
