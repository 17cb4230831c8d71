//! Integration tests for mount image building and syncing

mod common;

use std::fs::{self, File};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::FakeDisk;
use vmm::mount::{parse_mount_spec, MountManager};
use vmm::vm::Mount;

const MB: u64 = 1024 * 1024;

struct Fixture {
    dir: tempfile::TempDir,
    disk: Arc<FakeDisk>,
    manager: MountManager,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(FakeDisk::new());
        let manager = MountManager::new(dir.path().join("mounts"), disk.clone());
        Self { dir, disk, manager }
    }

    fn host_dir(&self, files: &[(&str, u64)]) -> std::path::PathBuf {
        let src = self.dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        for (name, size) in files {
            File::create(src.join(name)).unwrap().set_len(*size).unwrap();
        }
        src
    }

    fn image_mb(&self, mount: &Mount) -> u64 {
        fs::metadata(mount.image_path.as_ref().unwrap()).unwrap().len() / MB
    }
}

#[test]
fn test_small_directory_gets_minimum_image() {
    let f = Fixture::new();
    let src = f.host_dir(&[("a.bin", 10 * MB)]);
    let mut mount = Mount::new(&src, "data", false);

    f.manager.create_mount_image(&mut mount, "t1").unwrap();

    assert_eq!(mount.image_path, Some(f.manager.image_path("t1", "data")));
    assert_eq!(f.image_mb(&mount), 16);
    let contents = f.disk.contents_of(mount.image_path.as_ref().unwrap());
    assert!(contents.join("a.bin").exists());
    assert!(contents.join("lost+found").exists());
}

#[test]
fn test_sync_grows_but_never_shrinks() {
    let f = Fixture::new();
    let src = f.host_dir(&[("big.bin", 20 * MB)]);
    let mut mount = Mount::new(&src, "data", false);

    f.manager.sync_mount_image(&mut mount, "t1").unwrap();
    assert_eq!(f.image_mb(&mount), 24);

    fs::remove_file(src.join("big.bin")).unwrap();
    File::create(src.join("small.bin")).unwrap().set_len(5 * MB).unwrap();
    f.manager.sync_mount_image(&mut mount, "t1").unwrap();

    assert_eq!(f.image_mb(&mount), 24);
    let contents = f.disk.contents_of(mount.image_path.as_ref().unwrap());
    assert!(contents.join("small.bin").exists());
    assert!(!contents.join("big.bin").exists());
    assert!(contents.join("lost+found").exists());

    File::create(src.join("huge.bin")).unwrap().set_len(40 * MB).unwrap();
    f.manager.sync_mount_image(&mut mount, "t1").unwrap();
    assert_eq!(f.image_mb(&mount), 54);
}

#[test]
fn test_partial_image_removed_on_copy_failure() {
    let f = Fixture::new();
    let src = f.host_dir(&[("a.bin", MB)]);
    let mut mount = Mount::new(&src, "data", false);
    f.disk.fail_copy.store(true, Ordering::SeqCst);

    let err = f.manager.create_mount_image(&mut mount, "t1").unwrap_err();

    assert!(err.to_string().contains("creating mount image 'data' for VM 't1'"));
    assert!(!f.manager.image_path("t1", "data").exists());
    assert!(mount.image_path.is_none());
    assert_eq!(f.disk.mounted_count(), 0);
}

#[test]
fn test_missing_host_dir_is_invalid_input() {
    let f = Fixture::new();
    let mut mount = Mount::new(f.dir.path().join("nope"), "data", false);

    let err = f.manager.create_mount_image(&mut mount, "t1").unwrap_err();
    assert!(err.is_invalid_input());
    assert!(!f.manager.image_path("t1", "data").exists());
}

#[test]
fn test_delete_is_idempotent() {
    let f = Fixture::new();
    let src = f.host_dir(&[]);
    let mut mount = parse_mount_spec(&format!("{}:cache:rw", src.display())).unwrap();
    assert!(!mount.read_only);

    f.manager.create_mount_image(&mut mount, "t1").unwrap();
    f.manager.delete_mount_image("t1", "cache").unwrap();
    f.manager.delete_mount_image("t1", "cache").unwrap();
    assert!(!f.manager.image_path("t1", "cache").exists());
}

/// Builds a real ext4 image through loop mounts. Requires root.
#[test]
#[ignore]
fn test_real_ext4_image() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("hello.txt"), b"hello").unwrap();

    let manager = MountManager::new(dir.path().join("mounts"), Arc::new(vmm::mount::ShellDiskBackend));
    let mut mount = Mount::new(&src, "data", true);
    manager.create_mount_image(&mut mount, "it").unwrap();
    manager.sync_mount_image(&mut mount, "it").unwrap();
    assert!(mount.image_path.unwrap().exists());
}
