// ============================================
// RTA Builder - mount.rs
// ============================================
// Mounts an ISO as a virtual drive and hands back a MountHandle.
//
// How it works:
// 1. Snapshot the logical volumes that exist right now
// 2. Ask the host to attach the image (Mount-DiskImage on Windows)
// 3. Poll until a volume shows up that was not in the snapshot
// 4. The MountHandle owns that volume until unmount() or drop
//
// MOUNT HANDLE (RAII SAFETY NET)
// A handle that is dropped without unmount() (early return, error,
// cancellation) detaches the image in Drop, so an image is never left mounted.
// Unmount failures are logged, never returned: a stuck dismount must not hide
// the real outcome of the build.
// ============================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{BuildError, Result};

/// The host's mount/dismount primitives
pub trait MountBackend: Send + Sync {
    /// Identifiers of the logical volumes currently present (drive letters)
    fn volumes(&self) -> Vec<String>;

    /// Attach the image. The new volume may appear some time later.
    fn attach(&self, image: &Path) -> Result<()>;

    /// Detach the image
    fn detach(&self, image: &Path) -> Result<()>;

    /// Root directory of a volume ("E" -> "E:\")
    fn volume_root(&self, volume: &str) -> PathBuf;
}

// ============================================
// MOUNT MANAGER
// ============================================

pub struct MountManager {
    backend: Arc<dyn MountBackend>,
    attempts: u32,
    poll_interval: Duration,
}

impl MountManager {
    pub fn new(backend: Arc<dyn MountBackend>, attempts: u32, poll_interval: Duration) -> Self {
        Self {
            backend,
            attempts: attempts.max(1),
            poll_interval,
        }
    }

    /// Mount an image and wait for its volume to appear.
    ///
    /// Fails with `MountFailure` if the host refuses, or no new volume shows
    /// up within the configured number of attempts. In the second case the
    /// image is detached again before returning.
    pub fn mount(&self, image: &Path) -> Result<MountHandle> {
        let before = self.backend.volumes();
        debug!("Volumes before mount: {:?}", before);

        self.backend.attach(image)?;

        for attempt in 1..=self.attempts {
            let now = self.backend.volumes();
            if let Some(volume) = now.into_iter().find(|v| !before.contains(v)) {
                info!("Image {} mounted at volume {}", image.display(), volume);
                return Ok(MountHandle {
                    backend: Arc::clone(&self.backend),
                    image: image.to_path_buf(),
                    volume,
                    released: false,
                });
            }
            debug!("No new volume yet (attempt {}/{})", attempt, self.attempts);
            if attempt < self.attempts {
                thread::sleep(self.poll_interval);
            }
        }

        if let Err(e) = self.backend.detach(image) {
            warn!("Failed to detach image after mount timeout: {}", e);
        }
        Err(BuildError::MountFailure {
            reason: format!(
                "no new volume appeared for {} after {} attempts",
                image.display(),
                self.attempts
            ),
        })
    }
}

// ============================================
// MOUNT HANDLE
// ============================================

/// A live mount. Exactly one release happens, either via unmount() or Drop.
pub struct MountHandle {
    backend: Arc<dyn MountBackend>,
    image: PathBuf,
    volume: String,
    released: bool,
}

impl MountHandle {
    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Where the mounted file tree starts
    pub fn root(&self) -> PathBuf {
        self.backend.volume_root(&self.volume)
    }

    /// Release the mount. Best-effort: failures are logged only.
    pub fn unmount(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        info!("Unmounting {} from volume {}", self.image.display(), self.volume);
        match self.backend.detach(&self.image) {
            Ok(()) => info!("Image unmounted"),
            Err(e) => warn!("Error unmounting {}: {}", self.image.display(), e),
        }
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if !self.released {
            debug!("MountHandle dropped while mounted - releasing");
            self.release();
        }
    }
}

// ============================================
// HOST BACKEND
// ============================================
// Windows 8+ can mount ISOs natively through the Storage PowerShell module.
// Drive letters are read with GetLogicalDrives.

#[derive(Debug, Default, Clone, Copy)]
pub struct HostMountBackend;

impl MountBackend for HostMountBackend {
    fn volumes(&self) -> Vec<String> {
        logical_drives()
    }

    fn attach(&self, image: &Path) -> Result<()> {
        run_storage_cmdlet("Mount-DiskImage", image)
    }

    fn detach(&self, image: &Path) -> Result<()> {
        run_storage_cmdlet("Dismount-DiskImage", image)
    }

    fn volume_root(&self, volume: &str) -> PathBuf {
        PathBuf::from(format!("{}:\\", volume))
    }
}

#[cfg(windows)]
fn logical_drives() -> Vec<String> {
    // SAFETY: GetLogicalDrives takes no arguments and only returns a bitmask
    let mut mask = unsafe { winapi::um::fileapi::GetLogicalDrives() };
    let mut drives = Vec::new();
    for letter in b'A'..=b'Z' {
        if mask & 1 == 1 {
            drives.push((letter as char).to_string());
        }
        mask >>= 1;
    }
    drives
}

#[cfg(not(windows))]
fn logical_drives() -> Vec<String> {
    Vec::new()
}

#[cfg(windows)]
fn run_storage_cmdlet(cmdlet: &str, image: &Path) -> Result<()> {
    use crate::subprocess::{no_window, ps_quote};
    use std::process::Command;

    let script = format!("{} -ImagePath {} | Out-Null", cmdlet, ps_quote(&image.to_string_lossy()));
    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
    no_window(&mut cmd);

    let output = cmd.output().map_err(|e| BuildError::MountFailure {
        reason: format!("failed to run {}: {}", cmdlet, e),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BuildError::MountFailure {
            reason: format!("{} failed: {}", cmdlet, stderr.trim()),
        });
    }
    Ok(())
}

#[cfg(not(windows))]
fn run_storage_cmdlet(cmdlet: &str, _image: &Path) -> Result<()> {
    Err(BuildError::MountFailure {
        reason: format!("{} requires a Windows host", cmdlet),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Test backend: "mounting" exposes a plain directory as volume "M"
    pub(crate) struct FakeBackend {
        pub root: PathBuf,
        pub volume_appears: bool,
        pub attaches: AtomicUsize,
        pub detaches: AtomicUsize,
        mounted: Mutex<bool>,
    }

    impl FakeBackend {
        pub(crate) fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                volume_appears: true,
                attaches: AtomicUsize::new(0),
                detaches: AtomicUsize::new(0),
                mounted: Mutex::new(false),
            }
        }

        pub(crate) fn is_mounted(&self) -> bool {
            *self.mounted.lock().unwrap()
        }
    }

    impl MountBackend for FakeBackend {
        fn volumes(&self) -> Vec<String> {
            let mut volumes = vec!["C".to_string()];
            if self.volume_appears && self.is_mounted() {
                volumes.push("M".to_string());
            }
            volumes
        }

        fn attach(&self, _image: &Path) -> Result<()> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            *self.mounted.lock().unwrap() = true;
            Ok(())
        }

        fn detach(&self, _image: &Path) -> Result<()> {
            self.detaches.fetch_add(1, Ordering::SeqCst);
            *self.mounted.lock().unwrap() = false;
            Ok(())
        }

        fn volume_root(&self, _volume: &str) -> PathBuf {
            self.root.clone()
        }
    }

    #[test]
    fn test_mount_finds_new_volume_and_unmounts_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(dir.path()));
        let manager = MountManager::new(backend.clone(), 3, Duration::ZERO);

        let handle = manager.mount(Path::new("kali.iso")).unwrap();
        assert_eq!(handle.volume(), "M");
        assert_eq!(handle.root(), dir.path());
        assert!(backend.is_mounted());

        handle.unmount();
        assert!(!backend.is_mounted());
        assert_eq!(backend.detaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_mount() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::new(dir.path()));
        let manager = MountManager::new(backend.clone(), 1, Duration::ZERO);

        {
            let _handle = manager.mount(Path::new("kali.iso")).unwrap();
        }
        assert!(!backend.is_mounted());
        assert_eq!(backend.detaches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mount_fails_when_no_volume_appears() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeBackend::new(dir.path());
        fake.volume_appears = false;
        let backend = Arc::new(fake);
        let manager = MountManager::new(backend.clone(), 4, Duration::ZERO);

        let err = manager.mount(Path::new("kali.iso")).err().unwrap();
        assert!(matches!(err, BuildError::MountFailure { .. }));
        // The half-finished attach was rolled back
        assert_eq!(backend.attaches.load(Ordering::SeqCst), 1);
        assert_eq!(backend.detaches.load(Ordering::SeqCst), 1);
        assert!(!backend.is_mounted());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_host_backend_refuses_off_windows() {
        let err = HostMountBackend.attach(Path::new("kali.iso")).unwrap_err();
        assert!(matches!(err, BuildError::MountFailure { .. }));
        assert!(HostMountBackend.volumes().is_empty());
    }
}
