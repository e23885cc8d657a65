//! The control surface.
//!
//! [`GsiService`] serializes every operation that touches the install
//! session behind one lock. Progress and cancellation bypass that lock
//! so they stay responsive while an allocation or a chunk commit runs.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use crate::boot_status::{BootStatus, BootStatusStore, InstallStatus};
use crate::config::Config;
use crate::error::{InstallError, InstallResult};
use crate::image::SplitImage;
use crate::install::{
    image_path, InstallParams, InstallSession, Shared, SYSTEM_NAME, USERDATA_NAME,
};
use crate::platform::{LinuxPlatform, Platform};
use crate::progress::Progress;

/// Who is calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// The caller's user id.
    pub uid: u32,
}

impl Caller {
    /// The current process.
    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessLevel {
    System,
    SystemOrShell,
}

/// Everything a caller may want to know at once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceStatus {
    /// An install is complete.
    pub installed: bool,
    /// The installed image is the running system.
    pub running: bool,
    /// The installed image will be booted.
    pub enabled: bool,
    /// An install is receiving data.
    pub in_progress: bool,
    /// Summary of the boot status.
    pub boot_status: BootStatus,
    /// Where the images are.
    pub install_dir: Option<Utf8PathBuf>,
    /// Progress of the current step.
    pub progress: Progress,
}

/// Manages installing, enabling and removing an image.
#[derive(Debug)]
pub struct GsiService {
    shared: Arc<Shared>,
    session: Mutex<Option<InstallSession>>,
}

fn logged<T>(op: &str, r: InstallResult<T>) -> InstallResult<T> {
    match &r {
        Ok(_) => tracing::debug!("{op}: ok"),
        Err(e) => e.log(op),
    }
    r
}

impl GsiService {
    /// Create the service for this host.
    pub fn new(config: Config) -> Result<Self> {
        let platform = Arc::new(LinuxPlatform::new(&config.external_storage_prefix));
        Self::with_platform(config, platform)
    }

    /// Create the service on top of `platform`.
    #[context("Initializing service")]
    pub fn with_platform(config: Config, platform: Arc<dyn Platform>) -> Result<Self> {
        let store = BootStatusStore::open(&config.metadata_dir)?;
        let shared = Shared {
            config,
            platform,
            store,
            progress: Default::default(),
            abort: AtomicBool::new(false),
        };
        Ok(Self {
            shared: Arc::new(shared),
            session: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<InstallSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self) -> &BootStatusStore {
        &self.shared.store
    }

    fn check_access(&self, caller: Caller, level: AccessLevel) -> InstallResult<()> {
        let access = &self.shared.config.access;
        let allowed = access.system_uids.contains(&caller.uid)
            || (level == AccessLevel::SystemOrShell && access.shell_uids.contains(&caller.uid));
        if !allowed {
            return Err(InstallError::AccessDenied(format!(
                "uid {} may not perform this operation",
                caller.uid
            )));
        }
        Ok(())
    }

    fn installing(guard: &mut Option<InstallSession>) -> InstallResult<&mut InstallSession> {
        guard
            .as_mut()
            .filter(|s| s.is_installing())
            .ok_or_else(|| InstallError::invalid("No install is in progress"))
    }

    /// Start installing; any unfinished install is discarded first.
    pub fn begin_install(&self, caller: Caller, params: &InstallParams) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::System)?;
            if !self.shared.config.install_enabled {
                return Err(InstallError::OperationDisabled(
                    "Installing is disabled".into(),
                ));
            }
            let mut guard = self.lock();
            if let Some(old) = guard.take() {
                tracing::info!("Discarding unfinished install in {}", old.install_dir());
            }
            *guard = Some(InstallSession::begin(Arc::clone(&self.shared), params)?);
            Ok(())
        })();
        logged("begin install", r)
    }

    /// Append `buf` to the system image.
    pub fn commit_chunk(&self, caller: Caller, buf: &[u8]) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::System)?;
            let mut guard = self.lock();
            Self::installing(&mut guard)?.commit_chunk(buf)
        })();
        logged("commit chunk", r)
    }

    /// Append exactly `len` bytes from `src` to the system image.
    pub fn commit_stream(&self, caller: Caller, src: &mut dyn Read, len: u64) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::System)?;
            let mut guard = self.lock();
            Self::installing(&mut guard)?.commit_stream(src, len)
        })();
        logged("commit stream", r)
    }

    /// Progress of the current step. Never waits for other operations.
    pub fn progress(&self, caller: Caller) -> InstallResult<Progress> {
        self.check_access(caller, AccessLevel::System)?;
        Ok(self.shared.progress.snapshot())
    }

    fn finalize_locked(guard: &mut Option<InstallSession>, one_shot: bool) -> InstallResult<()> {
        let s = Self::installing(guard)?;
        let r = s.finalize(one_shot);
        // Done with the session unless the image is merely incomplete.
        if !s.is_installing() {
            guard.take();
        }
        r
    }

    /// Make the image being installed bootable.
    pub fn finalize(&self, caller: Caller, one_shot: bool) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::System)?;
            Self::finalize_locked(&mut self.lock(), one_shot)
        })();
        logged("finalize", r)
    }

    /// Finalize the install in progress, or re-enable a disabled one.
    pub fn enable(&self, caller: Caller, one_shot: bool) -> InstallResult<()> {
        let r = (|| {
            let mut guard = self.lock();
            if guard.as_ref().is_some_and(|s| s.is_installing()) {
                self.check_access(caller, AccessLevel::System)?;
                return Self::finalize_locked(&mut guard, one_shot);
            }
            self.check_access(caller, AccessLevel::SystemOrShell)?;
            self.reenable_locked(&mut guard, one_shot)
        })();
        logged("enable", r)
    }

    fn reenable_locked(
        &self,
        guard: &mut Option<InstallSession>,
        one_shot: bool,
    ) -> InstallResult<()> {
        let store = self.store();
        if !store.is_installed()? {
            return Err(InstallError::DoesNotExist("No install to enable".into()));
        }
        if store.status()? != Some(InstallStatus::Disabled) {
            return Err(InstallError::invalid("The install is not disabled"));
        }
        if store.is_running()? {
            // The images are in use; only the status files are rewritten.
            store.reenable(None, &InstallStatus::Attempts(0), one_shot)?;
            return Ok(());
        }
        guard.take();
        let mut s = InstallSession::recover(Arc::clone(&self.shared))?;
        s.reenable(one_shot)
    }

    /// Stop the install in progress and remove what it created.
    pub fn cancel(&self, caller: Caller) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::System)?;
            self.shared.abort.store(true, Ordering::SeqCst);
            let mut guard = self.lock();
            self.shared.abort.store(false, Ordering::SeqCst);
            if let Some(s) = guard.take() {
                tracing::info!("Cancelling install in {}", s.install_dir());
            }
            Ok(())
        })();
        logged("cancel", r)
    }

    /// Stop booting the installed image.
    pub fn disable(&self, caller: Caller) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::SystemOrShell)?;
            let guard = self.lock();
            if guard.as_ref().is_some_and(|s| s.is_installing()) {
                return Err(InstallError::invalid("Cannot disable during an install"));
            }
            if !self.store().is_installed()? {
                return Err(InstallError::DoesNotExist("No install to disable".into()));
            }
            self.store().set_status(&InstallStatus::Disabled)?;
            Ok(())
        })();
        logged("disable", r)
    }

    /// Status first, so an interrupted removal is never bootable.
    #[context("Removing install in {install_dir}")]
    fn remove_install_files(&self, install_dir: &Utf8Path, wipe_userdata: bool) -> Result<()> {
        self.store().remove_all()?;
        SplitImage::remove_all(&image_path(install_dir, SYSTEM_NAME))?;
        if wipe_userdata {
            SplitImage::remove_all(&image_path(install_dir, USERDATA_NAME))?;
        }
        Ok(())
    }

    /// Remove the installed image. If it is the running system, it is
    /// instead marked to be removed at the next boot of the host.
    pub fn uninstall(&self, caller: Caller, wipe_userdata: bool) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::SystemOrShell)?;
            let mut guard = self.lock();
            guard.take();
            let store = self.store();
            if store.is_running()? {
                store.set_status(&InstallStatus::Wipe)?;
                tracing::info!("Install will be removed at next boot");
                return Ok(());
            }
            let dir = store.installed_image_dir(&self.shared.config.default_install_dir)?;
            self.remove_install_files(&dir, wipe_userdata)?;
            Ok(())
        })();
        logged("uninstall", r)
    }

    /// True if an install is complete.
    pub fn is_installed(&self, caller: Caller) -> InstallResult<bool> {
        self.check_access(caller, AccessLevel::SystemOrShell)?;
        Ok(self.store().is_installed()?)
    }

    /// True if the installed image is the running system.
    pub fn is_running(&self, caller: Caller) -> InstallResult<bool> {
        self.check_access(caller, AccessLevel::SystemOrShell)?;
        Ok(self.store().is_running()?)
    }

    /// True if the installed image will be booted.
    pub fn is_enabled(&self, caller: Caller) -> InstallResult<bool> {
        self.check_access(caller, AccessLevel::SystemOrShell)?;
        let enabled = !matches!(
            self.store().status()?,
            None | Some(InstallStatus::Disabled) | Some(InstallStatus::Wipe)
        );
        Ok(enabled)
    }

    /// True while an install is receiving data.
    pub fn is_in_progress(&self, caller: Caller) -> InstallResult<bool> {
        self.check_access(caller, AccessLevel::SystemOrShell)?;
        Ok(self.lock().as_ref().is_some_and(|s| s.is_installing()))
    }

    /// Summary of the boot status.
    pub fn boot_status(&self, caller: Caller) -> InstallResult<BootStatus> {
        self.check_access(caller, AccessLevel::SystemOrShell)?;
        Ok(self.store().boot_status()?)
    }

    /// Size of the userdata image: the one being installed, the one in
    /// use, or the one installed, in that order.
    pub fn userdata_image_size(&self, caller: Caller) -> InstallResult<u64> {
        let r = (|| {
            self.check_access(caller, AccessLevel::System)?;
            let guard = self.lock();
            if let Some(s) = guard.as_ref().filter(|s| s.is_installing()) {
                return Ok(s.userdata_size());
            }
            let config = &self.shared.config;
            if self.store().is_running()? {
                return Ok(self
                    .shared
                    .platform
                    .block_device_size(&config.userdata_device)?);
            }
            let dir = self.store().installed_image_dir(&config.default_install_dir)?;
            let path = image_path(&dir, USERDATA_NAME);
            if !SplitImage::exists(&path)? {
                return Ok(0);
            }
            Ok(SplitImage::allocated_size(&path)?)
        })();
        logged("userdata size", r)
    }

    /// The directory holding the installed images.
    pub fn installed_image_dir(&self, caller: Caller) -> InstallResult<Utf8PathBuf> {
        self.check_access(caller, AccessLevel::System)?;
        Ok(self
            .store()
            .installed_image_dir(&self.shared.config.default_install_dir)?)
    }

    /// Zero the start of the installed userdata image.
    pub fn wipe_userdata(&self, caller: Caller) -> InstallResult<()> {
        let r = (|| {
            self.check_access(caller, AccessLevel::SystemOrShell)?;
            if !self.shared.config.wipe_enabled {
                return Err(InstallError::OperationDisabled(
                    "Wiping userdata is disabled".into(),
                ));
            }
            let mut guard = self.lock();
            if guard.as_ref().is_some_and(|s| s.is_installing()) {
                return Err(InstallError::invalid("Cannot wipe during an install"));
            }
            let store = self.store();
            if store.is_running()? {
                return Err(InstallError::invalid(
                    "Cannot wipe the userdata of the running image",
                ));
            }
            if !store.is_installed()? {
                return Err(InstallError::DoesNotExist("No install to wipe".into()));
            }
            guard.take();
            let mut s = InstallSession::recover(Arc::clone(&self.shared))?;
            s.wipe_userdata()
        })();
        logged("wipe userdata", r)
    }

    /// Everything at once.
    pub fn status(&self, caller: Caller) -> InstallResult<ServiceStatus> {
        self.check_access(caller, AccessLevel::SystemOrShell)?;
        let store = self.store();
        let installed = store.is_installed()?;
        Ok(ServiceStatus {
            installed,
            running: store.is_running()?,
            enabled: self.is_enabled(caller)?,
            in_progress: self.is_in_progress(caller)?,
            boot_status: store.boot_status()?,
            install_dir: installed
                .then(|| store.installed_image_dir(&self.shared.config.default_install_dir))
                .transpose()?,
            progress: self.shared.progress.snapshot(),
        })
    }

    /// Run once when the host or the installed image has booted: finish
    /// a requested removal, or record that the installed image booted.
    #[context("Running startup tasks")]
    pub fn run_startup_tasks(&self) -> Result<()> {
        let _guard = self.lock();
        let store = self.store();
        let Some(status) = store.status()? else {
            return Ok(());
        };
        if !store.is_running()? {
            if status == InstallStatus::Wipe {
                let dir = store.installed_image_dir(&self.shared.config.default_install_dir)?;
                tracing::info!("Removing install in {dir}");
                self.remove_install_files(&dir, true)?;
            }
        } else if let InstallStatus::Attempts(n) = status {
            tracing::info!("Installed image booted after {n} attempts");
            store.set_status(&InstallStatus::Ok)?;
        }
        Ok(())
    }
}

impl Drop for GsiService {
    fn drop(&mut self) {
        self.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot_status::{BootDecision, BootRefusal};
    use crate::testutil::FakePlatform;

    const ROOT: Caller = Caller { uid: 0 };
    const SHELL: Caller = Caller { uid: 2000 };
    const APP: Caller = Caller { uid: 10052 };

    fn service(p: &Arc<FakePlatform>) -> Result<GsiService> {
        GsiService::with_platform(p.config(), p.clone())
    }

    fn service_with(p: &Arc<FakePlatform>, f: impl FnOnce(&mut Config)) -> Result<GsiService> {
        let mut config = p.config();
        f(&mut config);
        GsiService::with_platform(config, p.clone())
    }

    fn params(gsi_size: u64) -> InstallParams {
        InstallParams {
            gsi_size: gsi_size as i64,
            userdata_size: (1 << 20) as i64,
            ..Default::default()
        }
    }

    fn install(svc: &GsiService, one_shot: bool) -> Result<()> {
        svc.begin_install(ROOT, &params(1 << 20))?;
        svc.commit_chunk(ROOT, &vec![3u8; 1 << 20])?;
        svc.finalize(ROOT, one_shot)?;
        Ok(())
    }

    fn images(p: &FakePlatform) -> usize {
        std::fs::read_dir(p.dir()).unwrap().count()
    }

    #[test]
    fn test_install_and_remove() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        assert!(!svc.is_installed(ROOT)?);
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::NotInstalled);
        svc.begin_install(ROOT, &params(1 << 20))?;
        assert!(svc.is_in_progress(SHELL)?);
        assert_eq!(svc.userdata_image_size(ROOT)?, 1 << 20);
        svc.commit_chunk(ROOT, &vec![3u8; 1 << 20])?;
        svc.finalize(ROOT, false)?;
        assert!(!svc.is_in_progress(ROOT)?);
        assert!(svc.is_installed(SHELL)?);
        assert!(svc.is_enabled(ROOT)?);
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::Enabled);
        assert_eq!(svc.userdata_image_size(ROOT)?, 1 << 20);
        let status = svc.status(ROOT)?;
        assert!(status.installed && !status.running);
        assert!(svc.installed_image_dir(ROOT)?.as_str().ends_with("/install/"));

        svc.uninstall(SHELL, false)?;
        assert!(!svc.is_installed(ROOT)?);
        // Userdata is kept
        assert_eq!(images(&p), 2);
        assert_eq!(svc.userdata_image_size(ROOT)?, 1 << 20);
        svc.uninstall(ROOT, true)?;
        assert_eq!(images(&p), 0);
        assert_eq!(svc.userdata_image_size(ROOT)?, 0);
        Ok(())
    }

    #[test]
    fn test_access() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        for caller in [SHELL, APP] {
            let r = svc.begin_install(caller, &params(4096));
            assert!(matches!(r, Err(InstallError::AccessDenied(_))));
            assert!(svc.progress(caller).is_err());
            assert!(svc.cancel(caller).is_err());
        }
        assert!(!svc.is_installed(SHELL)?);
        assert!(matches!(
            svc.is_installed(APP),
            Err(InstallError::AccessDenied(_))
        ));
        assert!(matches!(
            svc.uninstall(APP, true),
            Err(InstallError::AccessDenied(_))
        ));
        // Finalizing through enable needs a system caller.
        svc.begin_install(ROOT, &params(4096))?;
        svc.commit_chunk(ROOT, &[0u8; 4096])?;
        assert!(matches!(
            svc.enable(SHELL, false),
            Err(InstallError::AccessDenied(_))
        ));
        svc.enable(ROOT, false)?;
        assert!(svc.is_installed(ROOT)?);
        Ok(())
    }

    #[test]
    fn test_disabled_operations() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service_with(&p, |c| {
            c.install_enabled = false;
            c.wipe_enabled = false;
        })?;
        assert!(matches!(
            svc.begin_install(ROOT, &params(4096)),
            Err(InstallError::OperationDisabled(_))
        ));
        assert!(matches!(
            svc.wipe_userdata(ROOT),
            Err(InstallError::OperationDisabled(_))
        ));
        Ok(())
    }

    #[test]
    fn test_cancel() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        p.set_devicemapper(true);
        let svc = service(&p)?;
        svc.begin_install(ROOT, &params(1 << 20))?;
        svc.commit_chunk(ROOT, &[1u8; 8192])?;
        assert_eq!(p.dm_nodes(), [SYSTEM_NAME]);
        svc.cancel(ROOT)?;
        assert!(!svc.is_in_progress(ROOT)?);
        assert_eq!(images(&p), 0);
        assert!(p.dm_nodes().is_empty());
        assert!(matches!(
            svc.commit_chunk(ROOT, &[1u8; 512]),
            Err(InstallError::InvalidParameter(_))
        ));
        // Nothing to cancel
        svc.cancel(ROOT)?;
        install(&svc, false)?;
        assert!(svc.is_installed(ROOT)?);
        Ok(())
    }

    #[test]
    fn test_begin_supersedes() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        svc.begin_install(ROOT, &params(1 << 20))?;
        svc.commit_chunk(ROOT, &[1u8; 4096])?;
        svc.begin_install(ROOT, &params(1 << 20))?;
        // Starts from the beginning again
        svc.commit_chunk(ROOT, &vec![1u8; 1 << 20])?;
        svc.finalize(ROOT, false)?;
        Ok(())
    }

    #[test]
    fn test_cancel_stream() -> Result<()> {
        struct Trickle<'a>(&'a AtomicBool);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(1));
                buf[0] = 0;
                Ok(1)
            }
        }

        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        svc.begin_install(ROOT, &params(1 << 20))?;
        let started = AtomicBool::new(false);
        let r = std::thread::scope(|s| {
            let h = s.spawn(|| svc.commit_stream(ROOT, &mut Trickle(&started), 1 << 20));
            while !started.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            // Does not wait for the stream.
            let progress = svc.progress(ROOT).unwrap();
            assert_eq!(progress.step, "write system");
            svc.cancel(ROOT).unwrap();
            h.join().unwrap()
        });
        assert!(matches!(r, Err(InstallError::Cancelled)));
        assert!(!svc.is_in_progress(ROOT)?);
        assert_eq!(images(&p), 0);
        Ok(())
    }

    #[test]
    fn test_disable_enable() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        assert!(matches!(
            svc.disable(ROOT),
            Err(InstallError::DoesNotExist(_))
        ));
        assert!(matches!(
            svc.enable(ROOT, false),
            Err(InstallError::DoesNotExist(_))
        ));
        install(&svc, false)?;
        // Not disabled
        assert!(matches!(
            svc.enable(ROOT, false),
            Err(InstallError::InvalidParameter(_))
        ));
        svc.disable(SHELL)?;
        assert!(!svc.is_enabled(ROOT)?);
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::Disabled);
        svc.enable(SHELL, true)?;
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::SingleBoot);
        assert!(svc.is_enabled(ROOT)?);
        Ok(())
    }

    #[test]
    fn test_one_shot_boot_cycle() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        install(&svc, true)?;
        let store = svc.store();
        let max = p.config().max_boot_attempts;
        assert!(matches!(store.boot_decision(max)?, BootDecision::Boot(_)));
        store.mark_running()?;
        // The image booted; one-shot installs stay disabled.
        svc.run_startup_tasks()?;
        assert_eq!(store.status()?, Some(InstallStatus::Disabled));
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::SingleBoot);
        assert_eq!(
            store.boot_decision(max)?,
            BootDecision::DoNotBoot(BootRefusal::NotEnabled("disabled".into()))
        );
        Ok(())
    }

    #[test]
    fn test_running() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        install(&svc, false)?;
        let store = svc.store();
        assert!(matches!(store.boot_decision(1)?, BootDecision::Boot(_)));
        store.mark_running()?;
        assert!(svc.is_running(ROOT)?);
        svc.run_startup_tasks()?;
        assert_eq!(store.status()?, Some(InstallStatus::Ok));
        assert_eq!(svc.userdata_image_size(ROOT)?, 8192);
        assert!(matches!(
            svc.begin_install(ROOT, &params(4096)),
            Err(InstallError::InvalidParameter(_))
        ));
        assert!(matches!(
            svc.wipe_userdata(ROOT),
            Err(InstallError::InvalidParameter(_))
        ));
        // Re-enabling while running restarts the boot attempt count.
        svc.disable(ROOT)?;
        svc.enable(ROOT, false)?;
        assert_eq!(store.status()?, Some(InstallStatus::Attempts(0)));
        assert!(svc.is_enabled(ROOT)?);
        // Removal is deferred to the next boot of the host.
        svc.uninstall(ROOT, true)?;
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::WillWipe);
        assert_eq!(images(&p), 4);
        svc.run_startup_tasks()?;
        assert_eq!(images(&p), 4);
        assert!(matches!(
            store.boot_decision(1)?,
            BootDecision::DoNotBoot(BootRefusal::NotEnabled(_))
        ));
        assert!(!svc.is_running(ROOT)?);
        svc.run_startup_tasks()?;
        assert_eq!(images(&p), 0);
        assert!(!svc.is_installed(ROOT)?);
        Ok(())
    }

    #[test]
    fn test_wipe_userdata() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        let svc = service(&p)?;
        assert!(matches!(
            svc.wipe_userdata(ROOT),
            Err(InstallError::DoesNotExist(_))
        ));
        install(&svc, false)?;
        let piece = p.dir().join("userdata_gsi.img.0000");
        std::fs::write(&piece, vec![0xffu8; 1 << 20])?;
        svc.wipe_userdata(SHELL)?;
        assert!(std::fs::read(&piece)?.iter().all(|&b| b == 0));
        // Still installed and enabled
        assert_eq!(svc.boot_status(ROOT)?, BootStatus::Enabled);
        Ok(())
    }

    #[test]
    fn test_drop_cleans_up() -> Result<()> {
        let p = Arc::new(FakePlatform::new()?);
        p.set_devicemapper(true);
        let svc = service(&p)?;
        svc.begin_install(ROOT, &params(1 << 20))?;
        drop(svc);
        assert!(p.dm_nodes().is_empty());
        assert_eq!(images(&p), 0);
        Ok(())
    }
}
