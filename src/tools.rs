//! External collaborator interfaces.
//!
//! Mounting, loop devices and full filesystem formatting are jobs for the
//! host's own tooling. Each collaborator is a trait with a production
//! implementation that spawns the tool and a recording implementation for
//! tests, so the orchestrator can be driven end-to-end without a real
//! disk.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fs::FsKind;
use crate::process::Cmd;

/// Mount, unmount and loop-device control.
pub trait Mounter {
    /// Mount `source` on `target`, optionally forcing a filesystem type.
    fn mount(&self, source: &Path, target: &Path, fstype: Option<&str>, read_only: bool)
        -> Result<()>;

    /// Unmount `target`. With `lazy` the detach happens when the mount
    /// point stops being busy.
    fn unmount(&self, target: &Path, lazy: bool) -> Result<()>;

    /// Attach `image` to a free loop device and return its path.
    fn attach_loop(&self, image: &Path) -> Result<PathBuf>;

    /// Detach a loop device.
    fn detach_loop(&self, device: &Path) -> Result<()>;
}

/// Full filesystem construction on a partition (or image file).
pub trait Formatter {
    fn format(&self, device: &Path, kind: FsKind, label: &str) -> Result<()>;
}

/// Production mounter backed by mount(8), umount(8) and losetup(8).
pub struct HostMounter;

impl Mounter for HostMounter {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        read_only: bool,
    ) -> Result<()> {
        let mut cmd = Cmd::new("mount");
        if let Some(fstype) = fstype {
            cmd = cmd.args(["-t", fstype]);
        }
        if read_only {
            cmd = cmd.args(["-o", "ro"]);
        }
        cmd.arg_path(source)
            .arg_path(target)
            .error_msg(format!("failed to mount {}", source.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        let mut cmd = Cmd::new("umount");
        if lazy {
            cmd = cmd.arg("-l");
        }
        cmd.arg_path(target)
            .error_msg(format!("failed to unmount {}", target.display()))
            .run()?;
        Ok(())
    }

    fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let out = Cmd::new("losetup")
            .args(["--show", "-f"])
            .arg_path(image)
            .error_msg(format!("failed to attach {} to a loop device", image.display()))
            .run()?;
        let device = out.stdout.trim();
        if device.is_empty() {
            return Err(Error::Filesystem("losetup reported no loop device".into()));
        }
        Ok(PathBuf::from(device))
    }

    fn detach_loop(&self, device: &Path) -> Result<()> {
        Cmd::new("losetup")
            .arg("-d")
            .arg_path(device)
            .allow_fail()
            .run()?;
        Ok(())
    }
}

/// Production formatter shelling out to the mkfs family.
pub struct HostFormatter;

impl Formatter for HostFormatter {
    fn format(&self, device: &Path, kind: FsKind, label: &str) -> Result<()> {
        let cmd = match kind {
            FsKind::Ext4 => Cmd::new("mkfs.ext4").args(["-F", "-q", "-L", label]),
            FsKind::Ntfs => Cmd::new("mkfs.ntfs").args(["-f", "-L", label]),
            // FAT64 is the on-media name exFAT goes by; both use the same
            // formatter.
            FsKind::ExFat | FsKind::Fat64 => Cmd::new("mkfs.exfat").args(["-n", label]),
            FsKind::Fat32 => Cmd::new("mkfs.vfat").args(["-F", "32", "-n", label]),
        };

        cmd.arg_path(device)
            .error_msg(format!(
                "failed to format {} as {}",
                device.display(),
                kind.name()
            ))
            .run()?;
        Ok(())
    }
}
