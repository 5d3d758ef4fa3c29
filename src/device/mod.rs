//! Block device gateway.
//!
//! Every interaction with the target disk node goes through here: size
//! queries via sysfs, mount-table checks, the destructive head/tail wipe,
//! kernel partition-table rescans and the partition naming scheme. Calls
//! are independent; no state is held between them.
//!
//! Most entry points also accept plain files so the rest of the crate can
//! be exercised against disk images in tests, the same way the partition
//! and filesystem layers are.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::Cmd;
use crate::report::ReportSink;
use crate::tools::Mounter;

/// BLKRRPART: ask the kernel to re-read the partition table.
const BLKRRPART: libc::c_ulong = 0x125F;

/// Bytes zeroed at each end of the device by [`wipe`].
pub const WIPE_SPAN: u64 = 10 * 1024 * 1024;

/// Chunk size used while wiping.
const WIPE_CHUNK: usize = 1024 * 1024;

/// Seconds to poll sysfs for child partition nodes after a rescan.
const REREAD_WAIT_SECS: u32 = 5;

/// Fail with `InvalidDevice` unless the path refers to a block special
/// node.
pub fn validate(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|_| Error::InvalidDevice {
        path: path.to_path_buf(),
    })?;
    if !meta.file_type().is_block_device() {
        return Err(Error::InvalidDevice {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Device size in bytes, read from the kernel's sysfs sector count.
pub fn size_bytes(path: &Path) -> Result<u64> {
    let name = sysfs_name(path)?;
    let size_file = format!("/sys/class/block/{name}/size");
    let text = std::fs::read_to_string(&size_file)
        .map_err(|e| Error::device_io(path, format!("cannot read {size_file}: {e}")))?;
    let sectors: u64 = text
        .trim()
        .parse()
        .map_err(|e| Error::device_io(path, format!("bad sector count in {size_file}: {e}")))?;
    Ok(sectors * 512)
}

/// Size of a block node or, for regular files, the file length. Lets the
/// partition and filesystem writers operate on disk images.
pub fn node_size_bytes(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(|e| Error::device_io(path, e))?;
    if meta.file_type().is_block_device() {
        size_bytes(path)
    } else {
        Ok(meta.len())
    }
}

/// True if any mount-table entry has a source beginning with `path`.
/// Prefix match on purpose: it catches the disk itself and every child
/// partition.
pub fn is_mounted(path: &Path) -> Result<bool> {
    Ok(!mounted_children(path)?.is_empty())
}

/// Mount points whose source begins with `path`, innermost last.
pub fn mounted_children(path: &Path) -> Result<Vec<(String, String)>> {
    let table = std::fs::read_to_string("/proc/mounts")
        .map_err(|e| Error::device_io(path, format!("cannot read mount table: {e}")))?;
    Ok(scan_mount_table(&table, path))
}

fn scan_mount_table(table: &str, path: &Path) -> Vec<(String, String)> {
    let prefix = path.to_string_lossy();
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mountpoint = fields.next()?;
            source
                .starts_with(prefix.as_ref())
                .then(|| (source.to_string(), mountpoint.to_string()))
        })
        .collect()
}

/// Unmount every child of `path`, best-effort. Anything still mounted
/// after the first pass is retried with lazy/detach semantics. Succeeds
/// when nothing was mounted to begin with.
pub fn unmount_all(path: &Path, mounter: &dyn Mounter, sink: &dyn ReportSink) -> Result<()> {
    let mounted = mounted_children(path)?;
    if mounted.is_empty() {
        return Ok(());
    }

    sink.info(&format!("unmounting {}", path.display()));
    for (_, mountpoint) in &mounted {
        let _ = mounter.unmount(Path::new(mountpoint), false);
    }

    // Anything still in the table gets the lazy treatment.
    for (_, mountpoint) in mounted_children(path)? {
        sink.warn(&format!("{mountpoint} did not unmount cleanly, detaching"));
        let _ = mounter.unmount(Path::new(&mountpoint), true);
    }

    Ok(())
}

/// Zero the first and last [`WIPE_SPAN`] bytes of the device, covering the
/// MBR, the primary GPT and most filesystem signatures at the front plus
/// the backup GPT at the tail. Written in 1 MiB chunks through a
/// synchronous descriptor, fsynced, then a partition rescan is requested.
pub fn wipe(path: &Path, sink: &dyn ReportSink) -> Result<()> {
    let size = node_size_bytes(path)?;
    let mut file = open_sync_write(path)?;

    sink.info(&format!("wiping partition structures on {}", path.display()));

    let head = WIPE_SPAN.min(size);
    zero_range(&mut file, path, 0, head)?;

    let tail_start = size.saturating_sub(WIPE_SPAN);
    if tail_start > head {
        zero_range(&mut file, path, tail_start, size - tail_start)?;
    }

    file.sync_all().map_err(|e| Error::device_io(path, e))?;
    drop(file);

    trigger_rescan(path, sink);
    Ok(())
}

fn zero_range(file: &mut File, path: &Path, offset: u64, len: u64) -> Result<()> {
    let zeros = vec![0u8; WIPE_CHUNK];
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::device_io(path, e))?;

    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(WIPE_CHUNK as u64) as usize;
        file.write_all(&zeros[..chunk])
            .map_err(|e| Error::device_io(path, format!("short write while wiping: {e}")))?;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// Ask the kernel to re-read the partition table, then wait for the
/// expected child nodes to appear in sysfs. `partprobe` is invoked as a
/// second channel; missing children after the wait are reported but not
/// fatal, since the very next open of the child will fail loudly anyway.
pub fn reread_partitions(path: &Path, expected: &[u32], sink: &dyn ReportSink) -> Result<()> {
    trigger_rescan(path, sink);

    if expected.is_empty() || validate(path).is_err() {
        // Disk images have no kernel-provided children to wait for.
        return Ok(());
    }

    let base = sysfs_name(path)?;
    for _ in 0..REREAD_WAIT_SECS {
        if expected.iter().all(|&index| {
            let child = child_name(&base, index);
            Path::new(&format!("/sys/class/block/{base}/{child}")).exists()
        }) {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }

    sink.warn(&format!(
        "partition nodes for {} not visible after {REREAD_WAIT_SECS}s",
        path.display()
    ));
    Ok(())
}

fn trigger_rescan(path: &Path, sink: &dyn ReportSink) {
    match File::open(path) {
        Ok(file) => {
            // ENOTTY on regular files (disk images) is expected.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
            if rc != 0 {
                log::debug!("BLKRRPART on {} returned {rc}", path.display());
            }
        }
        Err(e) => sink.warn(&format!("cannot open {} for rescan: {e}", path.display())),
    }

    let _ = Cmd::new("partprobe").arg_path(path).allow_fail().run();
}

/// Child partition node for (device, index): `p<N>` suffix for NVMe and
/// MMC style names, plain `<N>` otherwise.
pub fn partition_path(device: &Path, index: u32) -> PathBuf {
    let name = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut path = device.as_os_str().to_os_string();
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        path.push(format!("p{index}"));
    } else {
        path.push(format!("{index}"));
    }
    PathBuf::from(path)
}

fn child_name(base: &str, index: u32) -> String {
    if base.starts_with("nvme") || base.starts_with("mmcblk") {
        format!("{base}p{index}")
    } else {
        format!("{base}{index}")
    }
}

/// Global sync followed by a buffer flush for this specific device.
pub fn sync_device(path: &Path, sink: &dyn ReportSink) -> Result<()> {
    sink.info("syncing device buffers");
    unsafe { libc::sync() };
    if let Err(err) = Cmd::new("blockdev")
        .arg("--flushbufs")
        .arg_path(path)
        .allow_fail()
        .run()
    {
        log::debug!("blockdev --flushbufs unavailable: {err}");
    }
    Ok(())
}

/// Open a node for writing with synchronous semantics.
pub fn open_sync_write(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| Error::from_open(path, e))
}

/// Open a node read/write with synchronous semantics.
pub fn open_sync_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)
        .map_err(|e| Error::from_open(path, e))
}

fn sysfs_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidDevice {
            path: path.to_path_buf(),
        })
}
