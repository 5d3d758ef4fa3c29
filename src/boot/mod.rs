//! Bootloader placement.
//!
//! Finalizes a freshly written device: a Syslinux-compatible x86 stub in
//! the MBR boot-code area and a menu configuration on the first FAT32
//! partition. The flavor (Syslinux vs GRUB) is chosen by scanning the
//! front of the source image; Syslinux wins ties.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::codec::mbr::BOOT_CODE_SIZE;
use crate::error::{Error, Result};
use crate::report::ReportSink;

/// Window of the image scanned for bootloader markers.
const DETECT_SCAN_BYTES: usize = 32 * 1024;

/// Bootloader families the placer can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootFlavor {
    Syslinux,
    Grub,
}

/// First-stage x86 boot stub: disables interrupts, sets up a boot-time
/// stack at 0x7C00, relocates, probes INT 13h extensions and chains to
/// the active partition. Compatible with the Syslinux MBR protocol.
pub const SYSLINUX_STUB: [u8; 55] = [
    0xFA, 0x31, 0xC0, 0x8E, 0xD8, 0x8E, 0xC0, 0x8E, 0xD0, 0xBC, 0x00, 0x7C, 0xFB, 0xFC, 0xBF,
    0x00, 0x06, 0xB9, 0x00, 0x01, 0xF3, 0xA5, 0xEA, 0x1F, 0x06, 0x00, 0x00, 0xB4, 0x41, 0xBB,
    0xAA, 0x55, 0xCD, 0x13, 0x72, 0x3E, 0x81, 0xFB, 0x55, 0xAA, 0x75, 0x38, 0x83, 0xE1, 0x01,
    0x74, 0x33, 0x66, 0xA1, 0x10, 0x7C, 0x66, 0x3B, 0x46, 0xF8,
];

const SYSLINUX_CFG: &str = "\
DEFAULT menu.c32
PROMPT 0
TIMEOUT 300

MENU TITLE Live Boot Menu

LABEL linux
  MENU LABEL Boot Linux
  KERNEL /casper/vmlinuz
  APPEND initrd=/casper/initrd boot=casper quiet splash ---

LABEL persistent
  MENU LABEL Boot with Persistence
  KERNEL /casper/vmlinuz
  APPEND initrd=/casper/initrd boot=casper persistent quiet splash ---
";

const GRUB_CFG: &str = "\
set timeout=10
set default=0

menuentry \"Boot Linux\" {
  linux /casper/vmlinuz boot=casper quiet splash ---
  initrd /casper/initrd
}

menuentry \"Boot with Persistence\" {
  linux /casper/vmlinuz boot=casper persistent quiet splash ---
  initrd /casper/initrd
}
";

/// Pick the bootloader family by scanning the first 32 KiB of the image.
pub fn detect_flavor(image: &Path) -> Result<BootFlavor> {
    let mut file = File::open(image).map_err(|e| Error::file_io(image, e))?;
    let mut buf = vec![0u8; DETECT_SCAN_BYTES];
    let read = file.read(&mut buf).map_err(|e| Error::file_io(image, e))?;
    buf.truncate(read);

    let has_syslinux = contains(&buf, b"SYSLINUX") || contains(&buf, b"ISOLINUX");
    let has_grub = contains(&buf, b"GRUB");

    Ok(if has_grub && !has_syslinux {
        BootFlavor::Grub
    } else {
        BootFlavor::Syslinux
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Write the boot stub into bytes [0, 440) of the device's MBR, zero
/// padded, leaving the disk signature and partition table untouched.
pub fn write_mbr_stub(device: &Path) -> Result<()> {
    let mut area = [0u8; BOOT_CODE_SIZE];
    area[..SYSLINUX_STUB.len()].copy_from_slice(&SYSLINUX_STUB);
    crate::burn::patch_head(device, &area)
}

/// Drop the menu configuration for `flavor` onto a mounted boot
/// partition.
pub fn write_config(mount_root: &Path, flavor: BootFlavor) -> Result<()> {
    let (dir, name, content) = match flavor {
        BootFlavor::Syslinux => (mount_root.join("syslinux"), "syslinux.cfg", SYSLINUX_CFG),
        BootFlavor::Grub => (mount_root.join("boot/grub"), "grub.cfg", GRUB_CFG),
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::Filesystem(format!("cannot create {}: {e}", dir.display())))?;
    let path = dir.join(name);
    std::fs::write(&path, content)
        .map_err(|e| Error::Filesystem(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

/// Full placement: detect the flavor, write its configuration to the
/// mounted boot partition and install the MBR stub.
pub fn place(
    device: &Path,
    image: &Path,
    mount_root: &Path,
    sink: &dyn ReportSink,
) -> Result<BootFlavor> {
    let flavor = detect_flavor(image)?;
    sink.info(&format!("installing {flavor:?} boot support"));

    write_config(mount_root, flavor)?;
    write_mbr_stub(device)?;
    Ok(flavor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn image_with(marker: &[u8], at: usize) -> NamedTempFile {
        let mut data = vec![0u8; DETECT_SCAN_BYTES];
        data[at..at + marker.len()].copy_from_slice(marker);
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn detects_syslinux_and_isolinux() {
        let iso = image_with(b"ISOLINUX", 100);
        assert_eq!(detect_flavor(iso.path()).unwrap(), BootFlavor::Syslinux);

        let iso = image_with(b"SYSLINUX", 5000);
        assert_eq!(detect_flavor(iso.path()).unwrap(), BootFlavor::Syslinux);
    }

    #[test]
    fn detects_grub() {
        let iso = image_with(b"GRUB", 200);
        assert_eq!(detect_flavor(iso.path()).unwrap(), BootFlavor::Grub);
    }

    #[test]
    fn syslinux_wins_ties_and_defaults() {
        let neither = image_with(b"nothing here", 0);
        assert_eq!(detect_flavor(neither.path()).unwrap(), BootFlavor::Syslinux);

        let mut data = vec![0u8; DETECT_SCAN_BYTES];
        data[10..18].copy_from_slice(b"SYSLINUX");
        data[100..104].copy_from_slice(b"GRUB");
        let mut both = NamedTempFile::new().unwrap();
        both.write_all(&data).unwrap();
        both.flush().unwrap();
        assert_eq!(detect_flavor(both.path()).unwrap(), BootFlavor::Syslinux);
    }

    #[test]
    fn stub_preserves_signature_and_table() {
        // A fake device image with recognizable bytes everywhere.
        let mut device = NamedTempFile::new().unwrap();
        device.write_all(&vec![0xDDu8; 1024]).unwrap();
        device.flush().unwrap();

        write_mbr_stub(device.path()).unwrap();

        let content = std::fs::read(device.path()).unwrap();
        assert_eq!(&content[..55], &SYSLINUX_STUB[..]);
        assert!(content[55..440].iter().all(|&b| b == 0));
        // Disk signature, partition table and trailer untouched.
        assert!(content[440..512].iter().all(|&b| b == 0xDD));
    }

    #[test]
    fn syslinux_config_layout() {
        let mount = TempDir::new().unwrap();
        write_config(mount.path(), BootFlavor::Syslinux).unwrap();

        let cfg = std::fs::read_to_string(mount.path().join("syslinux/syslinux.cfg")).unwrap();
        assert!(cfg.contains("KERNEL /casper/vmlinuz"));
        assert!(cfg.contains("persistent"));
    }

    #[test]
    fn grub_config_layout() {
        let mount = TempDir::new().unwrap();
        write_config(mount.path(), BootFlavor::Grub).unwrap();

        let cfg = std::fs::read_to_string(mount.path().join("boot/grub/grub.cfg")).unwrap();
        assert!(cfg.contains("menuentry \"Boot with Persistence\""));
        assert!(cfg.contains("initrd /casper/initrd"));
    }
}
