//! ISO image analyzer.
//!
//! A pure, bounded reader over the input image: four scans (primary
//! volume descriptor, El Torito boot record, MBR and embedded partitions,
//! boot-file substrings) produce a fingerprint from which the burn
//! strategy is derived. Never reads more than 2 MiB and never writes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::codec::mbr::{self, Mbr};
use crate::error::{Error, Result};

/// Offset of the ISO 9660 primary volume descriptor.
const PVD_OFFSET: u64 = 32768;

/// Offset of sector 17, where El Torito boot records live.
const BOOT_RECORD_OFFSET: u64 = 34816;

/// Window scanned for UEFI markers.
const UEFI_SCAN_BYTES: u64 = 1024 * 1024;

/// Window scanned for boot files.
const BOOT_FILE_SCAN_BYTES: u64 = 2 * 1024 * 1024;

/// Boot files worth reporting when their names appear near the front of
/// the image. Lowercase variants are checked as well.
const BOOT_FILE_PATTERNS: &[&str] = &[
    "ISOLINUX.BIN",
    "SYSLINUX.BIN",
    "BOOTX64.EFI",
    "BOOTIA32.EFI",
    "GRUBX64.EFI",
    "GRUB.CFG",
    "VMLINUZ",
    "INITRD",
];

const UEFI_MARKERS: &[&str] = &["EFI/BOOT", "BOOTX64.EFI", "BOOTIA32.EFI"];

const EL_TORITO_MARKERS: &[&str] = &["EL TORITO", "BOOT CATALOG", "BOOTABLE"];

/// How the image should be put on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnStrategy {
    /// Stream bytes to the whole device.
    RawCopy,
    /// Raw-copy a hybrid image, optionally appending persistence behind
    /// its own partitions.
    HybridPreserve,
    /// Fresh single-FAT32 layout populated from the image's logical
    /// contents.
    SmartExtract,
    /// ESP / data / persistence layout.
    Multipart,
}

/// One MBR entry embedded in a hybrid image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedPartition {
    pub start_lba: u32,
    pub sector_count: u32,
    pub kind: u8,
    pub bootable: bool,
}

impl EmbeddedPartition {
    pub fn filesystem(&self) -> &'static str {
        mbr::describe_type(self.kind)
    }
}

/// Everything the analyzer learned about an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoAnalysis {
    pub has_iso9660: bool,
    pub has_el_torito: bool,
    pub has_mbr_signature: bool,
    pub has_mbr_partitions: bool,
    pub has_uefi: bool,
    pub embedded_partitions: Vec<EmbeddedPartition>,
    pub iso_data_size: u64,
    pub boot_files: Vec<String>,
}

impl IsoAnalysis {
    /// A hybrid image carries a signed MBR with used entries on top of an
    /// ISO 9660 filesystem.
    pub fn is_hybrid(&self) -> bool {
        self.has_mbr_signature && self.has_mbr_partitions && self.has_iso9660
    }

    pub fn has_legacy_boot(&self) -> bool {
        self.has_el_torito || self.is_hybrid()
    }

    pub fn is_multiboot(&self) -> bool {
        self.has_uefi && self.has_legacy_boot()
    }

    /// Human-readable classification.
    pub fn boot_type(&self) -> &'static str {
        if self.is_multiboot() {
            "Multi-Boot (UEFI + Legacy)"
        } else if self.has_uefi {
            "UEFI Only"
        } else if self.has_el_torito {
            "Legacy BIOS (El Torito)"
        } else if self.is_hybrid() {
            "Hybrid ISO"
        } else {
            "Data Only"
        }
    }

    /// Partitions a full Multipart layout would need: one for the data,
    /// an ESP when UEFI boot is wanted and the image is not already
    /// hybrid, one per extra embedded partition, and one for persistence.
    pub fn required_partitions(&self, with_persistence: bool) -> usize {
        let mut count = 1;
        if self.has_uefi && !self.is_hybrid() {
            count += 1;
        }
        count += self.embedded_partitions.len().saturating_sub(1);
        if with_persistence {
            count += 1;
        }
        count
    }

    /// Strategy recommendation.
    pub fn recommended_strategy(&self) -> BurnStrategy {
        if self.is_hybrid() && !self.embedded_partitions.is_empty() {
            BurnStrategy::HybridPreserve
        } else if self.is_multiboot() || self.embedded_partitions.len() > 1 {
            BurnStrategy::Multipart
        } else if self.has_uefi || self.has_el_torito {
            BurnStrategy::SmartExtract
        } else {
            BurnStrategy::RawCopy
        }
    }
}

/// Check that the path is a plausible image and return its size. Images
/// under 1 KiB cannot even hold a boot sector.
pub fn validate(path: &Path) -> Result<u64> {
    let meta = std::fs::metadata(path).map_err(|e| Error::Analysis {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    if !meta.is_file() {
        return Err(Error::Analysis {
            path: path.to_path_buf(),
            cause: "not a regular file".into(),
        });
    }
    if meta.len() < 1024 {
        return Err(Error::Analysis {
            path: path.to_path_buf(),
            cause: "too small to be a valid image".into(),
        });
    }
    Ok(meta.len())
}

/// Run all four scans. Read-only and idempotent: analyzing the same file
/// twice yields identical fingerprints.
pub fn analyze(path: &Path) -> Result<IsoAnalysis> {
    let iso_data_size = validate(path)?;
    let mut file = File::open(path).map_err(|e| Error::file_io(path, e))?;

    let pvd = read_window(&mut file, path, PVD_OFFSET, 2048)?;
    let has_iso9660 = contains(&pvd, b"CD001");

    let boot_record = read_window(&mut file, path, BOOT_RECORD_OFFSET, 2048)?;
    let has_el_torito = EL_TORITO_MARKERS
        .iter()
        .any(|m| contains(&boot_record, m.as_bytes()));

    let sector0 = read_window(&mut file, path, 0, mbr::MBR_SIZE as u64)?;
    let has_mbr_signature = mbr::has_boot_signature(&sector0);
    let embedded_partitions = if has_mbr_signature {
        embedded_partitions(&sector0)?
    } else {
        Vec::new()
    };

    let uefi_window = read_window(&mut file, path, 0, UEFI_SCAN_BYTES.min(iso_data_size))?;
    let has_uefi = UEFI_MARKERS.iter().any(|m| {
        contains(&uefi_window, m.as_bytes())
            || contains(&uefi_window, m.to_ascii_lowercase().as_bytes())
    });

    let boot_window = if iso_data_size > UEFI_SCAN_BYTES {
        read_window(&mut file, path, 0, BOOT_FILE_SCAN_BYTES.min(iso_data_size))?
    } else {
        uefi_window
    };
    let boot_files = BOOT_FILE_PATTERNS
        .iter()
        .filter(|p| {
            contains(&boot_window, p.as_bytes())
                || contains(&boot_window, p.to_ascii_lowercase().as_bytes())
        })
        .map(|p| p.to_string())
        .collect();

    Ok(IsoAnalysis {
        has_iso9660,
        has_el_torito,
        has_mbr_signature,
        has_mbr_partitions: !embedded_partitions.is_empty(),
        has_uefi,
        embedded_partitions,
        iso_data_size,
        boot_files,
    })
}

fn embedded_partitions(sector0: &[u8]) -> Result<Vec<EmbeddedPartition>> {
    let table = Mbr::parse(sector0)?;
    Ok(table
        .partitions
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| EmbeddedPartition {
            start_lba: p.first_lba,
            sector_count: p.sector_count,
            kind: p.kind,
            bootable: p.is_bootable(),
        })
        .collect())
}

/// Read up to `len` bytes at `offset`; short reads near the end of the
/// file return what exists.
fn read_window(file: &mut File, path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::file_io(path, e))?;

    let mut buf = vec![0u8; len as usize];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::file_io(path, e)),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}
