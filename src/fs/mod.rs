//! Filesystem writer.
//!
//! Lays down the minimum on-disk structures that make a fresh partition
//! mountable. FAT32 is written entirely in-process from the codecs; the
//! EXT4 and NTFS paths emit the header-only skeletons described by the
//! codecs, while production persistence formatting goes through the
//! external [`Formatter`](crate::tools::Formatter) collaborator.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;

use rand::Rng;

use crate::codec::{ext4, fat32, guid, ntfs, SECTOR_SIZE};
use crate::device;
use crate::error::{Error, Result};
use crate::report::ReportSink;

/// Filesystems a persistence partition may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    Ntfs,
    ExFat,
    Fat32,
    Fat64,
}

impl FsKind {
    pub fn name(self) -> &'static str {
        match self {
            FsKind::Ext4 => "ext4",
            FsKind::Ntfs => "ntfs",
            FsKind::ExFat => "exfat",
            FsKind::Fat32 => "fat32",
            FsKind::Fat64 => "fat64",
        }
    }

    /// MBR partition type byte for a partition of this kind.
    pub fn mbr_type(self) -> crate::codec::mbr::PartitionType {
        use crate::codec::mbr::PartitionType;
        match self {
            FsKind::Ext4 => PartitionType::Linux,
            FsKind::Ntfs | FsKind::ExFat | FsKind::Fat64 => PartitionType::Ntfs,
            FsKind::Fat32 => PartitionType::Fat32Lba,
        }
    }

    /// GPT type GUID for a partition of this kind.
    pub fn gpt_type_guid(self) -> [u8; 16] {
        use crate::codec::gpt::type_guid;
        match self {
            FsKind::Ext4 => type_guid::LINUX_FILESYSTEM,
            _ => type_guid::BASIC_DATA,
        }
    }

    /// Volume label used for a persistence partition of this kind.
    /// Debian-family live systems look for `casper-rw` on ext4.
    pub fn persistence_label(self) -> &'static str {
        match self {
            FsKind::Ext4 => "casper-rw",
            _ => "PERSISTENCE",
        }
    }
}

impl FromStr for FsKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ext4" => Ok(FsKind::Ext4),
            "ntfs" => Ok(FsKind::Ntfs),
            "exfat" => Ok(FsKind::ExFat),
            "fat32" => Ok(FsKind::Fat32),
            "fat64" => Ok(FsKind::Fat64),
            other => Err(Error::InvalidArgument(format!(
                "unsupported filesystem '{other}' (expected ext4, ntfs, exfat, fat32 or fat64)"
            ))),
        }
    }
}

/// Write the minimum structures for `kind` onto `partition`.
///
/// Any partial write surfaces as `Filesystem` without rollback; the caller
/// is expected to wipe and retry.
pub fn create_filesystem(
    partition: &Path,
    kind: FsKind,
    label: &str,
    sink: &dyn ReportSink,
) -> Result<()> {
    sink.info(&format!(
        "creating {} filesystem on {}",
        kind.name(),
        partition.display()
    ));

    match kind {
        FsKind::Fat32 | FsKind::Fat64 => write_fat32(partition, label),
        FsKind::Ext4 => write_ext4_skeleton(partition, label),
        FsKind::Ntfs => write_ntfs_skeleton(partition, label),
        FsKind::ExFat => Err(Error::Filesystem(
            "no in-process exfat writer; use the external formatter".into(),
        )),
    }
}

/// Full in-process FAT32 layout: boot sector, FSInfo, their backups at
/// sectors 6 and 7, the first sector of each FAT, and a zeroed root
/// directory cluster.
pub fn write_fat32(partition: &Path, label: &str) -> Result<()> {
    let total_sectors = partition_sectors(partition)?;
    let total_sectors = u32::try_from(total_sectors).unwrap_or(u32::MAX);

    let volume_id: u32 = rand::thread_rng().gen();
    let boot = fat32::Fat32BootSector::new(total_sectors, volume_id, label);
    let boot_sector = boot.pack();
    let fsinfo = fat32::pack_fsinfo();
    let fat = fat32::initial_fat_sector();

    let mut file = device::open_sync_rw(partition)?;
    let fat_size = u64::from(boot.fat_size());

    write_at(&mut file, partition, 0, &boot_sector)?;
    write_at(&mut file, partition, SECTOR_SIZE, &fsinfo)?;
    write_at(&mut file, partition, 6 * SECTOR_SIZE, &boot_sector)?;
    write_at(&mut file, partition, 7 * SECTOR_SIZE, &fsinfo)?;

    let fat1 = u64::from(fat32::RESERVED_SECTORS) * SECTOR_SIZE;
    let fat2 = (u64::from(fat32::RESERVED_SECTORS) + fat_size) * SECTOR_SIZE;
    write_at(&mut file, partition, fat1, &fat)?;
    write_at(&mut file, partition, fat2, &fat)?;

    // Root directory: zero the first data cluster.
    let data_start = u64::from(boot.data_start_sector()) * SECTOR_SIZE;
    let cluster = vec![0u8; usize::from(fat32::SECTORS_PER_CLUSTER) * SECTOR_SIZE as usize];
    write_at(&mut file, partition, data_start, &cluster)?;

    file.sync_all()
        .map_err(|e| Error::Filesystem(format!("fsync after FAT32 creation failed: {e}")))?;
    Ok(())
}

/// Header-only ext4: the superblock at offset 1024 and nothing else.
pub fn write_ext4_skeleton(partition: &Path, label: &str) -> Result<()> {
    let size = device::node_size_bytes(partition)?;
    let blocks = u32::try_from(size / ext4::BLOCK_SIZE).unwrap_or(u32::MAX);

    let sb = ext4::Ext4SuperBlock::new(blocks, guid::generate(), label);
    let mut file = device::open_sync_rw(partition)?;
    write_at(&mut file, partition, ext4::SUPERBLOCK_OFFSET, &sb.pack())?;
    file.sync_all()
        .map_err(|e| Error::Filesystem(format!("fsync after ext4 superblock failed: {e}")))?;
    Ok(())
}

/// Header-only NTFS: just the boot sector. The label is accepted for
/// interface symmetry but NTFS stores it in the $Volume file, which only
/// the external formatter writes.
pub fn write_ntfs_skeleton(partition: &Path, _label: &str) -> Result<()> {
    let total_sectors = partition_sectors(partition)?;
    let serial: u64 = rand::thread_rng().gen();

    let bs = ntfs::NtfsBootSector::new(total_sectors, serial);
    let mut file = device::open_sync_rw(partition)?;
    write_at(&mut file, partition, 0, &bs.pack())?;
    file.sync_all()
        .map_err(|e| Error::Filesystem(format!("fsync after NTFS boot sector failed: {e}")))?;
    Ok(())
}

fn partition_sectors(partition: &Path) -> Result<u64> {
    Ok(device::node_size_bytes(partition)? / SECTOR_SIZE)
}

fn write_at(file: &mut std::fs::File, partition: &Path, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        Error::Filesystem(format!(
            "seek to {offset} on {} failed: {e}",
            partition.display()
        ))
    })?;
    file.write_all(data).map_err(|e| {
        Error::Filesystem(format!(
            "write at {offset} on {} failed: {e}",
            partition.display()
        ))
    })
}
