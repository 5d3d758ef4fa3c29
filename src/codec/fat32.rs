//! FAT32 boot sector and FSInfo codec.
//!
//! Fixed geometry: 512 bytes/sector, 8 sectors/cluster, 32 reserved
//! sectors, 2 FATs, root directory in cluster 2, FSInfo in sector 1,
//! backup boot sector in sector 6.

use crate::error::{Error, Result};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const FSINFO_SIZE: usize = 512;

pub const BYTES_PER_SECTOR: u16 = 512;
pub const SECTORS_PER_CLUSTER: u8 = 8;
pub const RESERVED_SECTORS: u16 = 32;
pub const NUM_FATS: u8 = 2;
pub const ROOT_CLUSTER: u32 = 2;
pub const FSINFO_SECTOR: u16 = 1;
pub const BACKUP_BOOT_SECTOR: u16 = 6;

const OEM_NAME: &[u8; 8] = b"MSWIN4.1";
const FS_TYPE: &[u8; 8] = b"FAT32   ";

/// Sectors per FAT for a partition of `total_sectors`.
pub fn fat_size_32(total_sectors: u32) -> u32 {
    let data = total_sectors - u32::from(RESERVED_SECTORS);
    let divisor = 256 * u32::from(SECTORS_PER_CLUSTER) + u32::from(NUM_FATS);
    (data + divisor - 1) / divisor
}

/// FAT32 boot sector (BPB + extended fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fat32BootSector {
    pub total_sectors: u32,
    pub volume_id: u32,
    pub label: String,
}

impl Fat32BootSector {
    pub fn new(total_sectors: u32, volume_id: u32, label: &str) -> Self {
        Fat32BootSector {
            total_sectors,
            volume_id,
            label: label.to_string(),
        }
    }

    pub fn fat_size(&self) -> u32 {
        fat_size_32(self.total_sectors)
    }

    /// First sector of the data area (cluster 2).
    pub fn data_start_sector(&self) -> u32 {
        u32::from(RESERVED_SECTORS) + u32::from(NUM_FATS) * self.fat_size()
    }

    /// Serialize to a 512-byte boot sector.
    pub fn pack(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut buf = [0u8; BOOT_SECTOR_SIZE];

        buf[0] = 0xEB;
        buf[1] = 0x58;
        buf[2] = 0x90;
        buf[3..11].copy_from_slice(OEM_NAME);
        buf[11..13].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
        buf[13] = SECTORS_PER_CLUSTER;
        buf[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
        buf[16] = NUM_FATS;
        // Root entry count, total sectors (16-bit) and FAT size (16-bit)
        // stay zero on FAT32.
        buf[21] = 0xF8; // media descriptor: fixed disk
        buf[24..26].copy_from_slice(&63u16.to_le_bytes()); // sectors/track
        buf[26..28].copy_from_slice(&255u16.to_le_bytes()); // heads
        buf[32..36].copy_from_slice(&self.total_sectors.to_le_bytes());
        buf[36..40].copy_from_slice(&self.fat_size().to_le_bytes());
        buf[44..48].copy_from_slice(&ROOT_CLUSTER.to_le_bytes());
        buf[48..50].copy_from_slice(&FSINFO_SECTOR.to_le_bytes());
        buf[50..52].copy_from_slice(&BACKUP_BOOT_SECTOR.to_le_bytes());
        buf[64] = 0x80; // BIOS drive number
        buf[66] = 0x29; // extended boot signature
        buf[67..71].copy_from_slice(&self.volume_id.to_le_bytes());

        let mut label = [b' '; 11];
        for (dst, src) in label.iter_mut().zip(self.label.bytes()) {
            *dst = src;
        }
        buf[71..82].copy_from_slice(&label);
        buf[82..90].copy_from_slice(FS_TYPE);

        buf[510] = 0x55;
        buf[511] = 0xAA;
        buf
    }

    /// Parse a boot sector previously produced by [`pack`](Self::pack).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BOOT_SECTOR_SIZE {
            return Err(Error::InvalidArgument(format!(
                "FAT32 boot sector requires {BOOT_SECTOR_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if buf[510] != 0x55 || buf[511] != 0xAA {
            return Err(Error::InvalidArgument(
                "FAT32 boot sector missing 0xAA55 trailer".into(),
            ));
        }

        let label_bytes = &buf[71..82];
        let label = String::from_utf8_lossy(label_bytes).trim_end().to_string();

        Ok(Fat32BootSector {
            total_sectors: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            volume_id: u32::from_le_bytes(buf[67..71].try_into().unwrap()),
            label,
        })
    }
}

/// FSInfo sector. Free-count and next-free hints are left unknown
/// (0xFFFFFFFF), which FAT drivers treat as "recompute on mount".
pub fn pack_fsinfo() -> [u8; FSINFO_SIZE] {
    let mut buf = [0u8; FSINFO_SIZE];
    buf[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes());
    buf[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes());
    buf[488..492].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // free count
    buf[492..496].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes()); // next free
    buf[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    buf
}

/// First FAT sector: media entry, end-of-chain entry, and the root
/// directory cluster terminated.
pub fn initial_fat_sector() -> [u8; 512] {
    let mut buf = [0u8; 512];
    buf[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    buf[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    buf[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    buf
}
