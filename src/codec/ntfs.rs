//! NTFS boot sector codec.
//!
//! Minimum boot sector placing the MFT mid-partition and its mirror in
//! the final cluster. `clusters_per_file_record` is a signed exponent:
//! -10 means a file record of 2^10 = 1024 bytes.

use crate::error::{Error, Result};

pub const BOOT_SECTOR_SIZE: usize = 512;

const OEM_ID: &[u8; 8] = b"NTFS    ";
pub const SECTORS_PER_CLUSTER: u8 = 8;

/// Signed exponent encoding a 1024-byte file record.
pub const CLUSTERS_PER_FILE_RECORD: i8 = -10;
pub const CLUSTERS_PER_INDEX_BUFFER: i8 = 1;

/// NTFS boot sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtfsBootSector {
    pub total_sectors: u64,
    pub volume_serial: u64,
}

impl NtfsBootSector {
    pub fn new(total_sectors: u64, volume_serial: u64) -> Self {
        NtfsBootSector {
            total_sectors,
            volume_serial,
        }
    }

    pub fn mft_cluster(&self) -> u64 {
        self.total_sectors / 2
    }

    pub fn mft_mirror_cluster(&self) -> u64 {
        self.total_sectors - 1
    }

    /// Serialize to a 512-byte boot sector.
    pub fn pack(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut buf = [0u8; BOOT_SECTOR_SIZE];

        buf[0] = 0xEB;
        buf[1] = 0x52;
        buf[2] = 0x90;
        buf[3..11].copy_from_slice(OEM_ID);
        buf[11..13].copy_from_slice(&512u16.to_le_bytes());
        buf[13] = SECTORS_PER_CLUSTER;
        buf[21] = 0xF8; // media descriptor
        buf[24..26].copy_from_slice(&63u16.to_le_bytes()); // sectors/track
        buf[26..28].copy_from_slice(&255u16.to_le_bytes()); // heads
        buf[40..48].copy_from_slice(&self.total_sectors.to_le_bytes());
        buf[48..56].copy_from_slice(&self.mft_cluster().to_le_bytes());
        buf[56..64].copy_from_slice(&self.mft_mirror_cluster().to_le_bytes());
        buf[64] = CLUSTERS_PER_FILE_RECORD as u8;
        buf[68] = CLUSTERS_PER_INDEX_BUFFER as u8;
        buf[72..80].copy_from_slice(&self.volume_serial.to_le_bytes());

        buf[510] = 0x55;
        buf[511] = 0xAA;
        buf
    }

    /// Parse a boot sector, verifying the OEM signature and trailer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BOOT_SECTOR_SIZE {
            return Err(Error::InvalidArgument(format!(
                "NTFS boot sector requires {BOOT_SECTOR_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if &buf[3..11] != OEM_ID {
            return Err(Error::InvalidArgument("missing NTFS OEM id".into()));
        }
        if buf[510] != 0x55 || buf[511] != 0xAA {
            return Err(Error::InvalidArgument(
                "NTFS boot sector missing 0xAA55 trailer".into(),
            ));
        }

        Ok(NtfsBootSector {
            total_sectors: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            volume_serial: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
        })
    }
}
