//! GUID partition table codec.
//!
//! Primary header at LBA 1, 128-entry array at LBA 2..=33, backup array at
//! `device_sectors - 33`, backup header in the last sector. The header
//! CRC32 covers exactly `header_size` bytes with its own CRC field zeroed
//! during computation; the array CRC32 covers
//! `entry_count * entry_size` bytes.

use crate::codec::{crc32, SECTOR_SIZE};
use crate::error::{Error, Result};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;

/// Bytes of the header covered by the CRC.
pub const HEADER_SIZE: usize = 92;

/// Size of one partition entry.
pub const ENTRY_SIZE: usize = 128;

/// Entries in the array.
pub const ENTRY_COUNT: usize = 128;

/// Sectors occupied by the entry array (128 * 128 / 512).
pub const ENTRY_ARRAY_SECTORS: u64 = (ENTRY_SIZE * ENTRY_COUNT) as u64 / SECTOR_SIZE;

/// First LBA usable by partitions (after the primary header + array).
pub const FIRST_USABLE_LBA: u64 = 34;

/// UTF-16 code units available for a partition name.
pub const NAME_UNITS: usize = 36;

/// Partition type GUIDs, stored in on-disk (mixed-endian) byte order.
pub mod type_guid {
    /// EFI System Partition, C12A7328-F81F-11D2-BA4B-00A0C93EC93B.
    pub const EFI_SYSTEM: [u8; 16] = [
        0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9,
        0x3B,
    ];

    /// Linux filesystem data, 0FC63DAF-8483-4772-8E79-3D69D8477DE4.
    pub const LINUX_FILESYSTEM: [u8; 16] = [
        0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D,
        0xE4,
    ];

    /// Microsoft basic data, EBD0A0A2-B9E5-4433-87C0-68B6B72699C7.
    pub const BASIC_DATA: [u8; 16] = [
        0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99,
        0xC7,
    ];
}

/// GPT header, primary or backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entry_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entry_array_crc32: u32,
}

impl GptHeader {
    /// Primary header for a disk of `device_sectors` sectors.
    pub fn primary(device_sectors: u64, disk_guid: [u8; 16]) -> Self {
        GptHeader {
            current_lba: 1,
            backup_lba: device_sectors - 1,
            first_usable_lba: FIRST_USABLE_LBA,
            last_usable_lba: device_sectors - FIRST_USABLE_LBA,
            disk_guid,
            entry_lba: 2,
            entry_count: ENTRY_COUNT as u32,
            entry_size: ENTRY_SIZE as u32,
            entry_array_crc32: 0,
        }
    }

    /// Derive the backup header: current/backup LBAs swapped, entry array
    /// relocated to just before the backup header.
    pub fn backup(&self) -> Self {
        let mut header = self.clone();
        header.current_lba = self.backup_lba;
        header.backup_lba = self.current_lba;
        header.entry_lba = self.backup_lba - ENTRY_ARRAY_SECTORS;
        header
    }

    /// CRC over the first `HEADER_SIZE` bytes with the CRC field zeroed.
    pub fn header_crc32(&self) -> u32 {
        crc32(&self.pack_fields())
    }

    /// Serialize to a zero-padded 512-byte sector with the CRC filled in.
    pub fn pack(&self) -> [u8; SECTOR_SIZE as usize] {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        let fields = self.pack_fields();
        sector[..HEADER_SIZE].copy_from_slice(&fields);
        sector[16..20].copy_from_slice(&self.header_crc32().to_le_bytes());
        sector
    }

    fn pack_fields(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(GPT_SIGNATURE);
        buf[8..12].copy_from_slice(&GPT_REVISION.to_le_bytes());
        buf[12..16].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        // buf[16..20] is the CRC field, zero while hashing.
        buf[24..32].copy_from_slice(&self.current_lba.to_le_bytes());
        buf[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        buf[56..72].copy_from_slice(&self.disk_guid);
        buf[72..80].copy_from_slice(&self.entry_lba.to_le_bytes());
        buf[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        buf[88..92].copy_from_slice(&self.entry_array_crc32.to_le_bytes());
        buf
    }

    /// Parse a header sector, verifying signature and CRC.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "GPT header requires {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if &buf[0..8] != GPT_SIGNATURE {
            return Err(Error::InvalidArgument("missing EFI PART signature".into()));
        }

        let stored_crc = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&buf[56..72]);

        let header = GptHeader {
            current_lba: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            backup_lba: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            first_usable_lba: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            last_usable_lba: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            disk_guid,
            entry_lba: u64::from_le_bytes(buf[72..80].try_into().unwrap()),
            entry_count: u32::from_le_bytes(buf[80..84].try_into().unwrap()),
            entry_size: u32::from_le_bytes(buf[84..88].try_into().unwrap()),
            entry_array_crc32: u32::from_le_bytes(buf[88..92].try_into().unwrap()),
        };

        if header.header_crc32() != stored_crc {
            return Err(Error::InvalidArgument("GPT header CRC mismatch".into()));
        }

        Ok(header)
    }
}

/// One partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn is_empty(&self) -> bool {
        self.type_guid == [0u8; 16]
    }

    /// Serialize to 128 bytes. The name is encoded UTF-16LE and truncated
    /// to 36 code units.
    pub fn pack(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..16].copy_from_slice(&self.type_guid);
        buf[16..32].copy_from_slice(&self.unique_guid);
        buf[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self.name.encode_utf16().take(NAME_UNITS).enumerate() {
            let at = 56 + i * 2;
            buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        buf
    }

    /// Parse 128 bytes back into an entry.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < ENTRY_SIZE {
            return Err(Error::InvalidArgument(format!(
                "GPT entry requires {ENTRY_SIZE} bytes, got {}",
                buf.len()
            )));
        }

        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&buf[0..16]);
        let mut unique_guid = [0u8; 16];
        unique_guid.copy_from_slice(&buf[16..32]);

        let mut units = Vec::with_capacity(NAME_UNITS);
        for i in 0..NAME_UNITS {
            let at = 56 + i * 2;
            let unit = u16::from_le_bytes([buf[at], buf[at + 1]]);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        Ok(GptEntry {
            type_guid,
            unique_guid,
            first_lba: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            last_lba: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            attributes: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
            name: String::from_utf16_lossy(&units),
        })
    }
}

/// CRC over a raw entry array (`ENTRY_COUNT * ENTRY_SIZE` bytes).
pub fn entry_array_crc32(array: &[u8]) -> Result<u32> {
    let expected = ENTRY_COUNT * ENTRY_SIZE;
    if array.len() != expected {
        return Err(Error::InvalidArgument(format!(
            "GPT entry array requires {expected} bytes, got {}",
            array.len()
        )));
    }
    Ok(crc32(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: [u8; 16] = [
        0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x47, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
        0x00,
    ];

    #[test]
    fn primary_header_geometry() {
        let header = GptHeader::primary(1_048_576, GUID);
        assert_eq!(header.current_lba, 1);
        assert_eq!(header.backup_lba, 1_048_575);
        assert_eq!(header.first_usable_lba, 34);
        assert_eq!(header.last_usable_lba, 1_048_542);
        assert_eq!(header.entry_lba, 2);
    }

    #[test]
    fn backup_header_swaps_and_relocates() {
        let primary = GptHeader::primary(1_048_576, GUID);
        let backup = primary.backup();
        assert_eq!(backup.current_lba, 1_048_575);
        assert_eq!(backup.backup_lba, 1);
        assert_eq!(backup.entry_lba, 1_048_575 - 32);
        assert_eq!(backup.last_usable_lba, primary.last_usable_lba);
    }

    #[test]
    fn header_crc_is_stable_for_fixed_guid() {
        let a = GptHeader::primary(1_048_576, GUID);
        let b = GptHeader::primary(1_048_576, GUID);
        assert_eq!(a.header_crc32(), b.header_crc32());
    }

    #[test]
    fn packed_header_round_trips_with_valid_crc() {
        let mut header = GptHeader::primary(1_048_576, GUID);
        header.entry_array_crc32 = entry_array_crc32(&[0u8; ENTRY_COUNT * ENTRY_SIZE]).unwrap();

        let sector = header.pack();
        // The stored CRC matches a recomputation over the zeroed-CRC image.
        let mut image = [0u8; HEADER_SIZE];
        image.copy_from_slice(&sector[..HEADER_SIZE]);
        let stored = u32::from_le_bytes([image[16], image[17], image[18], image[19]]);
        image[16..20].fill(0);
        assert_eq!(crate::codec::crc32(&image), stored);

        assert_eq!(GptHeader::parse(&sector).unwrap(), header);
    }

    #[test]
    fn parse_rejects_corrupt_header() {
        let header = GptHeader::primary(1_048_576, GUID);
        let mut sector = header.pack();
        sector[40] ^= 0xFF;
        assert!(GptHeader::parse(&sector).is_err());

        let mut unsigned = header.pack();
        unsigned[0] = b'X';
        assert!(GptHeader::parse(&unsigned).is_err());
    }

    #[test]
    fn entry_round_trips_name() {
        let entry = GptEntry {
            type_guid: type_guid::LINUX_FILESYSTEM,
            unique_guid: GUID,
            first_lba: 2048,
            last_lba: 4_196_351,
            attributes: 0,
            name: "persistence".to_string(),
        };
        let parsed = GptEntry::parse(&entry.pack()).unwrap();
        assert_eq!(parsed, entry);
        assert!(!parsed.is_empty());
    }

    #[test]
    fn entry_name_truncates_at_36_units() {
        let entry = GptEntry {
            type_guid: type_guid::BASIC_DATA,
            unique_guid: GUID,
            first_lba: 1,
            last_lba: 2,
            attributes: 0,
            name: "x".repeat(50),
        };
        let parsed = GptEntry::parse(&entry.pack()).unwrap();
        assert_eq!(parsed.name.len(), NAME_UNITS);
    }

    #[test]
    fn zeroed_entry_is_empty() {
        let parsed = GptEntry::parse(&[0u8; ENTRY_SIZE]).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn array_crc_requires_exact_length() {
        assert!(entry_array_crc32(&[0u8; 100]).is_err());
        assert_eq!(
            entry_array_crc32(&[0u8; ENTRY_COUNT * ENTRY_SIZE]).unwrap(),
            crate::codec::crc32(&[0u8; ENTRY_COUNT * ENTRY_SIZE])
        );
    }
}
