//! Master boot record codec.
//!
//! Layout: 440 bytes of boot code, 4-byte disk signature, 2 reserved
//! bytes, four 16-byte partition entries at offset 446, and the 0x55 0xAA
//! trailer. CHS fields use the fixed 255-head / 63-sector translation
//! with the cylinder clamped at 1023.

use crate::error::{Error, Result};

/// Serialized size of an MBR sector.
pub const MBR_SIZE: usize = 512;

/// Bytes reserved for boot code before the disk signature.
pub const BOOT_CODE_SIZE: usize = 440;

/// Offset of the first partition entry.
pub const ENTRY_OFFSET: usize = 446;

/// Size of one partition entry.
pub const ENTRY_SIZE: usize = 16;

/// Number of primary partition entries.
pub const ENTRY_COUNT: usize = 4;

/// Status byte marking a bootable entry.
pub const BOOT_FLAG: u8 = 0x80;

/// Partition type bytes the composer creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartitionType {
    Empty = 0x00,
    Ntfs = 0x07,
    Fat32 = 0x0B,
    Fat32Lba = 0x0C,
    Linux = 0x83,
    GptProtective = 0xEE,
    EfiSystem = 0xEF,
}

impl PartitionType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Human-readable filesystem name for a raw partition type byte.
pub fn describe_type(kind: u8) -> &'static str {
    match kind {
        0x00 => "Empty",
        0x07 => "NTFS/ExFAT",
        0x0B | 0x0C => "FAT32",
        0x83 => "Linux",
        0xEE => "GPT protective",
        0xEF => "EFI",
        _ => "Unknown",
    }
}

/// Convert an LBA to the packed 3-byte CHS form (255 heads, 63
/// sectors/track, cylinder clamped at 1023).
pub fn lba_to_chs(lba: u32) -> [u8; 3] {
    const SECTORS_PER_TRACK: u32 = 63;
    const HEADS: u32 = 255;

    let mut cylinder = lba / (HEADS * SECTORS_PER_TRACK);
    let rem = lba % (HEADS * SECTORS_PER_TRACK);
    let head = rem / SECTORS_PER_TRACK;
    let sector = rem % SECTORS_PER_TRACK + 1;

    if cylinder > 1023 {
        cylinder = 1023;
    }

    [
        (head & 0xFF) as u8,
        (((cylinder >> 2) & 0xC0) | (sector & 0x3F)) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

/// One of the four classical partition entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MbrPartition {
    pub status: u8,
    pub first_chs: [u8; 3],
    pub kind: u8,
    pub last_chs: [u8; 3],
    pub first_lba: u32,
    pub sector_count: u32,
}

impl MbrPartition {
    /// Build an entry with CHS fields derived from the LBA range.
    pub fn new(first_lba: u32, sector_count: u32, kind: PartitionType, bootable: bool) -> Self {
        MbrPartition {
            status: if bootable { BOOT_FLAG } else { 0x00 },
            first_chs: lba_to_chs(first_lba),
            kind: kind.as_byte(),
            last_chs: lba_to_chs(first_lba + sector_count - 1),
            first_lba,
            sector_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind == 0x00
    }

    pub fn is_bootable(&self) -> bool {
        self.status == BOOT_FLAG
    }

    /// First LBA past the end of the entry.
    pub fn end_lba(&self) -> u64 {
        u64::from(self.first_lba) + u64::from(self.sector_count)
    }

    fn pack(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0] = self.status;
        buf[1..4].copy_from_slice(&self.first_chs);
        buf[4] = self.kind;
        buf[5..8].copy_from_slice(&self.last_chs);
        buf[8..12].copy_from_slice(&self.first_lba.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sector_count.to_le_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Self {
        MbrPartition {
            status: buf[0],
            first_chs: [buf[1], buf[2], buf[3]],
            kind: buf[4],
            last_chs: [buf[5], buf[6], buf[7]],
            first_lba: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            sector_count: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// A full MBR sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    pub boot_code: [u8; BOOT_CODE_SIZE],
    pub disk_signature: u32,
    pub partitions: [MbrPartition; ENTRY_COUNT],
}

impl Mbr {
    /// A blank table: zero boot code, the given disk signature, no
    /// partitions.
    pub fn new(disk_signature: u32) -> Self {
        Mbr {
            boot_code: [0u8; BOOT_CODE_SIZE],
            disk_signature,
            partitions: [MbrPartition::default(); ENTRY_COUNT],
        }
    }

    /// The protective MBR preceding a GPT: a single 0xEE entry spanning
    /// `[1, min(device_sectors - 1, u32::MAX)]`.
    pub fn protective(device_sectors: u64) -> Self {
        let count = (device_sectors - 1).min(u64::from(u32::MAX)) as u32;
        let mut mbr = Mbr::new(0);
        mbr.partitions[0] = MbrPartition {
            status: 0x00,
            first_chs: lba_to_chs(1),
            kind: PartitionType::GptProtective.as_byte(),
            last_chs: [0xFF, 0xFF, 0xFF],
            first_lba: 1,
            sector_count: count,
        };
        mbr
    }

    /// Serialize to a 512-byte sector ending 0x55 0xAA.
    pub fn pack(&self) -> [u8; MBR_SIZE] {
        let mut buf = [0u8; MBR_SIZE];
        buf[..BOOT_CODE_SIZE].copy_from_slice(&self.boot_code);
        buf[440..444].copy_from_slice(&self.disk_signature.to_le_bytes());
        for (i, part) in self.partitions.iter().enumerate() {
            let at = ENTRY_OFFSET + i * ENTRY_SIZE;
            buf[at..at + ENTRY_SIZE].copy_from_slice(&part.pack());
        }
        buf[510] = 0x55;
        buf[511] = 0xAA;
        buf
    }

    /// Parse a 512-byte sector. Fails on short buffers; the boot
    /// signature is reported by [`has_boot_signature`], not enforced here,
    /// because the analyzer needs to inspect unsigned sectors too.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < MBR_SIZE {
            return Err(Error::InvalidArgument(format!(
                "MBR requires {MBR_SIZE} bytes, got {}",
                buf.len()
            )));
        }

        let mut boot_code = [0u8; BOOT_CODE_SIZE];
        boot_code.copy_from_slice(&buf[..BOOT_CODE_SIZE]);

        let mut partitions = [MbrPartition::default(); ENTRY_COUNT];
        for (i, part) in partitions.iter_mut().enumerate() {
            let at = ENTRY_OFFSET + i * ENTRY_SIZE;
            *part = MbrPartition::parse(&buf[at..at + ENTRY_SIZE]);
        }

        Ok(Mbr {
            boot_code,
            disk_signature: u32::from_le_bytes([buf[440], buf[441], buf[442], buf[443]]),
            partitions,
        })
    }

    /// Index of the first unused entry, if any.
    pub fn first_free_slot(&self) -> Option<usize> {
        self.partitions.iter().position(|p| p.is_empty())
    }

    /// True when any of the four entries is in use.
    pub fn has_partitions(&self) -> bool {
        self.partitions.iter().any(|p| !p.is_empty())
    }
}

/// Check the 0x55 0xAA trailer on a raw sector.
pub fn has_boot_signature(sector: &[u8]) -> bool {
    sector.len() >= MBR_SIZE && sector[510] == 0x55 && sector[511] == 0xAA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_sets_trailer_and_signature() {
        let mbr = Mbr::new(0xDEAD_BEEF);
        let buf = mbr.pack();
        assert_eq!(buf[510], 0x55);
        assert_eq!(buf[511], 0xAA);
        assert_eq!(&buf[440..444], &0xDEAD_BEEFu32.to_le_bytes());
        assert!(has_boot_signature(&buf));
    }

    #[test]
    fn round_trip_preserves_entries() {
        let mut mbr = Mbr::new(7);
        mbr.partitions[0] = MbrPartition::new(2048, 409600, PartitionType::Fat32Lba, true);
        mbr.partitions[1] = MbrPartition::new(411648, 1048576, PartitionType::Linux, false);

        let parsed = Mbr::parse(&mbr.pack()).unwrap();
        assert_eq!(parsed, mbr);
        assert_eq!(parsed.partitions[0].kind, 0x0C);
        assert!(parsed.partitions[0].is_bootable());
        assert_eq!(parsed.first_free_slot(), Some(2));
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(Mbr::parse(&[0u8; 511]).is_err());
    }

    #[test]
    fn protective_entry_covers_disk() {
        let mbr = Mbr::protective(1_048_576);
        let p = &mbr.partitions[0];
        assert_eq!(p.kind, 0xEE);
        assert_eq!(p.first_lba, 1);
        assert_eq!(p.sector_count, 1_048_575);
    }

    #[test]
    fn protective_entry_clamps_huge_disks() {
        let mbr = Mbr::protective(1 << 40);
        assert_eq!(mbr.partitions[0].sector_count, u32::MAX);
    }

    #[test]
    fn chs_low_lba() {
        // LBA 0: cylinder 0, head 0, sector 1.
        assert_eq!(lba_to_chs(0), [0, 1, 0]);
        // LBA 63: head 1, sector 1.
        assert_eq!(lba_to_chs(63), [1, 1, 0]);
    }

    #[test]
    fn chs_clamps_cylinder() {
        // Far past the CHS horizon; cylinder must clamp at 1023.
        let chs = lba_to_chs(0xFFFF_FFFF);
        let cylinder = (u32::from(chs[1] & 0xC0) << 2) | u32::from(chs[2]);
        assert_eq!(cylinder, 1023);
    }
}
