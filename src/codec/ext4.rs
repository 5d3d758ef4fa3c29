//! EXT4 superblock codec.
//!
//! Emits the 1024-byte superblock that lives at byte offset 1024 of a
//! partition. This is the minimum structure that makes the partition
//! recognizable as ext4; block groups and inode tables are the external
//! formatter's job, so a filesystem built from this codec alone is a
//! header-only skeleton, not a production filesystem.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Serialized superblock size.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Byte offset of the superblock within the partition.
pub const SUPERBLOCK_OFFSET: u64 = 1024;

pub const EXT4_MAGIC: u16 = 0xEF53;
pub const BLOCK_SIZE: u64 = 4096;
pub const INODES_PER_GROUP: u32 = 8192;
pub const BLOCKS_PER_GROUP: u32 = 32768;
pub const INODE_SIZE: u16 = 256;

const FEATURE_COMPAT: u32 = 0x38;
const FEATURE_INCOMPAT: u32 = 0x2C2;
const FEATURE_RO_COMPAT: u32 = 0x7B;

/// EXT4 superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext4SuperBlock {
    pub block_count: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub timestamp: u32,
}

impl Ext4SuperBlock {
    /// Build a superblock for a partition of `block_count` 4 KiB blocks,
    /// stamped with the current time.
    pub fn new(block_count: u32, uuid: [u8; 16], volume_name: &str) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        Ext4SuperBlock {
            block_count,
            uuid,
            volume_name: volume_name.to_string(),
            timestamp,
        }
    }

    fn block_groups(&self) -> u32 {
        (self.block_count + BLOCKS_PER_GROUP - 1) / BLOCKS_PER_GROUP
    }

    fn inode_count(&self) -> u32 {
        INODES_PER_GROUP * self.block_groups()
    }

    /// Serialize to the 1024-byte on-disk form.
    pub fn pack(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        let inodes = self.inode_count();

        buf[0..4].copy_from_slice(&inodes.to_le_bytes());
        buf[4..8].copy_from_slice(&self.block_count.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.block_count / 20).to_le_bytes()); // reserved blocks
        buf[12..16].copy_from_slice(&self.block_count.saturating_sub(1000).to_le_bytes());
        buf[16..20].copy_from_slice(&(inodes - 11).to_le_bytes()); // free inodes
        // first data block stays 0 for 4 KiB blocks.
        buf[24..28].copy_from_slice(&2u32.to_le_bytes()); // log_block_size: 2^(10+2) = 4096
        buf[28..32].copy_from_slice(&2u32.to_le_bytes()); // log_cluster_size
        buf[32..36].copy_from_slice(&BLOCKS_PER_GROUP.to_le_bytes());
        buf[36..40].copy_from_slice(&BLOCKS_PER_GROUP.to_le_bytes()); // clusters per group
        buf[40..44].copy_from_slice(&INODES_PER_GROUP.to_le_bytes());
        buf[44..48].copy_from_slice(&self.timestamp.to_le_bytes()); // mount time
        buf[48..52].copy_from_slice(&self.timestamp.to_le_bytes()); // write time
        buf[54..56].copy_from_slice(&65535u16.to_le_bytes()); // max mount count
        buf[56..58].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        buf[58..60].copy_from_slice(&1u16.to_le_bytes()); // state: clean
        buf[60..62].copy_from_slice(&1u16.to_le_bytes()); // errors: continue
        buf[64..68].copy_from_slice(&self.timestamp.to_le_bytes()); // last check
        buf[76..80].copy_from_slice(&1u32.to_le_bytes()); // revision: dynamic
        buf[84..88].copy_from_slice(&11u32.to_le_bytes()); // first inode
        buf[88..90].copy_from_slice(&INODE_SIZE.to_le_bytes());
        buf[92..96].copy_from_slice(&FEATURE_COMPAT.to_le_bytes());
        buf[96..100].copy_from_slice(&FEATURE_INCOMPAT.to_le_bytes());
        buf[100..104].copy_from_slice(&FEATURE_RO_COMPAT.to_le_bytes());
        buf[104..120].copy_from_slice(&self.uuid);

        let mut name = [0u8; 16];
        for (dst, src) in name.iter_mut().zip(self.volume_name.bytes()) {
            *dst = src;
        }
        buf[120..136].copy_from_slice(&name);

        buf
    }

    /// Parse a superblock image, verifying the magic.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "ext4 superblock requires {SUPERBLOCK_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let magic = u16::from_le_bytes([buf[56], buf[57]]);
        if magic != EXT4_MAGIC {
            return Err(Error::InvalidArgument(format!(
                "bad ext4 magic 0x{magic:04X}"
            )));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[104..120]);
        let name_end = buf[120..136].iter().position(|&b| b == 0).unwrap_or(16);
        let volume_name = String::from_utf8_lossy(&buf[120..120 + name_end]).into_owned();

        Ok(Ext4SuperBlock {
            block_count: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            uuid,
            volume_name,
            timestamp: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        })
    }
}
