//! Partition table engine.
//!
//! Owns the device handle while a table is being built and enforces the
//! `Uninitialized -> Open -> Written -> Committed` lifecycle: geometry is
//! only known after `initialize`, entries may only be added once a table
//! exists on disk, and nothing is visible to the kernel until `commit`.
//!
//! Accepts disk-image files as well as block nodes, which is how the
//! tests exercise it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::codec::gpt::{self, GptEntry, GptHeader};
use crate::codec::mbr::{Mbr, MbrPartition, PartitionType};
use crate::codec::{guid, SECTOR_SIZE};
use crate::device;
use crate::error::{Error, Result};

const BLKRRPART: libc::c_ulong = 0x125F;

/// Which table flavor the engine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Open,
    Written,
    Committed,
}

/// Builder for the partition table of one device.
pub struct PartitionTable {
    device: PathBuf,
    kind: TableKind,
    file: Option<File>,
    device_sectors: u64,
    state: State,
}

impl PartitionTable {
    pub fn new(device: &Path, kind: TableKind) -> Self {
        PartitionTable {
            device: device.to_path_buf(),
            kind,
            file: None,
            device_sectors: 0,
            state: State::Uninitialized,
        }
    }

    pub fn device_sectors(&self) -> u64 {
        self.device_sectors
    }

    /// Open the device and learn its geometry.
    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state(State::Uninitialized, "initialize")?;

        let size = device::node_size_bytes(&self.device)?;
        self.file = Some(device::open_sync_rw(&self.device)?);
        self.device_sectors = size / SECTOR_SIZE;
        self.state = State::Open;

        log::debug!(
            "{}: {} sectors",
            self.device.display(),
            self.device_sectors
        );
        Ok(())
    }

    /// Write a blank MBR: random disk signature, empty entries, 0xAA55
    /// trailer. The following 2047 sectors are zeroed as well so stale
    /// metadata from a previous layout cannot resurface.
    pub fn create_mbr(&mut self) -> Result<()> {
        self.expect_state(State::Open, "create_mbr")?;

        let mbr = Mbr::new(rand::thread_rng().gen());
        self.write_sector(0, &mbr.pack())?;

        let zeros = [0u8; SECTOR_SIZE as usize];
        for lba in 1..2048u64.min(self.device_sectors) {
            self.write_sector(lba, &zeros)?;
        }

        self.fsync()?;
        self.state = State::Written;
        Ok(())
    }

    /// Write a GPT: protective MBR, primary header, empty entry array,
    /// and the mirrored array + header at the end of the device.
    pub fn create_gpt(&mut self) -> Result<()> {
        self.expect_state(State::Open, "create_gpt")?;

        if self.device_sectors < 2 * gpt::FIRST_USABLE_LBA {
            return Err(Error::InvalidArgument(format!(
                "{} is too small for a GPT",
                self.device.display()
            )));
        }

        let protective = Mbr::protective(self.device_sectors);
        self.write_sector(0, &protective.pack())?;

        let array = vec![0u8; gpt::ENTRY_COUNT * gpt::ENTRY_SIZE];
        let mut primary = GptHeader::primary(self.device_sectors, guid::generate());
        primary.entry_array_crc32 = gpt::entry_array_crc32(&array)?;

        self.write_gpt_structures(&primary, &array)?;

        self.fsync()?;
        self.state = State::Written;
        Ok(())
    }

    /// Add an entry to the first free MBR slot. Fails when all four are
    /// used or the requested range collides with an existing entry.
    /// Returns the 1-based partition index.
    pub fn add_mbr_partition(
        &mut self,
        start_lba: u32,
        sector_count: u32,
        kind: PartitionType,
        bootable: bool,
    ) -> Result<u32> {
        self.expect_state(State::Written, "add_mbr_partition")?;
        if self.kind != TableKind::Mbr {
            return Err(Error::InvalidArgument(
                "add_mbr_partition on a GPT table".into(),
            ));
        }

        let end = u64::from(start_lba) + u64::from(sector_count);
        if sector_count == 0 || end > self.device_sectors {
            return Err(Error::InvalidArgument(format!(
                "partition [{start_lba}, {end}) does not fit in {} sectors",
                self.device_sectors
            )));
        }

        let mut mbr = Mbr::parse(&self.read_sector(0)?)?;

        for used in mbr.partitions.iter().filter(|p| !p.is_empty()) {
            let overlaps =
                u64::from(start_lba) < used.end_lba() && u64::from(used.first_lba) < end;
            if overlaps {
                return Err(Error::InvalidArgument(format!(
                    "partition [{start_lba}, {end}) overlaps entry at {}",
                    used.first_lba
                )));
            }
        }

        let slot = mbr.first_free_slot().ok_or_else(|| {
            Error::device_io(&self.device, "no free partition slots in MBR")
        })?;

        mbr.partitions[slot] = MbrPartition::new(start_lba, sector_count, kind, bootable);
        self.write_sector(0, &mbr.pack())?;
        self.fsync()?;

        Ok(slot as u32 + 1)
    }

    /// Add an entry to the first free GPT slot, recompute the array CRC
    /// and rewrite both header copies. Returns the 1-based index.
    pub fn add_gpt_partition(
        &mut self,
        first_lba: u64,
        last_lba: u64,
        type_guid: [u8; 16],
        name: &str,
    ) -> Result<u32> {
        self.expect_state(State::Written, "add_gpt_partition")?;
        if self.kind != TableKind::Gpt {
            return Err(Error::InvalidArgument(
                "add_gpt_partition on an MBR table".into(),
            ));
        }

        let primary = GptHeader::parse(&self.read_sector(1)?)?;
        if first_lba < primary.first_usable_lba
            || last_lba > primary.last_usable_lba
            || first_lba > last_lba
        {
            return Err(Error::InvalidArgument(format!(
                "partition [{first_lba}, {last_lba}] outside usable range [{}, {}]",
                primary.first_usable_lba, primary.last_usable_lba
            )));
        }

        let mut array = self.read_range(
            primary.entry_lba * SECTOR_SIZE,
            gpt::ENTRY_COUNT * gpt::ENTRY_SIZE,
        )?;

        let slot = (0..gpt::ENTRY_COUNT)
            .find(|i| {
                let at = i * gpt::ENTRY_SIZE;
                array[at..at + 16].iter().all(|&b| b == 0)
            })
            .ok_or_else(|| Error::device_io(&self.device, "no free GPT entry slots"))?;

        let entry = GptEntry {
            type_guid,
            unique_guid: guid::generate(),
            first_lba,
            last_lba,
            attributes: 0,
            name: name.to_string(),
        };
        let at = slot * gpt::ENTRY_SIZE;
        array[at..at + gpt::ENTRY_SIZE].copy_from_slice(&entry.pack());

        let mut header = primary;
        header.entry_array_crc32 = gpt::entry_array_crc32(&array)?;
        self.write_gpt_structures(&header, &array)?;
        self.fsync()?;

        Ok(slot as u32 + 1)
    }

    /// Adopt the table already present on the device (a hybrid ISO brings
    /// its own MBR). Valid boot signature required.
    pub fn attach_existing(&mut self) -> Result<()> {
        self.expect_state(State::Open, "attach_existing")?;

        let sector = self.read_sector(0)?;
        if !crate::codec::mbr::has_boot_signature(&sector) {
            return Err(Error::device_io(
                &self.device,
                "no partition table found to attach to",
            ));
        }

        self.state = State::Written;
        Ok(())
    }

    /// Flush everything and ask the kernel to pick up the new table.
    pub fn commit(&mut self) -> Result<()> {
        self.expect_state(State::Written, "commit")?;

        self.fsync()?;
        if let Some(file) = &self.file {
            // ENOTTY on disk images; the node is a regular file there.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
            if rc != 0 {
                log::debug!("BLKRRPART on {} returned {rc}", self.device.display());
            }
        }

        self.state = State::Committed;
        Ok(())
    }

    fn write_gpt_structures(&mut self, primary: &GptHeader, array: &[u8]) -> Result<()> {
        let backup = primary.backup();

        self.write_range(primary.entry_lba * SECTOR_SIZE, array)?;
        self.write_sector(primary.current_lba, &primary.pack())?;
        self.write_range(backup.entry_lba * SECTOR_SIZE, array)?;
        self.write_sector(backup.current_lba, &backup.pack())?;
        Ok(())
    }

    fn expect_state(&self, wanted: State, operation: &str) -> Result<()> {
        if self.state != wanted {
            return Err(Error::InvalidArgument(format!(
                "{operation} not permitted in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::device_io(&self.device, "device not open"))
    }

    fn write_sector(&mut self, lba: u64, data: &[u8; SECTOR_SIZE as usize]) -> Result<()> {
        self.write_range(lba * SECTOR_SIZE, data)
    }

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let device = self.device.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::device_io(&device, e))?;
        file.write_all(data)
            .map_err(|e| Error::device_io(&device, e))
    }

    fn read_sector(&mut self, lba: u64) -> Result<[u8; SECTOR_SIZE as usize]> {
        let bytes = self.read_range(lba * SECTOR_SIZE, SECTOR_SIZE as usize)?;
        let mut sector = [0u8; SECTOR_SIZE as usize];
        sector.copy_from_slice(&bytes);
        Ok(sector)
    }

    fn read_range(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let device = self.device.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::device_io(&device, e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| Error::device_io(&device, e))?;
        Ok(buf)
    }

    fn fsync(&mut self) -> Result<()> {
        let device = self.device.clone();
        self.file()?
            .sync_all()
            .map_err(|e| Error::device_io(&device, e))
    }
}
