//! Strategy selection and orchestration.
//!
//! Drives the whole pipeline: validate inputs, analyze the image, pick a
//! burn plan, then sequence the gateway, table engine, filesystem writer,
//! burn engine and bootloader placer in the order that yields bootable
//! media. All destructive strategies share the same preamble (unmount,
//! wipe) and postamble (sync). When the partition-based persistence flow
//! fails, a file-based fallback is attempted before giving up.
//!
//! The target may be a block device or a plain disk-image file; the
//! latter is how the integration tests drive every strategy end-to-end.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use walkdir::WalkDir;

use crate::boot;
use crate::burn::{self, BurnMode};
use crate::codec::SECTOR_SIZE;
use crate::device;
use crate::error::{Error, Result};
use crate::fs::{self, FsKind};
use crate::iso::{BurnStrategy, IsoAnalysis};
use crate::preflight;
use crate::report::ReportSink;
use crate::table::{PartitionTable, TableKind};
use crate::tools::{Formatter, Mounter};
use crate::verify;

/// Working headroom reserved beyond ISO + persistence, in MiB.
pub const OVERHEAD_MIB: u64 = 100;

/// Smallest persistence partition worth creating, in MiB.
pub const MIN_PERSISTENCE_MIB: u64 = 512;

/// Cap for the suggested persistence size in space-error hints, in MiB.
const MAX_SUGGESTED_PERSISTENCE_MIB: u64 = 8192;

/// First partition starts at 1 MiB for alignment.
const FIRST_PARTITION_LBA: u32 = 2048;

/// Extra sectors appended to the data partition beyond the image size.
const DATA_SLACK_SECTORS: u32 = 4096;

/// EFI system partition size in the Multipart layout.
const ESP_SIZE_MIB: u64 = 512;

/// Volume label for the FAT32 data partition.
const DATA_LABEL: &str = "USBFORGE";

/// Filename of the file-based persistence fallback.
const PERSISTENCE_FILE: &str = "casper-rw";

/// A persistence partition request, already clamped to the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceRequest {
    pub size_mib: u64,
    pub fs: FsKind,
}

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub iso_path: PathBuf,
    pub device: PathBuf,
    pub persistence: Option<PersistenceRequest>,
    pub fast_mode: bool,
    pub table: TableKind,
    pub dry_run: bool,
    pub verify: bool,
}

impl RunOptions {
    pub fn new(iso_path: impl Into<PathBuf>, device: impl Into<PathBuf>) -> Self {
        RunOptions {
            iso_path: iso_path.into(),
            device: device.into(),
            persistence: None,
            fast_mode: false,
            table: TableKind::Mbr,
            dry_run: false,
            verify: true,
        }
    }
}

/// The resolved plan for a run.
#[derive(Debug, Clone)]
pub struct Plan {
    pub strategy: BurnStrategy,
    pub persistence: Option<PersistenceRequest>,
    pub iso_mib: u64,
    pub device_mib: u64,
}

/// Sequences a full run against one device.
pub struct Orchestrator<'a> {
    mounter: &'a dyn Mounter,
    formatter: &'a dyn Formatter,
    sink: &'a dyn ReportSink,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        mounter: &'a dyn Mounter,
        formatter: &'a dyn Formatter,
        sink: &'a dyn ReportSink,
    ) -> Self {
        Orchestrator {
            mounter,
            formatter,
            sink,
        }
    }

    /// Execute a run end to end.
    pub fn run(&self, opts: &RunOptions) -> Result<()> {
        let (analysis, plan) = self.prepare(opts)?;

        if opts.dry_run {
            self.report_plan(opts, &analysis, &plan);
            return Ok(());
        }

        if device::validate(&opts.device).is_ok() {
            preflight::check_host_tools(plan.persistence.map(|p| p.fs))?;
        }

        let lock = self.lock_device(&opts.device)?;

        let burn_mode = if opts.fast_mode {
            BurnMode::ZeroCopy
        } else {
            BurnMode::Buffered
        };

        let result = match plan.strategy {
            BurnStrategy::RawCopy => self.run_raw_copy(opts, burn_mode),
            BurnStrategy::HybridPreserve => {
                self.run_hybrid_preserve(opts, &analysis, &plan, burn_mode)
            }
            BurnStrategy::SmartExtract => self.run_smart_extract(opts, &analysis, &plan),
            BurnStrategy::Multipart => self.run_multipart(opts, &analysis, &plan),
        };

        match result {
            Ok(()) => {}
            Err(err) if plan.persistence.is_some() => {
                self.sink
                    .warn(&format!("primary persistence method failed: {err}"));
                self.sink.info("attempting file-based persistence fallback");
                self.run_file_fallback(opts, &plan, burn_mode)?;
            }
            Err(err) => return Err(err),
        }

        device::sync_device(&opts.device, self.sink)?;
        drop(lock);

        self.sink.info("bootable media created successfully");
        Ok(())
    }

    /// Validation, analysis and plan selection. Nothing destructive
    /// happens here; every space failure must surface before the first
    /// byte is written.
    pub fn prepare(&self, opts: &RunOptions) -> Result<(IsoAnalysis, Plan)> {
        validate_target(&opts.device, self.sink)?;

        let iso_size = crate::iso::validate(&opts.iso_path)?;
        let analysis = crate::iso::analyze(&opts.iso_path)?;

        self.sink.info(&format!("image type: {}", analysis.boot_type()));
        self.sink.info(&format!(
            "hybrid: {}, UEFI: {}, legacy boot: {}, embedded partitions: {}",
            yes_no(analysis.is_hybrid()),
            yes_no(analysis.has_uefi),
            yes_no(analysis.has_legacy_boot()),
            analysis.embedded_partitions.len()
        ));

        let device_size = device::node_size_bytes(&opts.device)?;
        let device_mib = device_size / (1024 * 1024);
        let iso_mib = iso_size / (1024 * 1024);

        self.sink
            .info(&format!("device size: {device_mib} MiB, image size: {iso_mib} MiB"));

        if iso_size > device_size {
            return Err(Error::InvalidArgument(format!(
                "{} is too small for the image ({iso_mib} MiB > {device_mib} MiB)",
                opts.device.display()
            )));
        }

        let persistence = match opts.persistence {
            None => None,
            Some(request) => {
                let clamped = self.clamp_persistence(request)?;
                check_space(&opts.device, device_mib, iso_mib, clamped.size_mib, clamped.fs)?;
                Some(clamped)
            }
        };

        let mut strategy = analysis.recommended_strategy();
        if persistence.is_some() && strategy == BurnStrategy::RawCopy {
            // A raw copy leaves no room to carve a partition out of; fall
            // through to the extracted layout instead.
            strategy = BurnStrategy::SmartExtract;
        }

        self.sink
            .info(&format!("selected strategy: {strategy:?}"));

        Ok((
            analysis,
            Plan {
                strategy,
                persistence,
                iso_mib,
                device_mib,
            },
        ))
    }

    fn clamp_persistence(&self, request: PersistenceRequest) -> Result<PersistenceRequest> {
        if request.size_mib == 0 {
            return Err(Error::InvalidArgument(
                "persistence size must be a positive number of MiB".into(),
            ));
        }
        if request.size_mib < MIN_PERSISTENCE_MIB {
            self.sink.warn(&format!(
                "persistence size raised to the {MIN_PERSISTENCE_MIB} MiB minimum"
            ));
            return Ok(PersistenceRequest {
                size_mib: MIN_PERSISTENCE_MIB,
                ..request
            });
        }
        Ok(request)
    }

    fn report_plan(&self, opts: &RunOptions, analysis: &IsoAnalysis, plan: &Plan) {
        let sink = self.sink;
        sink.info("dry run: no changes will be made");
        sink.info(&format!("  image: {}", opts.iso_path.display()));
        sink.info(&format!("  device: {}", opts.device.display()));
        sink.info(&format!("  strategy: {:?}", plan.strategy));
        sink.info(&format!("  partition table: {:?}", opts.table));
        sink.info(&format!(
            "  burn mode: {}",
            if opts.fast_mode { "zero-copy" } else { "buffered" }
        ));
        sink.info(&format!(
            "  partitions required: {}",
            analysis.required_partitions(plan.persistence.is_some())
        ));

        match plan.persistence {
            Some(p) => sink.info(&format!(
                "  persistence: {} MiB ({})",
                p.size_mib,
                p.fs.name()
            )),
            None => sink.info("  persistence: disabled"),
        }

        let persist_mib = plan.persistence.map_or(0, |p| p.size_mib);
        let used = plan.iso_mib + persist_mib + OVERHEAD_MIB;
        sink.info(&format!(
            "  space: {} MiB image + {} MiB persistence + {} MiB overhead = {} of {} MiB",
            plan.iso_mib, persist_mib, OVERHEAD_MIB, used, plan.device_mib
        ));
    }

    fn lock_device(&self, device: &Path) -> Result<File> {
        let file = device::open_sync_rw(device)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::InvalidArgument(format!(
                "{} is locked by another composer run",
                device.display()
            ))
        })?;
        Ok(file)
    }

    fn burn_and_verify(&self, opts: &RunOptions, mode: BurnMode) -> Result<()> {
        burn::burn(&opts.iso_path, &opts.device, mode, self.sink)?;
        if opts.verify {
            verify::verify_burn(&opts.iso_path, &opts.device, self.sink)?;
        }
        Ok(())
    }

    /// RawCopy: stream the image to the whole device, then finalize boot
    /// records.
    fn run_raw_copy(&self, opts: &RunOptions, mode: BurnMode) -> Result<()> {
        device::unmount_all(&opts.device, self.mounter, self.sink)?;
        device::wipe(&opts.device, self.sink)?;

        self.burn_and_verify(opts, mode)?;

        device::reread_partitions(&opts.device, &[1], self.sink)?;
        self.place_bootloader(opts)?;
        Ok(())
    }

    /// HybridPreserve: the image carries its own partition table, so copy
    /// it verbatim and append persistence behind it if asked.
    fn run_hybrid_preserve(
        &self,
        opts: &RunOptions,
        analysis: &IsoAnalysis,
        plan: &Plan,
        mode: BurnMode,
    ) -> Result<()> {
        device::unmount_all(&opts.device, self.mounter, self.sink)?;
        device::wipe(&opts.device, self.sink)?;

        self.burn_and_verify(opts, mode)?;

        let embedded: Vec<u32> = (1..=analysis.embedded_partitions.len() as u32).collect();
        device::reread_partitions(&opts.device, &embedded, self.sink)?;

        if let Some(persist) = plan.persistence {
            self.sink
                .info("appending persistence partition behind the image");

            let start = (analysis.iso_data_size / SECTOR_SIZE) as u32 + FIRST_PARTITION_LBA;
            let count = mib_to_sectors(persist.size_mib);

            let mut table = PartitionTable::new(&opts.device, TableKind::Mbr);
            table.initialize()?;
            table.attach_existing()?;
            let index = table.add_mbr_partition(start, count, persist.fs.mbr_type(), false)?;
            table.commit()?;

            device::reread_partitions(&opts.device, &[index], self.sink)?;

            let partition = device::partition_path(&opts.device, index);
            self.formatter
                .format(&partition, persist.fs, persist.fs.persistence_label())?;
        }

        Ok(())
    }

    /// SmartExtract: fresh table, FAT32 data partition populated from the
    /// image's logical contents, boot support written by hand.
    fn run_smart_extract(
        &self,
        opts: &RunOptions,
        _analysis: &IsoAnalysis,
        plan: &Plan,
    ) -> Result<()> {
        device::unmount_all(&opts.device, self.mounter, self.sink)?;
        device::wipe(&opts.device, self.sink)?;

        let iso_sectors = (plan.iso_mib * 1024 * 1024 / SECTOR_SIZE) as u32 + DATA_SLACK_SECTORS;
        let layout = [
            Some((iso_sectors, SlotKind::Data { bootable: true })),
            plan.persistence
                .map(|p| (mib_to_sectors(p.size_mib), SlotKind::Persistence(p.fs))),
            None,
        ];
        let created = self.build_table(opts, &layout)?;

        self.populate_data_partition(opts, &created, None)?;
        self.format_persistence(opts, plan, &created)?;
        Ok(())
    }

    /// Multipart: ESP + data + persistence.
    fn run_multipart(
        &self,
        opts: &RunOptions,
        analysis: &IsoAnalysis,
        plan: &Plan,
    ) -> Result<()> {
        device::unmount_all(&opts.device, self.mounter, self.sink)?;
        device::wipe(&opts.device, self.sink)?;

        let iso_sectors = (plan.iso_mib * 1024 * 1024 / SECTOR_SIZE) as u32 + DATA_SLACK_SECTORS;
        let layout = [
            analysis
                .has_uefi
                .then_some((mib_to_sectors(ESP_SIZE_MIB), SlotKind::Esp)),
            Some((
                iso_sectors,
                SlotKind::Data {
                    bootable: !analysis.has_uefi,
                },
            )),
            plan.persistence
                .map(|p| (mib_to_sectors(p.size_mib), SlotKind::Persistence(p.fs))),
        ];
        let created = self.build_table(opts, &layout)?;

        if let Some(esp) = created.index_of(SlotTag::Esp) {
            let esp_path = device::partition_path(&opts.device, esp);
            fs::create_filesystem(&esp_path, FsKind::Fat32, "EFI", self.sink)?;
        }

        self.populate_data_partition(opts, &created, created.index_of(SlotTag::Esp))?;
        self.format_persistence(opts, plan, &created)?;
        Ok(())
    }

    /// Lay the requested slots onto a fresh table and commit.
    fn build_table(
        &self,
        opts: &RunOptions,
        layout: &[Option<(u32, SlotKind)>; 3],
    ) -> Result<CreatedPartitions> {
        let mut table = PartitionTable::new(&opts.device, opts.table);
        table.initialize()?;
        match opts.table {
            TableKind::Mbr => table.create_mbr()?,
            TableKind::Gpt => table.create_gpt()?,
        }

        let mut created = CreatedPartitions::default();
        let mut cursor = FIRST_PARTITION_LBA;

        for (sectors, kind) in layout.iter().flatten() {
            let index = match opts.table {
                TableKind::Mbr => {
                    table.add_mbr_partition(cursor, *sectors, kind.mbr_type(), kind.bootable())?
                }
                TableKind::Gpt => table.add_gpt_partition(
                    u64::from(cursor),
                    u64::from(cursor) + u64::from(*sectors) - 1,
                    kind.gpt_type_guid(),
                    kind.gpt_name(),
                )?,
            };
            created.slots.push((kind.tag(), index));
            cursor += sectors;
        }

        table.commit()?;
        device::reread_partitions(&opts.device, &created.indices(), self.sink)?;
        Ok(created)
    }

    /// Format the data partition FAT32, fill it from the image, then lay
    /// the boot configuration down while it is still mounted.
    fn populate_data_partition(
        &self,
        opts: &RunOptions,
        created: &CreatedPartitions,
        esp_index: Option<u32>,
    ) -> Result<()> {
        let index = created
            .index_of(SlotTag::Data)
            .ok_or_else(|| Error::Filesystem("no data partition in layout".into()))?;
        let partition = device::partition_path(&opts.device, index);

        fs::create_filesystem(&partition, FsKind::Fat32, DATA_LABEL, self.sink)?;

        let mount = ScratchDir::new("data")?;
        self.mounter
            .mount(&partition, mount.path(), Some("vfat"), false)?;

        let populated = (|| -> Result<()> {
            self.sink.info("extracting image contents");
            self.extract_iso_contents(&opts.iso_path, mount.path())?;

            if let Some(esp) = esp_index {
                self.populate_esp(opts, esp, mount.path())?;
            }

            boot::place(&opts.device, &opts.iso_path, mount.path(), self.sink)?;
            Ok(())
        })();

        let _ = self.mounter.unmount(mount.path(), false);
        populated
    }

    /// Copy the EFI tree from the extracted contents into the ESP.
    fn populate_esp(&self, opts: &RunOptions, esp_index: u32, data_root: &Path) -> Result<()> {
        let efi_tree = data_root.join("EFI");
        if !efi_tree.exists() {
            self.sink
                .warn("image advertises UEFI but carries no EFI directory; leaving ESP empty");
            return Ok(());
        }

        let esp = device::partition_path(&opts.device, esp_index);
        let mount = ScratchDir::new("esp")?;
        self.mounter.mount(&esp, mount.path(), Some("vfat"), false)?;
        let copied = copy_tree(&efi_tree, &mount.path().join("EFI"));
        let _ = self.mounter.unmount(mount.path(), false);
        copied
    }

    fn format_persistence(
        &self,
        opts: &RunOptions,
        plan: &Plan,
        created: &CreatedPartitions,
    ) -> Result<()> {
        let Some(persist) = plan.persistence else {
            return Ok(());
        };
        let index = created
            .index_of(SlotTag::Persistence)
            .ok_or_else(|| Error::Filesystem("no persistence partition in layout".into()))?;

        let partition = device::partition_path(&opts.device, index);
        self.formatter
            .format(&partition, persist.fs, persist.fs.persistence_label())
    }

    /// Best-effort boot finalization after a raw copy: the stub always
    /// lands in the MBR; the menu configuration only when the first
    /// partition can be mounted.
    fn place_bootloader(&self, opts: &RunOptions) -> Result<()> {
        let first = device::partition_path(&opts.device, 1);
        let mount = ScratchDir::new("boot")?;

        if self
            .mounter
            .mount(&first, mount.path(), Some("vfat"), false)
            .is_ok()
        {
            let placed = boot::place(&opts.device, &opts.iso_path, mount.path(), self.sink);
            let _ = self.mounter.unmount(mount.path(), false);
            placed?;
        } else {
            self.sink
                .warn("first partition not mountable; writing boot stub only");
            boot::write_mbr_stub(&opts.device)?;
        }
        Ok(())
    }

    /// Secondary persistence path: raw-copy the image, then park a
    /// formatted `casper-rw` file inside its first partition.
    fn run_file_fallback(&self, opts: &RunOptions, plan: &Plan, mode: BurnMode) -> Result<()> {
        let Some(persist) = plan.persistence else {
            return Err(Error::Filesystem(
                "fallback requested without a persistence request".into(),
            ));
        };

        device::unmount_all(&opts.device, self.mounter, self.sink)?;
        burn::burn(&opts.iso_path, &opts.device, mode, self.sink)?;
        device::sync_device(&opts.device, self.sink)?;
        device::reread_partitions(&opts.device, &[1], self.sink)?;

        let first = device::partition_path(&opts.device, 1);
        let mount = ScratchDir::new("persist")?;
        self.mounter.mount(&first, mount.path(), None, false)?;

        let result = (|| -> Result<()> {
            let file_path = mount.path().join(PERSISTENCE_FILE);
            self.sink.info(&format!(
                "creating {} MiB persistence file {}",
                persist.size_mib, PERSISTENCE_FILE
            ));

            let file = File::create(&file_path).map_err(|e| {
                Error::Filesystem(format!("cannot create {}: {e}", file_path.display()))
            })?;
            file.set_len(persist.size_mib * 1024 * 1024).map_err(|e| {
                Error::Filesystem(format!("cannot allocate {}: {e}", file_path.display()))
            })?;
            drop(file);

            self.formatter
                .format(&file_path, FsKind::Ext4, PERSISTENCE_FILE)
        })();

        let _ = self.mounter.unmount(mount.path(), false);
        result
    }

    /// Loop-mount the image read-only and copy its logical tree into
    /// `dest`.
    fn extract_iso_contents(&self, image: &Path, dest: &Path) -> Result<()> {
        let loop_dev = self.mounter.attach_loop(image)?;
        let mount = ScratchDir::new("iso")?;

        let result = (|| -> Result<()> {
            self.mounter
                .mount(&loop_dev, mount.path(), Some("iso9660"), true)?;
            let copied = copy_tree(mount.path(), dest);
            let _ = self.mounter.unmount(mount.path(), false);
            copied
        })();

        let _ = self.mounter.detach_loop(&loop_dev);
        result
    }
}

/// Slot roles used while building a layout.
#[derive(Debug, Clone, Copy)]
enum SlotKind {
    Esp,
    Data { bootable: bool },
    Persistence(FsKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotTag {
    Esp,
    Data,
    Persistence,
}

impl SlotKind {
    fn tag(&self) -> SlotTag {
        match self {
            SlotKind::Esp => SlotTag::Esp,
            SlotKind::Data { .. } => SlotTag::Data,
            SlotKind::Persistence(_) => SlotTag::Persistence,
        }
    }

    fn bootable(&self) -> bool {
        match self {
            SlotKind::Esp => true,
            SlotKind::Data { bootable } => *bootable,
            SlotKind::Persistence(_) => false,
        }
    }

    fn mbr_type(&self) -> crate::codec::mbr::PartitionType {
        use crate::codec::mbr::PartitionType;
        match self {
            SlotKind::Esp => PartitionType::EfiSystem,
            SlotKind::Data { .. } => PartitionType::Fat32Lba,
            SlotKind::Persistence(fs) => fs.mbr_type(),
        }
    }

    fn gpt_type_guid(&self) -> [u8; 16] {
        use crate::codec::gpt::type_guid;
        match self {
            SlotKind::Esp => type_guid::EFI_SYSTEM,
            SlotKind::Data { .. } => type_guid::BASIC_DATA,
            SlotKind::Persistence(fs) => fs.gpt_type_guid(),
        }
    }

    fn gpt_name(&self) -> &'static str {
        match self {
            SlotKind::Esp => "EFI system partition",
            SlotKind::Data { .. } => "live data",
            SlotKind::Persistence(_) => "persistence",
        }
    }
}

/// Partition indices created by `build_table`, by role.
#[derive(Debug, Default)]
struct CreatedPartitions {
    slots: Vec<(SlotTag, u32)>,
}

impl CreatedPartitions {
    fn index_of(&self, tag: SlotTag) -> Option<u32> {
        self.slots.iter().find(|(t, _)| *t == tag).map(|(_, i)| *i)
    }

    fn indices(&self) -> Vec<u32> {
        self.slots.iter().map(|(_, i)| *i).collect()
    }
}

/// Reject partitions handed in as the target and anything that is not a
/// block node (plain files get a warning and pass, for image targets).
fn validate_target(device: &Path, sink: &dyn ReportSink) -> Result<()> {
    if let Some(base) = whole_disk_of(device) {
        return Err(Error::InvalidArgument(format!(
            "{} is a partition, not a whole disk; try {} instead",
            device.display(),
            base.display()
        )));
    }

    match device::validate(device) {
        Ok(()) => Ok(()),
        Err(err) => {
            let meta = std::fs::metadata(device).map_err(|_| Error::InvalidDevice {
                path: device.to_path_buf(),
            })?;
            if meta.is_file() {
                sink.warn(&format!(
                    "{} is a regular file; composing a disk image",
                    device.display()
                ));
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}

/// If `device` names a partition, return the whole-disk path it belongs
/// to. Understands both classical (`sdb1`) and NVMe/MMC (`nvme0n1p1`)
/// naming.
fn whole_disk_of(device: &Path) -> Option<PathBuf> {
    let name = device.file_name()?.to_str()?;
    let stripped = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.len() == name.len() {
        return None; // no trailing digits at all
    }

    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        // Trailing digits are a partition only behind a 'p' that follows
        // the namespace digits: nvme0n1p2, mmcblk0p1.
        let base = stripped.strip_suffix('p')?;
        if base.ends_with(|c: char| c.is_ascii_digit()) {
            return Some(device.with_file_name(base));
        }
        return None;
    }

    if stripped.is_empty() {
        return None;
    }
    Some(device.with_file_name(stripped))
}

/// The space invariant: image + persistence + overhead must fit, checked
/// before anything destructive. The error spells out the shortfall and
/// the largest persistence that would fit.
fn check_space(
    device: &Path,
    device_mib: u64,
    iso_mib: u64,
    persist_mib: u64,
    fs: FsKind,
) -> Result<()> {
    let required = iso_mib + persist_mib + OVERHEAD_MIB;
    if required <= device_mib {
        return Ok(());
    }

    let available = device_mib.saturating_sub(iso_mib + OVERHEAD_MIB);
    let mut message = String::from("insufficient storage for requested persistence\n");
    message.push_str(&format!("  device: {device_mib} MiB ({})\n", device.display()));
    message.push_str(&format!("  image: {iso_mib} MiB\n"));
    message.push_str(&format!("  requested persistence: {persist_mib} MiB\n"));
    message.push_str(&format!("  required: {required} MiB\n"));
    message.push_str(&format!("  shortage: {} MiB", required - device_mib));

    if available >= MIN_PERSISTENCE_MIB {
        let fit = available.min(MAX_SUGGESTED_PERSISTENCE_MIB);
        message.push_str(&format!(
            "\n  maximum persistence that fits: {fit} MiB ({})",
            fs.name()
        ));
    } else {
        message.push_str(&format!(
            "\n  device too small for persistence (minimum {MIN_PERSISTENCE_MIB} MiB)"
        ));
    }

    Err(Error::Filesystem(message))
}

fn mib_to_sectors(mib: u64) -> u32 {
    (mib * 1024 * 1024 / SECTOR_SIZE) as u32
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "yes"
    } else {
        "no"
    }
}

/// Process-unique scratch directory, removed on drop even when a step
/// fails mid-way.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn new(tag: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "usbforge-{}-{tag}-{:x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        std::fs::create_dir_all(&path).map_err(|e| {
            Error::Filesystem(format!("cannot create mount point {}: {e}", path.display()))
        })?;
        Ok(ScratchDir { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Recursive copy preserving directories, files and symlinks.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry =
            entry.map_err(|e| Error::Filesystem(format!("walking {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Filesystem(format!("path prefix: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| {
                Error::Filesystem(format!("cannot create {}: {e}", target.display()))
            })?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())
                .map_err(|e| Error::Filesystem(format!("read_link: {e}")))?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Filesystem(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            let _ = std::fs::remove_file(&target);
            std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                Error::Filesystem(format!("cannot link {}: {e}", target.display()))
            })?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Filesystem(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| {
                Error::Filesystem(format!("cannot copy to {}: {e}", target.display()))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::mbr::{Mbr, MbrPartition, PartitionType};
    use crate::report::testing::RecordingSink;
    use crate::tools::testing::{RecordingFormatter, RecordingMounter};
    use std::io::{Read, Write as _};
    use tempfile::NamedTempFile;

    const MIB: u64 = 1024 * 1024;

    /// Sparse device image of the given size, with a marker byte at the
    /// front so "untouched" is distinguishable from "wiped".
    fn device_image(size_mib: u64) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0xA5u8; 512]).unwrap();
        file.flush().unwrap();
        file.as_file().set_len(size_mib * MIB).unwrap();
        file
    }

    /// Pre-create the `<device>N` nodes the composer will format, since a
    /// disk image has no kernel-provided children.
    fn fake_children(device: &Path, sizes_mib: &[u64]) -> Vec<PathBuf> {
        sizes_mib
            .iter()
            .enumerate()
            .map(|(i, size)| {
                let path = device::partition_path(device, i as u32 + 1);
                let file = File::create(&path).unwrap();
                file.set_len(size * MIB).unwrap();
                path
            })
            .collect()
    }

    fn plain_iso(size_mib: u64) -> NamedTempFile {
        let mut data = vec![0u8; (size_mib * MIB) as usize];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 253) as u8;
        }
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn eltorito_iso(size_mib: u64) -> NamedTempFile {
        let mut data = vec![0u8; (size_mib * MIB) as usize];
        data[32768] = 0x01;
        data[32769..32774].copy_from_slice(b"CD001");
        data[34816..34825].copy_from_slice(b"EL TORITO");
        data[1000..1008].copy_from_slice(b"SYSLINUX");
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn multiboot_iso(size_mib: u64) -> NamedTempFile {
        let mut data = vec![0u8; (size_mib * MIB) as usize];
        data[32768] = 0x01;
        data[32769..32774].copy_from_slice(b"CD001");
        data[34816..34825].copy_from_slice(b"EL TORITO");
        let marker = b"EFI/BOOT/BOOTX64.EFI";
        data[40000..40000 + marker.len()].copy_from_slice(marker);
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn hybrid_iso(size_mib: u64) -> NamedTempFile {
        let mut data = vec![0u8; (size_mib * MIB) as usize];
        let mut mbr = Mbr::new(0x5EED_1234);
        mbr.partitions[0] = MbrPartition::new(64, 8000, PartitionType::Linux, true);
        data[..512].copy_from_slice(&mbr.pack());
        data[32768] = 0x01;
        data[32769..32774].copy_from_slice(b"CD001");
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn read_head(path: &Path, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let mut file = File::open(path).unwrap();
        file.read_exact(&mut buf).unwrap();
        buf
    }

    struct Rig {
        mounter: RecordingMounter,
        formatter: RecordingFormatter,
        sink: RecordingSink,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                mounter: RecordingMounter::new(),
                formatter: RecordingFormatter::new(),
                sink: RecordingSink::new(),
            }
        }

        fn orchestrator(&self) -> Orchestrator<'_> {
            Orchestrator::new(&self.mounter, &self.formatter, &self.sink)
        }
    }

    #[test]
    fn rejects_partition_paths_with_hint() {
        let rig = Rig::new();
        let iso = plain_iso(1);
        let opts = RunOptions::new(iso.path(), "/dev/sdb1");

        let err = rig.orchestrator().run(&opts).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/dev/sdb1"));
        assert!(message.contains("/dev/sdb"));
    }

    #[test]
    fn whole_disk_naming_rules() {
        assert_eq!(
            whole_disk_of(Path::new("/dev/sdb2")),
            Some(PathBuf::from("/dev/sdb"))
        );
        assert_eq!(
            whole_disk_of(Path::new("/dev/nvme0n1p1")),
            Some(PathBuf::from("/dev/nvme0n1"))
        );
        assert_eq!(
            whole_disk_of(Path::new("/dev/mmcblk0p2")),
            Some(PathBuf::from("/dev/mmcblk0"))
        );
        assert_eq!(whole_disk_of(Path::new("/dev/sdb")), None);
        assert_eq!(whole_disk_of(Path::new("/dev/nvme0n1")), None);
        assert_eq!(whole_disk_of(Path::new("/dev/mmcblk0")), None);
    }

    #[test]
    fn space_check_fails_before_any_write() {
        let rig = Rig::new();
        let iso = plain_iso(0); // placeholder, resized below
        iso.as_file().set_len(3000 * MIB).unwrap();
        let device = device_image(3500);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.persistence = Some(PersistenceRequest {
            size_mib: 1024,
            fs: FsKind::Ext4,
        });

        let err = rig.orchestrator().run(&opts).unwrap_err();
        assert!(matches!(err, Error::Filesystem(_)));
        let message = err.to_string();
        assert!(message.contains("4124"), "required total missing: {message}");
        assert!(message.contains("624"), "shortage missing: {message}");
        assert!(message.contains("3000"));
        assert!(message.contains("1024"));

        // Nothing touched the device: the head marker survives and no
        // collaborator ran.
        assert_eq!(read_head(device.path(), 512), vec![0xA5u8; 512]);
        assert!(rig.mounter.calls.borrow().is_empty());
        assert!(rig.formatter.calls.borrow().is_empty());
    }

    #[test]
    fn space_error_suggests_maximum_fit() {
        let err = check_space(Path::new("/dev/sdz"), 8000, 3000, 6000, FsKind::Ext4).unwrap_err();
        let message = err.to_string();
        // 8000 - 3000 - 100 = 4900 MiB would fit.
        assert!(message.contains("4900"));
    }

    #[test]
    fn dry_run_reports_and_leaves_device_alone() {
        let rig = Rig::new();
        let iso = eltorito_iso(2);
        let device = device_image(700);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.dry_run = true;
        opts.persistence = Some(PersistenceRequest {
            size_mib: 512,
            fs: FsKind::Ext4,
        });

        rig.orchestrator().run(&opts).unwrap();

        assert!(rig.sink.contains("dry run"));
        assert!(rig.sink.contains("SmartExtract"));
        assert_eq!(read_head(device.path(), 512), vec![0xA5u8; 512]);
        assert!(rig.mounter.calls.borrow().is_empty());
        assert!(rig.formatter.calls.borrow().is_empty());
    }

    #[test]
    fn small_persistence_is_clamped() {
        let rig = Rig::new();
        let iso = eltorito_iso(2);
        let device = device_image(700);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.dry_run = true;
        opts.persistence = Some(PersistenceRequest {
            size_mib: 100,
            fs: FsKind::Ext4,
        });

        rig.orchestrator().run(&opts).unwrap();
        assert!(rig.sink.contains("512 MiB minimum"));
        assert!(rig.sink.contains("persistence: 512 MiB"));
    }

    #[test]
    fn raw_copy_writes_image_and_stub() {
        let rig = Rig::new();
        let iso = plain_iso(2);
        let device = device_image(64);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = true;

        rig.orchestrator().run(&opts).unwrap();

        let written = read_head(device.path(), (2 * MIB) as usize);
        let expected = std::fs::read(iso.path()).unwrap();
        // The boot stub overwrites the head; past it the copy is exact.
        assert_eq!(&written[512..], &expected[512..]);
        assert_eq!(&written[..55], &boot::SYSLINUX_STUB[..]);

        // Menu config went through the (recorded) mount of partition 1.
        let calls = rig.mounter.calls.borrow();
        assert!(calls.iter().any(|c| c.starts_with("mount") && c.contains("1 ")));
    }

    #[test]
    fn raw_copy_verify_runs_before_stub() {
        // verify_burn compares the device against the image; since the
        // stub overwrites byte 0, verification must have happened before
        // bootloader placement or it would always fail.
        let rig = Rig::new();
        let iso = plain_iso(1);
        let device = device_image(64);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = true;
        rig.orchestrator().run(&opts).unwrap();
        assert!(rig.sink.contains("verification passed"));
    }

    #[test]
    fn hybrid_preserve_appends_persistence() {
        let rig = Rig::new();
        let iso = hybrid_iso(4);
        let device = device_image(700);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = false;
        opts.persistence = Some(PersistenceRequest {
            size_mib: 512,
            fs: FsKind::Ext4,
        });

        rig.orchestrator().run(&opts).unwrap();

        let mbr = Mbr::parse(&read_head(device.path(), 512)).unwrap();
        // Entry 0 is the image's own partition, untouched.
        assert_eq!(mbr.partitions[0].first_lba, 64);
        assert_eq!(mbr.partitions[0].sector_count, 8000);
        assert_eq!(mbr.partitions[0].kind, 0x83);
        // Entry 1 is the appended persistence: starts one alignment unit
        // past the image, sized exactly as requested.
        let expected_start = (4 * MIB / 512) as u32 + 2048;
        assert_eq!(mbr.partitions[1].first_lba, expected_start);
        assert_eq!(mbr.partitions[1].sector_count, 512 * 2048);
        assert_eq!(mbr.partitions[1].kind, 0x83);
        assert!(!mbr.partitions[1].is_bootable());

        // The second partition node went to the external formatter with
        // the casper-rw label.
        let calls = rig.formatter.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("ext4"));
        assert!(calls[0].contains("casper-rw"));
        assert!(calls[0].contains(&format!("{}2", device.path().display())));
    }

    #[test]
    fn smart_extract_builds_bootable_fat32() {
        let rig = Rig::new();
        let iso = eltorito_iso(2);
        let device = device_image(700);
        let children = fake_children(device.path(), &[64]);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = false;

        rig.orchestrator().run(&opts).unwrap();

        let mbr = Mbr::parse(&read_head(device.path(), 512)).unwrap();
        assert_eq!(mbr.partitions[0].first_lba, 2048);
        assert_eq!(mbr.partitions[0].kind, 0x0C);
        assert!(mbr.partitions[0].is_bootable());
        assert_eq!(mbr.partitions[0].sector_count, 2 * 2048 + 4096);

        // The data partition got a real FAT32.
        let boot_sector = read_head(&children[0], 512);
        let parsed = crate::codec::fat32::Fat32BootSector::parse(&boot_sector).unwrap();
        assert_eq!(parsed.label, DATA_LABEL);

        // Boot stub on the device, extraction went through the loop
        // mounter.
        assert_eq!(&read_head(device.path(), 55), &boot::SYSLINUX_STUB[..]);
        let calls = rig.mounter.calls.borrow();
        assert!(calls.iter().any(|c| c.starts_with("losetup")));

        std::fs::remove_file(&children[0]).unwrap();
    }

    #[test]
    fn smart_extract_with_gpt_table() {
        let rig = Rig::new();
        let iso = eltorito_iso(2);
        let device = device_image(700);
        let children = fake_children(device.path(), &[64]);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = false;
        opts.table = TableKind::Gpt;

        rig.orchestrator().run(&opts).unwrap();

        let head = read_head(device.path(), 2048);
        let mbr = Mbr::parse(&head[..512]).unwrap();
        assert_eq!(mbr.partitions[0].kind, 0xEE);

        let header = crate::codec::gpt::GptHeader::parse(&head[512..1024]).unwrap();
        let entry = crate::codec::gpt::GptEntry::parse(&head[1024..1152]).unwrap();
        assert_eq!(entry.first_lba, 2048);
        assert_eq!(entry.type_guid, crate::codec::gpt::type_guid::BASIC_DATA);
        assert_eq!(header.first_usable_lba, 34);

        std::fs::remove_file(&children[0]).unwrap();
    }

    #[test]
    fn multipart_lays_esp_data_persistence() {
        let rig = Rig::new();
        let iso = multiboot_iso(2);
        let device = device_image(2048);
        let children = fake_children(device.path(), &[64, 64, 64]);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = false;
        opts.persistence = Some(PersistenceRequest {
            size_mib: 1024,
            fs: FsKind::Ext4,
        });

        rig.orchestrator().run(&opts).unwrap();

        let mbr = Mbr::parse(&read_head(device.path(), 512)).unwrap();

        // ESP: 512 MiB, type 0xEF, bootable.
        assert_eq!(mbr.partitions[0].kind, 0xEF);
        assert_eq!(mbr.partitions[0].first_lba, 2048);
        assert_eq!(mbr.partitions[0].sector_count, 512 * 2048);
        assert!(mbr.partitions[0].is_bootable());

        // Data: FAT32 LBA, not bootable on a UEFI image.
        assert_eq!(mbr.partitions[1].kind, 0x0C);
        assert!(!mbr.partitions[1].is_bootable());

        // Persistence: Linux type, exactly 1024 MiB.
        assert_eq!(mbr.partitions[2].kind, 0x83);
        assert_eq!(mbr.partitions[2].sector_count, 1024 * 2048);

        // ESP and data both carry FAT32 headers.
        let esp = crate::codec::fat32::Fat32BootSector::parse(&read_head(&children[0], 512));
        assert_eq!(esp.unwrap().label, "EFI");
        let data = crate::codec::fat32::Fat32BootSector::parse(&read_head(&children[1], 512));
        assert_eq!(data.unwrap().label, DATA_LABEL);

        // Persistence went to the formatter.
        let calls = rig.formatter.calls.borrow();
        assert!(calls.iter().any(|c| c.contains("ext4") && c.contains("casper-rw")));

        for child in &children {
            std::fs::remove_file(child).unwrap();
        }
    }

    #[test]
    fn failed_persistence_falls_back_to_file() {
        let rig = Rig {
            formatter: RecordingFormatter::failing_times(1),
            ..Rig::new()
        };
        let iso = hybrid_iso(4);
        let device = device_image(700);

        let mut opts = RunOptions::new(iso.path(), device.path());
        opts.verify = false;
        opts.persistence = Some(PersistenceRequest {
            size_mib: 512,
            fs: FsKind::Ext4,
        });

        rig.orchestrator().run(&opts).unwrap();

        assert!(rig.sink.contains("file-based persistence fallback"));
        let calls = rig.formatter.calls.borrow();
        // First call failed (partition), second formatted the casper-rw
        // file inside the mounted first partition.
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains(PERSISTENCE_FILE));
    }

    #[test]
    fn copy_tree_replicates_structure() {
        let src = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("casper")).unwrap();
        std::fs::write(src.path().join("casper/vmlinuz"), b"kernel").unwrap();
        std::fs::write(src.path().join("README"), b"hi").unwrap();
        std::os::unix::fs::symlink("README", src.path().join("readme.link")).unwrap();

        let dst = tempfile::TempDir::new().unwrap();
        copy_tree(src.path(), dst.path()).unwrap();

        assert_eq!(
            std::fs::read(dst.path().join("casper/vmlinuz")).unwrap(),
            b"kernel"
        );
        assert_eq!(std::fs::read(dst.path().join("README")).unwrap(), b"hi");
        assert!(dst.path().join("readme.link").is_symlink());
    }

    #[test]
    fn scratch_dir_cleans_up() {
        let path = {
            let dir = ScratchDir::new("test").unwrap();
            assert!(dir.path().exists());
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
