//! Bootable-media composer.
//!
//! Writes a bootable USB stick (or any removable block device) from an
//! ISO 9660 image, optionally adding a persistence partition that
//! survives reboots of the live system. The crate is the engine; the
//! thin CLI in `src/bin` only parses flags and asks for confirmation.
//!
//! # Architecture
//!
//! ```text
//! run (orchestrator)
//!     │ picks a strategy from the image fingerprint and sequences:
//!     ├── iso      - bounded read-only analysis of the source image
//!     ├── device   - block node gateway: wipe, rescan, naming, sync
//!     ├── table    - MBR / GPT construction on the device
//!     ├── fs       - minimum FAT32 / ext4 / NTFS structures
//!     ├── burn     - buffered and zero-copy byte transfer
//!     ├── boot     - Syslinux stub + menu configuration
//!     └── verify   - post-burn read-back comparison
//!
//! codec            - bit-exact serializers shared by the above
//! tools            - mount/format collaborators (subprocess-backed)
//! report           - structured output sink passed into the run
//! ```
//!
//! Strategies: a hybrid image is copied verbatim (`HybridPreserve`), a
//! boot-capable plain image is extracted into a fresh FAT32 layout
//! (`SmartExtract`), a UEFI+legacy image gets the ESP/data/persistence
//! split (`Multipart`), and anything else streams straight through
//! (`RawCopy`).

pub mod boot;
pub mod burn;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod fs;
pub mod iso;
pub mod preflight;
pub mod process;
pub mod report;
pub mod run;
pub mod table;
pub mod tools;
pub mod verify;

pub use error::{Error, Result};
pub use fs::FsKind;
pub use iso::{analyze, BurnStrategy, IsoAnalysis};
pub use report::{Level, LogSink, ReportSink};
pub use run::{Orchestrator, PersistenceRequest, RunOptions};
pub use table::TableKind;
pub use tools::{HostFormatter, HostMounter};
