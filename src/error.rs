//! Error taxonomy for the composer.
//!
//! Every fallible operation in this crate returns [`Result`]. The enum is
//! closed on purpose: the orchestrator (and the CLI above it) matches on it
//! exactly once to decide the exit path, so new failure modes must be added
//! here rather than smuggled through strings.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All the ways a run can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// The process lacks privilege to open the block device.
    #[error("permission denied opening {}: root privileges are required", device.display())]
    Permission { device: PathBuf },

    /// Bad input from the caller: missing ISO, partition given instead of a
    /// whole disk, persistence larger than the device, and so on.
    #[error("{0}")]
    InvalidArgument(String),

    /// The target path exists but is not a block special node.
    #[error("{} is not a block device", path.display())]
    InvalidDevice { path: PathBuf },

    /// A read/write/ioctl/seek against the device or one of its partitions
    /// failed.
    #[error("device error on {}: {cause}", device.display())]
    DeviceIo { device: PathBuf, cause: String },

    /// A read against the source ISO failed.
    #[error("cannot read {}: {cause}", path.display())]
    FileIo { path: PathBuf, cause: String },

    /// A formatter invocation failed, a filesystem header could not be
    /// written, or there is not enough room for the requested layout.
    #[error("{0}")]
    Filesystem(String),

    /// The ISO is unreadable or too small to be a valid image.
    #[error("cannot analyze {}: {cause}", path.display())]
    Analysis { path: PathBuf, cause: String },

    /// The operator declined the confirmation prompt.
    #[error("operation cancelled")]
    Interrupted,
}

impl Error {
    /// Wrap an I/O error against the device or one of its partitions.
    pub fn device_io(device: impl Into<PathBuf>, err: impl ToString) -> Self {
        Error::DeviceIo {
            device: device.into(),
            cause: err.to_string(),
        }
    }

    /// Wrap an I/O error against the source ISO.
    pub fn file_io(path: impl Into<PathBuf>, err: impl ToString) -> Self {
        Error::FileIo {
            path: path.into(),
            cause: err.to_string(),
        }
    }

    /// Map an `open(2)` failure on a device node, distinguishing missing
    /// privilege from plain I/O trouble.
    pub fn from_open(device: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::Permission {
                device: device.to_path_buf(),
            }
        } else {
            Error::device_io(device, err)
        }
    }
}
