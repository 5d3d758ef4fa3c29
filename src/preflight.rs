//! Preflight checks.
//!
//! Validates that the host has the external tools a run will need before
//! any destructive step. This prevents cryptic mid-run failures (for
//! example discovering that `mkfs.ntfs` is missing after the device has
//! already been wiped).

use std::process::Command;

use crate::error::{Error, Result};
use crate::fs::FsKind;

/// Check if a command exists on the host system.
///
/// Uses `which` to locate the command in PATH.
pub fn command_exists(cmd: &str) -> bool {
    Command::new("which")
        .arg(cmd)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Tools every destructive run relies on.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("losetup", "util-linux"),
    ("blockdev", "util-linux"),
    ("partprobe", "parted"),
];

/// Formatter tool used for a persistence filesystem kind.
pub fn formatter_tool(kind: FsKind) -> (&'static str, &'static str) {
    match kind {
        FsKind::Ext4 => ("mkfs.ext4", "e2fsprogs"),
        FsKind::Ntfs => ("mkfs.ntfs", "ntfs-3g"),
        FsKind::ExFat | FsKind::Fat64 => ("mkfs.exfat", "exfatprogs"),
        FsKind::Fat32 => ("mkfs.vfat", "dosfstools"),
    }
}

/// Check that specific tools are available.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }

    if !missing.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "missing required host tools:\n{}",
            missing.join("\n")
        )));
    }

    Ok(())
}

/// Check the base tool set plus the formatter for the requested
/// persistence filesystem, if any.
pub fn check_host_tools(persistence_fs: Option<FsKind>) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = REQUIRED_TOOLS.to_vec();
    if let Some(kind) = persistence_fs {
        tools.push(formatter_tool(kind));
    }
    check_required_tools(&tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn formatter_tools_cover_every_kind() {
        for kind in [
            FsKind::Ext4,
            FsKind::Ntfs,
            FsKind::ExFat,
            FsKind::Fat32,
            FsKind::Fat64,
        ] {
            let (tool, package) = formatter_tool(kind);
            assert!(!tool.is_empty());
            assert!(!package.is_empty());
        }
    }
}
