//! Optional defaults file.
//!
//! The CLI reads `usbforge.toml` (next to the invocation, or an explicit
//! path) for default values; flags always win. Unknown keys are rejected
//! so typos fail loudly instead of silently doing nothing.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::fs::FsKind;
use crate::table::TableKind;

/// Default config filename searched in the working directory.
pub const CONFIG_FILENAME: &str = "usbforge.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    persistence_fs: Option<String>,
    partition_table: Option<String>,
    pub fast_mode: Option<bool>,
    pub verify: Option<bool>,
}

impl Defaults {
    pub fn persistence_fs(&self) -> Result<Option<FsKind>> {
        self.persistence_fs
            .as_deref()
            .map(FsKind::from_str)
            .transpose()
    }

    pub fn partition_table(&self) -> Result<Option<TableKind>> {
        match self.partition_table.as_deref() {
            None => Ok(None),
            Some("mbr") | Some("MBR") => Ok(Some(TableKind::Mbr)),
            Some("gpt") | Some("GPT") => Ok(Some(TableKind::Gpt)),
            Some(other) => Err(Error::InvalidArgument(format!(
                "invalid partition_table '{other}' in config (expected 'mbr' or 'gpt')"
            ))),
        }
    }
}

/// Load a config file. A missing file is not an error; it just means no
/// defaults.
pub fn load(path: &Path) -> Result<ToolConfig> {
    if !path.exists() {
        return Ok(ToolConfig::default());
    }

    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidArgument(format!("cannot read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&text).map_err(|e| {
        Error::InvalidArgument(format!("cannot parse config '{}': {e}", path.display()))
    })
}

/// Config discovered in the working directory, if any.
pub fn load_default() -> Result<ToolConfig> {
    load(&PathBuf::from(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_of(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn missing_file_gives_empty_defaults() {
        let cfg = load(Path::new("/no/such/usbforge.toml")).unwrap();
        assert!(cfg.defaults.persistence_fs().unwrap().is_none());
        assert!(cfg.defaults.fast_mode.is_none());
    }

    #[test]
    fn parses_full_defaults() {
        let file = config_of(
            "[defaults]\n\
             persistence_fs = \"ntfs\"\n\
             partition_table = \"gpt\"\n\
             fast_mode = true\n\
             verify = false\n",
        );
        let cfg = load(file.path()).unwrap();

        assert_eq!(cfg.defaults.persistence_fs().unwrap(), Some(FsKind::Ntfs));
        assert_eq!(
            cfg.defaults.partition_table().unwrap(),
            Some(TableKind::Gpt)
        );
        assert_eq!(cfg.defaults.fast_mode, Some(true));
        assert_eq!(cfg.defaults.verify, Some(false));
    }

    #[test]
    fn rejects_unknown_keys() {
        let file = config_of("[defaults]\npersistense_fs = \"ext4\"\n");
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let file = config_of("[defaults]\npartition_table = \"apm\"\n");
        let cfg = load(file.path()).unwrap();
        assert!(cfg.defaults.partition_table().is_err());
    }
}
