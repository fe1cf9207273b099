//! Parsing of `diskutil` text output.
//!
//! `diskutil list` is scanned for EFI partition identifiers and
//! `diskutil info <target>` is read as a list of `key: value` fields.

use log::debug;

use crate::error::Result;
use crate::executor::CommandRunner;

/// Program used for every disk query and mutation.
pub const DISKUTIL: &str = "diskutil";

/// Value `diskutil` reports in `Mount Point` for an unmounted volume.
pub const NOT_MOUNTED: &str = "Not Mounted";

/// Field names queried from `diskutil info`.
pub mod field {
    pub const DEVICE_IDENTIFIER: &str = "Device Identifier";
    pub const PART_OF_WHOLE: &str = "Part of Whole";
    pub const VOLUME_NAME: &str = "Volume Name";
    pub const MEDIA_NAME: &str = "Media Name";
    pub const MOUNT_POINT: &str = "Mount Point";
    pub const READ_ONLY_VOLUME: &str = "Read-Only Volume";
    pub const READ_ONLY_MEDIA: &str = "Read-Only Media";
    pub const READ_ONLY: &str = "Read-Only";
    pub const INTERNAL: &str = "Internal";
    pub const DEVICE_LOCATION: &str = "Device Location";
    pub const PROTOCOL: &str = "Protocol";
}

/// Parsed `diskutil info` output.
///
/// Fields keep their listing order; lookups return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoMap {
    fields: Vec<(String, String)>,
}

impl InfoMap {
    /// Parses `key: value` lines. Lines without a colon are ignored.
    pub fn parse(text: &str) -> Self {
        let fields = text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Self { fields }
    }

    /// Returns the value of `key`.
    ///
    /// Empty values and `Not applicable ...` placeholders count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty() && !v.starts_with("Not applicable"))
    }

    /// Returns the value of the first key in `keys` that is present.
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Reads a `Yes`/`No` field.
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse_flag)
    }

    /// Returns true if no fields were parsed.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("yes") {
        Some(true)
    } else if lower.starts_with("no") {
        Some(false)
    } else {
        None
    }
}

/// Runs `diskutil info <target>` and parses the result.
///
/// `target` may be a device identifier, a partition UUID or a mount path.
pub fn query_info(runner: &dyn CommandRunner, target: &str) -> Result<InfoMap> {
    let output = runner.run(DISKUTIL, &["info", target])?;
    Ok(InfoMap::parse(&output))
}

/// Extracts EFI partition identifiers from `diskutil list` output.
///
/// Every line mentioning `EFI` contributes its last whitespace-delimited
/// token, in listing order.
pub fn parse_efi_list(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| line.contains("EFI"))
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_string)
        .collect()
}

/// Lists the identifiers of all EFI partitions on the host.
pub fn list_efi_partitions(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let output = runner.run(DISKUTIL, &["list"])?;
    let ids = parse_efi_list(&output);
    debug!("found {} EFI partition candidates: {:?}", ids.len(), ids);
    Ok(ids)
}
