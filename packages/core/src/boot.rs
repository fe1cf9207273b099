//! Boot EFI partition resolution.
//!
//! The firmware records the partition it booted from in the `boot-path`
//! variable. When that variable cannot be read or resolved, the resolver falls
//! back to slot 1 of the disk holding the root filesystem. The fallback is an
//! approximation: it is right for the standard GPT layout (ESP first) and
//! wrong for disks that put something else in slot 1.

use log::{debug, info, warn};
use serde::Serialize;

use crate::diskinfo::{self, field};
use crate::error::{Error, Result};
use crate::executor::CommandRunner;

/// Program used to read firmware variables.
pub const NVRAM: &str = "nvram";

/// Firmware variable holding the device path of the last boot.
pub const BOOT_PATH_VARIABLE: &str = "4D1FDA02-38C7-4A6A-9CC6-4BCCA8B30102:boot-path";

/// Which strategy identified the boot partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BootSource {
    /// Resolved from the GPT UUID in the firmware `boot-path` variable.
    FirmwareVariable,
    /// Assumed to be slot 1 of the root filesystem's whole disk.
    RootDiskFallback,
}

/// The resolved boot EFI partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootEfi {
    pub device_id: String,
    pub source: BootSource,
}

/// Resolves the firmware's boot EFI partition.
///
/// Never fails: when neither strategy works the result is `None` and no
/// partition is flagged as the boot partition.
pub fn resolve_boot_efi(runner: &dyn CommandRunner) -> Option<BootEfi> {
    match boot_efi_from_firmware(runner) {
        Ok(device_id) => {
            info!("boot EFI partition is {} (firmware boot-path)", device_id);
            return Some(BootEfi {
                device_id,
                source: BootSource::FirmwareVariable,
            });
        }
        Err(e) => warn!("boot-path lookup failed, trying root disk: {}", e),
    }

    match boot_efi_from_root_disk(runner) {
        Ok(device_id) => {
            info!("assuming boot EFI partition is {} (root disk slot 1)", device_id);
            Some(BootEfi {
                device_id,
                source: BootSource::RootDiskFallback,
            })
        }
        Err(e) => {
            warn!("could not resolve boot EFI partition: {}", e);
            None
        }
    }
}

/// Reads the `boot-path` firmware variable and resolves its partition UUID.
pub fn boot_efi_from_firmware(runner: &dyn CommandRunner) -> Result<String> {
    let value = runner.run(NVRAM, &[BOOT_PATH_VARIABLE])?;
    let uuid = extract_partition_uuid(&value).ok_or_else(|| Error::InvalidBootPath {
        value: value.clone(),
    })?;
    debug!("boot-path partition UUID is {}", uuid);

    let info = diskinfo::query_info(runner, uuid)?;
    info.get(field::DEVICE_IDENTIFIER)
        .map(str::to_string)
        .ok_or_else(|| Error::MissingField {
            device: uuid.to_string(),
            field: field::DEVICE_IDENTIFIER.to_string(),
        })
}

/// Assumes the ESP is partition 1 of the disk holding `/`.
pub fn boot_efi_from_root_disk(runner: &dyn CommandRunner) -> Result<String> {
    let root = diskinfo::query_info(runner, "/")?;
    let root_device = root
        .get(field::DEVICE_IDENTIFIER)
        .ok_or_else(|| Error::MissingField {
            device: "/".to_string(),
            field: field::DEVICE_IDENTIFIER.to_string(),
        })?;

    let device = diskinfo::query_info(runner, root_device)?;
    let whole = device
        .get(field::PART_OF_WHOLE)
        .ok_or_else(|| Error::MissingField {
            device: root_device.to_string(),
            field: field::PART_OF_WHOLE.to_string(),
        })?;

    Ok(format!("{whole}s1"))
}

/// Extracts the GPT partition UUID from a firmware device path.
///
/// The UUID is the third comma-separated field of the hard drive node, as in
/// `HD(1,GPT,<uuid>,0x28,0x64000)`. Paths without an `HD(` node are split as
/// a whole.
pub fn extract_partition_uuid(boot_path: &str) -> Option<&str> {
    let node = boot_path
        .find("HD(")
        .map_or(boot_path, |at| &boot_path[at + 3..]);
    node.split(',')
        .nth(2)
        .map(str::trim)
        .filter(|candidate| is_gpt_uuid(candidate))
}

fn is_gpt_uuid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(group, len)| group.len() == len && group.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, info};

    const UUID: &str = "A1B2C3D4-0000-4000-8000-0123456789AB";

    fn nvram_command() -> String {
        format!("nvram {BOOT_PATH_VARIABLE}")
    }

    fn boot_path() -> String {
        format!(
            "{BOOT_PATH_VARIABLE}\tPciRoot(0x0)/Pci(0x1b,0x4)/Pci(0x0,0x0)/NVMe(0x1,00-00-00-00-00-00-00-00)/HD(1,GPT,{UUID},0x28,0x64000)/\\EFI\\OC\\OpenCore.efi"
        )
    }

    fn install_root_disk(runner: &FakeRunner) {
        runner.ok(
            "diskutil info /",
            &info(&[("Device Identifier", "disk1s5s1"), ("Part of Whole", "disk1")]),
        );
        runner.ok(
            "diskutil info disk1s5s1",
            &info(&[("Device Identifier", "disk1s5s1"), ("Part of Whole", "disk1")]),
        );
    }

    #[test]
    fn test_extract_partition_uuid() {
        assert_eq!(extract_partition_uuid(&boot_path()), Some(UUID));

        let lower = UUID.to_lowercase();
        let path = format!("HD(2,GPT,{lower},0x1,0x2)");
        assert_eq!(extract_partition_uuid(&path), Some(lower.as_str()));
    }

    #[test]
    fn test_extract_partition_uuid_without_hd_node() {
        assert_eq!(extract_partition_uuid(&format!("1,GPT,{UUID},0x28")), Some(UUID));
    }

    #[test]
    fn test_extract_partition_uuid_rejects_garbage() {
        assert_eq!(extract_partition_uuid("PciRoot(0x0)/Pci(0x1,0x1)"), None);
        assert_eq!(extract_partition_uuid("HD(1,MBR,0x1234,0x800,0x1000)"), None);
        assert_eq!(extract_partition_uuid(""), None);
    }

    #[test]
    fn test_resolve_from_firmware() {
        let runner = FakeRunner::new();
        runner.ok(&nvram_command(), &boot_path());
        runner.ok(
            &format!("diskutil info {UUID}"),
            &info(&[("Device Identifier", "disk0s1")]),
        );

        let boot = resolve_boot_efi(&runner).unwrap();
        assert_eq!(boot.device_id, "disk0s1");
        assert_eq!(boot.source, BootSource::FirmwareVariable);
        assert_eq!(runner.count("diskutil info /"), 0);
    }

    #[test]
    fn test_fallback_when_nvram_fails() {
        let runner = FakeRunner::new();
        runner.fail(
            &nvram_command(),
            1,
            "nvram: Error getting variable - '4D1FDA02-38C7-4A6A-9CC6-4BCCA8B30102:boot-path': (iokit/common) data was not found",
        );
        install_root_disk(&runner);

        let boot = resolve_boot_efi(&runner).unwrap();
        assert_eq!(boot.device_id, "disk1s1");
        assert_eq!(boot.source, BootSource::RootDiskFallback);
    }

    #[test]
    fn test_fallback_when_uuid_does_not_resolve() {
        let runner = FakeRunner::new();
        runner.ok(&nvram_command(), &boot_path());
        runner.fail(
            &format!("diskutil info {UUID}"),
            1,
            &format!("Could not find disk: {UUID}"),
        );
        install_root_disk(&runner);

        let boot = resolve_boot_efi(&runner).unwrap();
        assert_eq!(boot.device_id, "disk1s1");
        assert_eq!(boot.source, BootSource::RootDiskFallback);
    }

    #[test]
    fn test_unresolved_is_none() {
        let runner = FakeRunner::new();
        assert_eq!(resolve_boot_efi(&runner), None);
    }

    #[test]
    fn test_root_disk_requires_part_of_whole() {
        let runner = FakeRunner::new();
        runner.ok("diskutil info /", &info(&[("Device Identifier", "disk3s1")]));
        runner.ok("diskutil info disk3s1", &info(&[("Device Identifier", "disk3s1")]));

        let err = boot_efi_from_root_disk(&runner).unwrap_err();
        assert!(matches!(err, Error::MissingField { ref field, .. } if field == "Part of Whole"));
    }
}
