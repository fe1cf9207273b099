//! EFI partition discovery and classification.
//!
//! A scan lists every EFI partition with `diskutil list`, inspects each one
//! (and its parent disk) with `diskutil info`, and produces an immutable
//! [`Snapshot`]. Records are rebuilt from scratch on every scan; identity
//! across scans is the device identifier alone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};
use serde::Serialize;
use snafu::ResultExt;

use crate::boot::{self, BootEfi};
use crate::diskinfo::{self, InfoMap, NOT_MOUNTED, field};
use crate::error::{Error, PartitionLookupSnafu, Result};
use crate::executor::CommandRunner;

/// Boot manager detected on a mounted EFI partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Bootloader {
    OpenCore,
    Clover,
}

impl Bootloader {
    /// Probe order.
    pub const ALL: [Bootloader; 2] = [Bootloader::OpenCore, Bootloader::Clover];

    /// Directory, relative to the mount point, whose presence identifies the
    /// bootloader.
    pub fn directory(self) -> &'static str {
        match self {
            Bootloader::OpenCore => "EFI/OC",
            Bootloader::Clover => "EFI/CLOVER",
        }
    }

    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            Bootloader::OpenCore => "OpenCore",
            Bootloader::Clover => "Clover",
        }
    }

    /// Returns the first bootloader whose directory exists under `mount_point`.
    pub fn probe(mount_point: &Path) -> Option<Bootloader> {
        Self::ALL
            .into_iter()
            .find(|loader| mount_point.join(loader.directory()).is_dir())
    }
}

/// Raw values gathered for one partition before derived fields are computed.
#[derive(Debug, Clone, Default)]
pub struct PartitionParts {
    pub device_id: String,
    pub parent_disk_id: String,
    pub label: String,
    /// `Mount Point` as reported; empty or `Not Mounted` when unmounted.
    pub mount_point: String,
    pub is_boot_efi: bool,
    pub bootloader: Option<Bootloader>,
    pub is_internal: bool,
    pub is_read_only: bool,
    pub protocol: Option<String>,
}

/// One discovered EFI partition.
///
/// Derived fields (`is_mounted`, `has_bootloader`, `can_eject`) are computed
/// once in [`PartitionRecord::from_parts`] and cannot disagree with the fields
/// they are derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRecord {
    device_id: String,
    parent_disk_id: String,
    label: String,
    mount_point: Option<PathBuf>,
    is_mounted: bool,
    is_boot_efi: bool,
    has_bootloader: bool,
    bootloader: Option<Bootloader>,
    is_internal: bool,
    is_read_only: bool,
    can_eject: bool,
    protocol: Option<String>,
}

impl PartitionRecord {
    /// Builds a record, normalising the mount point and deriving flags.
    ///
    /// A bootloader is only kept when the partition is mounted.
    pub fn from_parts(parts: PartitionParts) -> Result<Self> {
        if parts.device_id.trim().is_empty() {
            return Err(Error::MissingField {
                device: "<unknown>".to_string(),
                field: field::DEVICE_IDENTIFIER.to_string(),
            });
        }

        let mount_point = normalize_mount_point(&parts.mount_point);
        let is_mounted = mount_point.is_some();
        let bootloader = parts.bootloader.filter(|_| is_mounted);

        Ok(Self {
            device_id: parts.device_id,
            parent_disk_id: parts.parent_disk_id,
            label: parts.label,
            is_mounted,
            is_boot_efi: parts.is_boot_efi,
            has_bootloader: bootloader.is_some(),
            bootloader,
            is_internal: parts.is_internal,
            is_read_only: parts.is_read_only,
            can_eject: !parts.is_internal && is_mounted,
            protocol: parts.protocol,
            mount_point,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn parent_disk_id(&self) -> &str {
        &self.parent_disk_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Absolute mount path, if mounted.
    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn is_mounted(&self) -> bool {
        self.is_mounted
    }

    pub fn is_boot_efi(&self) -> bool {
        self.is_boot_efi
    }

    pub fn has_bootloader(&self) -> bool {
        self.has_bootloader
    }

    pub fn bootloader(&self) -> Option<Bootloader> {
        self.bootloader
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    /// External partitions can be ejected while mounted.
    pub fn can_eject(&self) -> bool {
        self.can_eject
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Label for display, falling back to the device identifier.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.device_id
        } else {
            &self.label
        }
    }
}

fn normalize_mount_point(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw == NOT_MOUNTED {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}

/// A partition that was listed but could not be inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionFailure {
    pub device_id: String,
    pub message: String,
}

/// The result of one scan. Never modified after it is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub partitions: Vec<PartitionRecord>,
    pub failures: Vec<PartitionFailure>,
    pub boot_efi: Option<BootEfi>,
    pub taken_at: SystemTime,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            failures: Vec::new(),
            boot_efi: None,
            taken_at: SystemTime::UNIX_EPOCH,
        }
    }
}

impl Snapshot {
    /// Finds a partition by device identifier.
    pub fn find(&self, device_id: &str) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.device_id == device_id)
    }

    /// Returns the partition flagged as the boot EFI partition, if listed.
    pub fn boot_partition(&self) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.is_boot_efi)
    }

    /// Returns all partitions on the given whole disk.
    pub fn on_disk<'a>(&'a self, disk_id: &'a str) -> impl Iterator<Item = &'a PartitionRecord> {
        self.partitions
            .iter()
            .filter(move |p| p.parent_disk_id == disk_id)
    }

    /// Returns true if every listed partition was inspected.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Scans the host for EFI partitions.
pub fn enumerate(runner: &dyn CommandRunner) -> Result<Snapshot> {
    enumerate_with_probe(runner, &Bootloader::probe)
}

/// Scans the host, probing mounted partitions with `probe`.
///
/// Fails only if the partition listing itself fails. A partition whose
/// lookups fail is reported in [`Snapshot::failures`] instead of the list.
pub fn enumerate_with_probe(
    runner: &dyn CommandRunner,
    probe: &dyn Fn(&Path) -> Option<Bootloader>,
) -> Result<Snapshot> {
    let candidates = diskinfo::list_efi_partitions(runner)?;
    let boot_efi = boot::resolve_boot_efi(runner);
    let boot_id = boot_efi.as_ref().map(|b| b.device_id.as_str());

    let mut parents: HashMap<String, InfoMap> = HashMap::new();
    let mut partitions = Vec::with_capacity(candidates.len());
    let mut failures = Vec::new();

    for device_id in candidates {
        let inspected = inspect_partition(runner, &device_id, boot_id, &mut parents, probe)
            .context(PartitionLookupSnafu {
                device_id: device_id.clone(),
            });
        match inspected {
            Ok(record) => {
                debug!("inspected {:?}", record);
                partitions.push(record);
            }
            Err(e) => {
                warn!("{}", e);
                failures.push(PartitionFailure {
                    device_id,
                    message: e.user_message(),
                });
            }
        }
    }

    info!(
        "scan found {} EFI partitions ({} failed)",
        partitions.len(),
        failures.len()
    );

    Ok(Snapshot {
        partitions,
        failures,
        boot_efi,
        taken_at: SystemTime::now(),
    })
}

fn inspect_partition(
    runner: &dyn CommandRunner,
    device_id: &str,
    boot_id: Option<&str>,
    parents: &mut HashMap<String, InfoMap>,
    probe: &dyn Fn(&Path) -> Option<Bootloader>,
) -> Result<PartitionRecord> {
    let info = diskinfo::query_info(runner, device_id)?;
    let parent_disk_id = info
        .get(field::PART_OF_WHOLE)
        .ok_or_else(|| Error::MissingField {
            device: device_id.to_string(),
            field: field::PART_OF_WHOLE.to_string(),
        })?
        .to_string();

    if !parents.contains_key(&parent_disk_id) {
        let parent = diskinfo::query_info(runner, &parent_disk_id)?;
        parents.insert(parent_disk_id.clone(), parent);
    }
    let parent = &parents[&parent_disk_id];

    let label = info
        .first_of(&[field::VOLUME_NAME, field::MEDIA_NAME])
        .or_else(|| parent.get(field::MEDIA_NAME))
        .unwrap_or_default()
        .to_string();

    let mount_point = info.get(field::MOUNT_POINT).unwrap_or_default().to_string();
    let bootloader = normalize_mount_point(&mount_point).and_then(|path| probe(&path));

    let is_read_only = [
        field::READ_ONLY_VOLUME,
        field::READ_ONLY_MEDIA,
        field::READ_ONLY,
    ]
    .iter()
    .find_map(|key| info.flag(key))
    .unwrap_or(false);

    PartitionRecord::from_parts(PartitionParts {
        device_id: device_id.to_string(),
        parent_disk_id,
        label,
        mount_point,
        is_boot_efi: boot_id == Some(device_id),
        bootloader,
        is_internal: is_internal_disk(parent),
        is_read_only,
        protocol: parent.get(field::PROTOCOL).map(str::to_string),
    })
}

/// A disk is internal unless it says otherwise or sits on USB.
pub fn is_internal_disk(disk: &InfoMap) -> bool {
    let reports_external = disk.flag(field::INTERNAL) == Some(false)
        || disk
            .get(field::DEVICE_LOCATION)
            .is_some_and(|location| location.eq_ignore_ascii_case("external"));
    let on_usb = disk
        .get(field::PROTOCOL)
        .is_some_and(|protocol| protocol.eq_ignore_ascii_case("usb"));

    !(reports_external || on_usb)
}
