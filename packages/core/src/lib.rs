//! efi-mount-core: Core library for EFI system partition management.
//!
//! This library discovers the EFI system partitions attached to a macOS
//! host, identifies the one the firmware booted from, and mounts, unmounts
//! or ejects them through a privileged helper.
//!
//! # Modules
//!
//! - [`diskinfo`]: `diskutil` output parsing
//! - [`boot`]: Boot EFI partition resolution (`nvram` boot-path, root disk fallback)
//! - [`partition`]: Partition records, snapshots and enumeration
//! - [`privileged`]: Elevated command execution with timeout and cancellation
//! - [`mutation`]: Mount/unmount/eject commands and their expected outcomes
//! - [`service`]: Scan and mutation scheduling with post-mutation verification
//! - [`desktop`]: File browser and window hooks after a mount
//! - [`config`]: Service timing and busy policy
//! - [`executor`]: Command execution
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use efi_mount_core::{SystemRunner, partition};
//!
//! let snapshot = partition::enumerate(&SystemRunner).unwrap();
//! for record in &snapshot.partitions {
//!     println!(
//!         "{} {} boot={} mounted={}",
//!         record.device_id(),
//!         record.display_name(),
//!         record.is_boot_efi(),
//!         record.is_mounted()
//!     );
//! }
//! ```

pub mod boot;
pub mod config;
pub mod desktop;
pub mod diskinfo;
pub mod error;
pub mod executor;
pub mod mutation;
pub mod partition;
pub mod privileged;
pub mod service;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use boot::{BootEfi, BootSource};
pub use config::{BusyPolicy, ServiceConfig};
pub use desktop::{DesktopHooks, NoDesktop, SystemDesktop};
pub use error::{Error, Result};
pub use executor::{CommandRunner, SystemRunner};
pub use mutation::{MutationKind, MutationOutcome};
pub use partition::{Bootloader, PartitionFailure, PartitionRecord, Snapshot};
pub use privileged::{CancelHandle, CancelToken, ElevationWrapper, PrivilegeEscalation};
pub use service::{PartitionService, ServiceEvent};
