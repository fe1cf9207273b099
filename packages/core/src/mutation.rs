//! Mount, unmount and eject commands and their expected outcomes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::config::ServiceConfig;
use crate::diskinfo::DISKUTIL;
use crate::executor::command_line;
use crate::partition::{PartitionRecord, Snapshot};

/// A state-changing disk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Mount,
    Unmount,
    /// Ejects the whole disk holding the partition.
    Eject,
}

impl MutationKind {
    /// The `diskutil` verb.
    pub fn verb(self) -> &'static str {
        match self {
            MutationKind::Mount => "mount",
            MutationKind::Unmount => "unmount",
            MutationKind::Eject => "eject",
        }
    }

    /// The identifier the command acts on.
    pub fn target(self, record: &PartitionRecord) -> &str {
        match self {
            MutationKind::Mount | MutationKind::Unmount => record.device_id(),
            MutationKind::Eject => record.parent_disk_id(),
        }
    }

    /// The shell command line handed to the elevation wrapper.
    pub fn command_line(self, record: &PartitionRecord) -> String {
        command_line(DISKUTIL, &[self.verb(), self.target(record)])
    }

    /// The state a successful run should lead to.
    pub fn expected_state(self) -> ExpectedState {
        match self {
            MutationKind::Mount => ExpectedState::Mounted,
            MutationKind::Unmount => ExpectedState::Unmounted,
            MutationKind::Eject => ExpectedState::Gone,
        }
    }

    /// Wait before the first verification scan.
    pub fn grace(self, config: &ServiceConfig) -> Duration {
        match self {
            MutationKind::Mount | MutationKind::Unmount => config.mount_grace,
            MutationKind::Eject => config.eject_grace,
        }
    }
}

/// Observable state a partition should reach after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpectedState {
    Mounted,
    Unmounted,
    /// The partition and every other partition of its disk left the listing.
    Gone,
}

impl ExpectedState {
    /// Checks `snapshot` for the state of the partition `record` described.
    pub fn is_met(self, snapshot: &Snapshot, record: &PartitionRecord) -> bool {
        let current = snapshot.find(record.device_id());
        match self {
            ExpectedState::Mounted => current.is_some_and(PartitionRecord::is_mounted),
            ExpectedState::Unmounted => current.is_some_and(|p| !p.is_mounted()),
            ExpectedState::Gone => {
                current.is_none() && snapshot.on_disk(record.parent_disk_id()).next().is_none()
            }
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ExpectedState::Mounted => "mounted",
            ExpectedState::Unmounted => "unmounted",
            ExpectedState::Gone => "ejected",
        }
    }
}

/// Result of a mutation whose effect was confirmed by a rescan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub kind: MutationKind,
    pub device_id: String,
    /// Identifier passed to `diskutil` (the parent disk for eject).
    pub target: String,
    /// Output of the elevated command.
    pub output: String,
    /// Verification scans it took to observe the expected state.
    pub attempts: u32,
    /// Snapshot that confirmed the expected state.
    pub snapshot: Arc<Snapshot>,
    pub finished_at: SystemTime,
}

impl MutationOutcome {
    /// The partition as seen after the mutation; `None` after eject.
    pub fn partition(&self) -> Option<&PartitionRecord> {
        self.snapshot.find(&self.device_id)
    }
}
