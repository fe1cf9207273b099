//! Human-readable rendering of snapshots, outcomes and events.

use std::fmt::Write;

use efi_mount_core::{BootSource, MutationOutcome, PartitionRecord, ServiceEvent, Snapshot};

/// Renders the partition table printed by `list` and `rescan`.
pub fn render_snapshot(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    if snapshot.partitions.is_empty() {
        out.push_str("No EFI partitions found.\n");
    } else {
        let _ = writeln!(
            out,
            "{:<12} {:<10} {:<24} {:<8} {:<10} {}",
            "DEVICE", "DISK", "NAME", "FLAGS", "LOADER", "MOUNT POINT"
        );
        for record in &snapshot.partitions {
            let _ = writeln!(out, "{}", render_record(record));
        }
    }

    for failure in &snapshot.failures {
        let _ = writeln!(out, "warning: {}: {}", failure.device_id, failure.message);
    }

    out
}

fn render_record(record: &PartitionRecord) -> String {
    let mount_point = record
        .mount_point()
        .map_or_else(|| "-".to_string(), |p| p.display().to_string());
    let loader = record.bootloader().map_or("-", |b| b.name());

    format!(
        "{:<12} {:<10} {:<24} {:<8} {:<10} {}",
        record.device_id(),
        record.parent_disk_id(),
        record.display_name(),
        flags(record),
        loader,
        mount_point
    )
}

/// Compact flag column: `B` boot, `I` internal / `E` external, `R` read-only,
/// `J` ejectable.
fn flags(record: &PartitionRecord) -> String {
    let mut flags = String::new();
    if record.is_boot_efi() {
        flags.push('B');
    }
    flags.push(if record.is_internal() { 'I' } else { 'E' });
    if record.is_read_only() {
        flags.push('R');
    }
    if record.can_eject() {
        flags.push('J');
    }
    flags
}

pub fn render_boot(snapshot: &Snapshot) -> String {
    match &snapshot.boot_efi {
        Some(boot) => {
            let source = match boot.source {
                BootSource::FirmwareVariable => "firmware boot-path",
                BootSource::RootDiskFallback => "assumed: slot 1 of the root disk",
            };
            format!("{} ({})", boot.device_id, source)
        }
        None => "Boot EFI partition could not be determined.".to_string(),
    }
}

pub fn render_outcome(outcome: &MutationOutcome) -> String {
    let mut out = String::new();
    if !outcome.output.is_empty() {
        let _ = writeln!(out, "{}", outcome.output);
    }

    let state = match outcome.partition() {
        Some(record) => match record.mount_point() {
            Some(path) => format!("mounted at {}", path.display()),
            None => "not mounted".to_string(),
        },
        None => format!("{} ejected", outcome.target),
    };
    let _ = write!(out, "{}: {}", outcome.device_id, state);
    out
}

/// One line per event for `watch`.
pub fn render_event(event: &ServiceEvent) -> String {
    match event {
        ServiceEvent::ScanStarted => "scan started".to_string(),
        ServiceEvent::ScanCompleted(Ok(snapshot)) => format!(
            "scan completed: {} partition(s), {} mounted",
            snapshot.partitions.len(),
            snapshot.partitions.iter().filter(|p| p.is_mounted()).count()
        ),
        ServiceEvent::ScanCompleted(Err(message)) => format!("scan failed: {message}"),
        ServiceEvent::MutationStarted { kind, device_id } => {
            format!("{} {} started", kind.verb(), device_id)
        }
        ServiceEvent::MutationCompleted(Ok(outcome)) => {
            format!("{} {} done", outcome.kind.verb(), outcome.device_id)
        }
        ServiceEvent::MutationCompleted(Err(message)) => format!("operation failed: {message}"),
        ServiceEvent::RequestRejected { operation } => format!("{operation} rejected: busy"),
    }
}
