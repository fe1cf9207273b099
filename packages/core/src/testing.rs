//! Scripted collaborators shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::executor::{CommandRunner, command_line};

#[derive(Debug, Clone)]
enum Reply {
    Ok(String),
    Exit(i32, String),
}

/// A [`CommandRunner`] answering from a table keyed by command line.
///
/// Unknown commands fail with exit code 1 so a missing fixture shows up as a
/// lookup failure instead of a panic on a worker thread.
#[derive(Debug, Default)]
pub(crate) struct FakeRunner {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn ok(&self, command: &str, output: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .insert(command.to_string(), Reply::Ok(output.to_string()));
        self
    }

    pub(crate) fn fail(&self, command: &str, code: i32, output: &str) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .insert(command.to_string(), Reply::Exit(code, output.to_string()));
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| *c == command).count()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = command_line(program, args);
        self.calls.lock().unwrap().push(command.clone());
        let reply = self.replies.lock().unwrap().get(&command).cloned();
        match reply {
            Some(Reply::Ok(output)) => Ok(output),
            Some(Reply::Exit(code, output)) => Err(Error::CommandExit {
                command,
                code,
                output,
            }),
            None => Err(Error::CommandExit {
                output: format!("unexpected command: {command}"),
                command,
                code: 1,
            }),
        }
    }
}

/// Renders `diskutil info` style text from field pairs.
pub(crate) fn info(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("   {:<27}{}\n", format!("{k}:"), v))
        .collect()
}

/// Renders a `diskutil list` listing with one EFI partition per identifier.
pub(crate) fn efi_listing(ids: &[&str]) -> String {
    let mut out = String::new();
    for id in ids {
        let whole = id.rfind('s').map_or(*id, |at| &id[..at]);
        out.push_str(&format!("/dev/{whole} (internal, physical):\n"));
        out.push_str("   #:                       TYPE NAME                    SIZE       IDENTIFIER\n");
        out.push_str(&format!(
            "   0:      GUID_partition_scheme                        *500.3 GB   {whole}\n"
        ));
        out.push_str(&format!(
            "   1:                        EFI EFI                     209.7 MB   {id}\n"
        ));
    }
    out
}

/// Script for one EFI partition and its parent disk.
pub(crate) struct FakePartition<'a> {
    pub id: &'a str,
    pub parent: &'a str,
    pub volume_name: &'a str,
    pub mount_point: &'a str,
    pub read_only: bool,
    pub location: &'a str,
    pub protocol: &'a str,
}

impl<'a> FakePartition<'a> {
    pub(crate) fn internal(id: &'a str, parent: &'a str) -> Self {
        Self {
            id,
            parent,
            volume_name: "EFI",
            mount_point: crate::diskinfo::NOT_MOUNTED,
            read_only: false,
            location: "Internal",
            protocol: "PCI-Express",
        }
    }

    pub(crate) fn usb(id: &'a str, parent: &'a str) -> Self {
        Self {
            location: "External",
            protocol: "USB",
            ..Self::internal(id, parent)
        }
    }

    pub(crate) fn mounted_at(mut self, mount_point: &'a str) -> Self {
        self.mount_point = mount_point;
        self
    }

    /// Registers (or replaces) the `diskutil info` replies for this partition.
    pub(crate) fn install(&self, runner: &FakeRunner) {
        let read_only = if self.read_only { "Yes" } else { "No" };
        runner.ok(
            &format!("diskutil info {}", self.id),
            &info(&[
                ("Device Identifier", self.id),
                ("Part of Whole", self.parent),
                ("Volume Name", self.volume_name),
                ("Mount Point", self.mount_point),
                ("Read-Only Media", "No"),
                ("Read-Only Volume", read_only),
            ]),
        );
        runner.ok(
            &format!("diskutil info {}", self.parent),
            &info(&[
                ("Device Identifier", self.parent),
                ("Media Name", "APPLE SSD"),
                ("Protocol", self.protocol),
                ("Device Location", self.location),
            ]),
        );
    }
}
