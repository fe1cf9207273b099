//! Partition service: scanning, mutation and reconciliation.
//!
//! [`PartitionService`] owns the current [`Snapshot`] and is the only entry
//! point consumers need. Scans run on a blocking worker and publish a new
//! snapshot by swapping an `Arc`, so readers never observe a half-built list.
//! Mutations run through the elevation wrapper and are then verified by
//! rescanning with backoff until the partition reaches the expected state.
//!
//! One scan or mutation runs at a time per service. Requests arriving while
//! the gate is held either wait or fail with [`Error::Busy`], depending on
//! [`BusyPolicy`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use efi_mount_core::{PartitionService, PrivilegeEscalation, ServiceConfig, SystemRunner};
//! use efi_mount_core::desktop::NoDesktop;
//!
//! # async fn run() -> efi_mount_core::Result<()> {
//! let service = PartitionService::new(
//!     Arc::new(SystemRunner),
//!     Arc::new(PrivilegeEscalation::platform_default()),
//!     Arc::new(NoDesktop),
//!     ServiceConfig::default(),
//! );
//!
//! let snapshot = service.scan().await?;
//! if let Some(boot) = snapshot.boot_partition() {
//!     service.toggle_mount(boot).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::SystemTime;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{MutexGuard, broadcast};

use crate::config::{BusyPolicy, ServiceConfig};
use crate::desktop::DesktopHooks;
use crate::error::{Error, Result};
use crate::executor::CommandRunner;
use crate::mutation::{MutationKind, MutationOutcome};
use crate::partition::{self, PartitionRecord, Snapshot};
use crate::privileged::{self, CancelHandle, CancelToken, ElevationWrapper};

const EVENT_CAPACITY: usize = 64;

/// Notifications published by the service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServiceEvent {
    ScanStarted,
    /// A scan finished; on error the previous snapshot stays current.
    ScanCompleted(std::result::Result<Arc<Snapshot>, String>),
    #[serde(rename_all = "camelCase")]
    MutationStarted {
        kind: MutationKind,
        device_id: String,
    },
    MutationCompleted(std::result::Result<MutationOutcome, String>),
    /// A request was refused under [`BusyPolicy::Reject`].
    RequestRejected { operation: String },
}

/// Discovers EFI partitions and mounts, unmounts or ejects them.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct PartitionService {
    inner: Arc<Inner>,
}

struct Inner {
    runner: Arc<dyn CommandRunner>,
    elevation: Arc<dyn ElevationWrapper>,
    desktop: Arc<dyn DesktopHooks>,
    config: ServiceConfig,
    snapshot: RwLock<Arc<Snapshot>>,
    scanning: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_operation: Mutex<Option<SystemTime>>,
    gate: tokio::sync::Mutex<()>,
    cancel: CancelHandle,
    events: broadcast::Sender<ServiceEvent>,
}

impl PartitionService {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        elevation: Arc<dyn ElevationWrapper>,
        desktop: Arc<dyn DesktopHooks>,
        config: ServiceConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                runner,
                elevation,
                desktop,
                config,
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
                scanning: AtomicBool::new(false),
                last_error: Mutex::new(None),
                last_operation: Mutex::new(None),
                gate: tokio::sync::Mutex::new(()),
                cancel: CancelHandle::new(),
                events,
            }),
        }
    }

    /// Subscribes to service events. Events sent before subscribing are lost.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// The most recently published snapshot (empty before the first scan).
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// True while a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// The last user-visible error, cleared by the next successful scan.
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// When the last elevated command succeeded.
    pub fn last_operation(&self) -> Option<SystemTime> {
        *self
            .inner
            .last_operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Cancels the mutation in flight and any mutation waiting for its turn.
    pub fn cancel(&self) {
        info!("cancelling in-flight disk operation");
        self.inner.cancel.cancel();
    }

    /// Enumerates partitions now and publishes the result.
    pub async fn scan(&self) -> Result<Arc<Snapshot>> {
        let _gate = self.acquire("scan").await?;
        self.scan_locked().await
    }

    /// Waits for the rescan delay, then scans.
    ///
    /// Used when the disk set may have changed underneath (media plugged in
    /// or removed) and the OS may not have caught up yet.
    pub async fn force_rescan(&self) -> Result<Arc<Snapshot>> {
        debug!("forced rescan in {:?}", self.inner.config.rescan_delay);
        tokio::time::sleep(self.inner.config.rescan_delay).await;
        self.scan().await
    }

    /// Unmounts a mounted partition, mounts an unmounted one.
    pub async fn toggle_mount(&self, record: &PartitionRecord) -> Result<MutationOutcome> {
        if record.is_mounted() {
            self.unmount(record).await
        } else {
            self.mount(record).await
        }
    }

    /// Mounts the partition, then opens it in the file browser.
    pub async fn mount(&self, record: &PartitionRecord) -> Result<MutationOutcome> {
        self.mutate(MutationKind::Mount, record).await
    }

    pub async fn unmount(&self, record: &PartitionRecord) -> Result<MutationOutcome> {
        self.mutate(MutationKind::Unmount, record).await
    }

    /// Ejects the disk holding the partition.
    pub async fn eject(&self, record: &PartitionRecord) -> Result<MutationOutcome> {
        if !record.can_eject() {
            let err = Error::NotEjectable {
                device_id: record.device_id().to_string(),
            };
            self.report_mutation_error(&err);
            return Err(err);
        }
        self.mutate(MutationKind::Eject, record).await
    }

    async fn acquire(&self, operation: &str) -> Result<MutexGuard<'_, ()>> {
        match self.inner.config.busy_policy {
            BusyPolicy::Queue => Ok(self.inner.gate.lock().await),
            BusyPolicy::Reject => self.inner.gate.try_lock().map_err(|_| {
                warn!("rejected {}: another operation is running", operation);
                self.set_last_error(Some(Error::Busy.user_message()));
                self.emit(ServiceEvent::RequestRejected {
                    operation: operation.to_string(),
                });
                Error::Busy
            }),
        }
    }

    /// Scans and publishes. The caller holds the gate.
    async fn scan_locked(&self) -> Result<Arc<Snapshot>> {
        self.inner.scanning.store(true, Ordering::SeqCst);
        self.emit(ServiceEvent::ScanStarted);

        let runner = Arc::clone(&self.inner.runner);
        let result = tokio::task::spawn_blocking(move || partition::enumerate(runner.as_ref()))
            .await
            .map_err(|e| Error::Worker {
                message: e.to_string(),
            })
            .and_then(|scanned| scanned);

        self.inner.scanning.store(false, Ordering::SeqCst);

        match result {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self
                    .inner
                    .snapshot
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
                self.set_last_error(None);
                self.emit(ServiceEvent::ScanCompleted(Ok(Arc::clone(&snapshot))));
                Ok(snapshot)
            }
            Err(e) => {
                let message = e.user_message();
                error!("scan failed: {}", e);
                self.set_last_error(Some(message.clone()));
                self.emit(ServiceEvent::ScanCompleted(Err(message)));
                Err(e)
            }
        }
    }

    async fn mutate(&self, kind: MutationKind, record: &PartitionRecord) -> Result<MutationOutcome> {
        let cancel = self.inner.cancel.token();
        let _gate = self.acquire(kind.verb()).await?;

        info!("{} {}", kind.verb(), kind.target(record));
        self.emit(ServiceEvent::MutationStarted {
            kind,
            device_id: record.device_id().to_string(),
        });

        match self.mutate_locked(kind, record, &cancel).await {
            Ok(outcome) => {
                info!(
                    "{} {} confirmed after {} scan(s)",
                    kind.verb(),
                    record.device_id(),
                    outcome.attempts
                );
                self.emit(ServiceEvent::MutationCompleted(Ok(outcome.clone())));
                Ok(outcome)
            }
            Err(e) => {
                self.report_mutation_error(&e);
                Err(e)
            }
        }
    }

    async fn mutate_locked(
        &self,
        kind: MutationKind,
        record: &PartitionRecord,
        cancel: &CancelToken,
    ) -> Result<MutationOutcome> {
        let command = kind.command_line(record);

        let output = privileged::run_elevated(
            self.inner.elevation.as_ref(),
            &command,
            self.inner.config.elevation_timeout,
            cancel,
        )
        .await?;
        *self
            .inner
            .last_operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(SystemTime::now());

        let (snapshot, attempts) = self.verify(kind, record).await?;

        if kind == MutationKind::Mount {
            self.after_mount(&snapshot, record).await;
        }

        Ok(MutationOutcome {
            kind,
            device_id: record.device_id().to_string(),
            target: kind.target(record).to_string(),
            output,
            attempts,
            snapshot,
            finished_at: SystemTime::now(),
        })
    }

    /// Rescans with backoff until the expected state is observed.
    async fn verify(&self, kind: MutationKind, record: &PartitionRecord) -> Result<(Arc<Snapshot>, u32)> {
        let expected = kind.expected_state();
        let delays = self.inner.config.verify_delays(kind.grace(&self.inner.config));
        let mut attempts = 0;

        for delay in delays {
            tokio::time::sleep(delay).await;
            attempts += 1;

            let snapshot = self.scan_locked().await?;
            if expected.is_met(&snapshot, record) {
                return Ok((snapshot, attempts));
            }
            debug!(
                "{} not yet {} after scan {}",
                record.device_id(),
                expected.describe(),
                attempts
            );
        }

        Err(Error::Convergence {
            device_id: record.device_id().to_string(),
            expected: expected.describe().to_string(),
            attempts,
        })
    }

    /// Reveals the new mount point and raises the window on a blocking worker.
    async fn after_mount(&self, snapshot: &Snapshot, record: &PartitionRecord) {
        let Some(mount_point) = snapshot
            .find(record.device_id())
            .and_then(PartitionRecord::mount_point)
            .map(Path::to_path_buf)
        else {
            return;
        };

        let desktop = Arc::clone(&self.inner.desktop);
        let hooks = tokio::task::spawn_blocking(move || {
            if let Err(e) = desktop.reveal(&mount_point) {
                warn!("could not open {}: {}", mount_point.display(), e);
            }
            if let Err(e) = desktop.activate() {
                warn!("could not raise window: {}", e);
            }
        });
        if let Err(e) = hooks.await {
            warn!("desktop hooks failed: {}", e);
        }
    }

    fn report_mutation_error(&self, err: &Error) {
        let message = err.user_message();
        error!("disk operation failed: {}", err);
        self.set_last_error(Some(message.clone()));
        self.emit(ServiceEvent::MutationCompleted(Err(message)));
    }

    fn set_last_error(&self, message: Option<String>) {
        *self
            .inner
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message;
    }

    fn emit(&self, event: ServiceEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
