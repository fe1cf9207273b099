//! EFI Mount CLI - Command line interface for EFI partition operations.
//!
//! Lists the EFI system partitions of the host and mounts, unmounts or
//! ejects them through an elevation prompt.

mod output;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use efi_mount_core::{
    BusyPolicy, DesktopHooks, MutationOutcome, NoDesktop, PartitionRecord, PartitionService,
    PrivilegeEscalation, Result, ServiceConfig, SystemDesktop, SystemRunner,
};
use log::{debug, warn};
use snafu::OptionExt;

/// EFI Mount CLI tool.
#[derive(Parser)]
#[command(name = "efi-mount")]
#[command(about = "List, mount and eject EFI system partitions", long_about = None)]
struct Cli {
    /// How to obtain administrator rights for mount, unmount and eject.
    #[arg(long, value_enum, env = "EFI_MOUNT_ELEVATION", default_value_t = Elevation::Auto)]
    elevation: Elevation,

    /// Seconds allowed for the elevation prompt and the command it runs.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// What to do when another operation is already running.
    #[arg(long, value_enum, default_value_t = Busy::Queue)]
    busy_policy: Busy,

    /// Do not open the partition in the file browser after mounting.
    #[arg(long)]
    no_open: bool,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List EFI partitions.
    List,
    /// Show the partition the firmware booted from.
    Boot,
    /// Mount a partition.
    Mount { device_id: String },
    /// Unmount a partition.
    Unmount { device_id: String },
    /// Mount the partition if unmounted, unmount it otherwise.
    Toggle { device_id: String },
    /// Eject the external disk holding a partition.
    Eject { device_id: String },
    /// Wait for the disk list to settle, then list EFI partitions.
    Rescan,
    /// Print service events while rescanning periodically.
    Watch {
        /// Seconds between rescans.
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Elevation {
    /// The host's graphical prompt (osascript on macOS, pkexec elsewhere).
    Auto,
    None,
    Osascript,
    Pkexec,
    Sudo,
}

impl From<Elevation> for PrivilegeEscalation {
    fn from(value: Elevation) -> Self {
        match value {
            Elevation::Auto => PrivilegeEscalation::platform_default(),
            Elevation::None => PrivilegeEscalation::None,
            Elevation::Osascript => PrivilegeEscalation::Osascript,
            Elevation::Pkexec => PrivilegeEscalation::Pkexec,
            Elevation::Sudo => PrivilegeEscalation::Sudo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Busy {
    Queue,
    Reject,
}

impl From<Busy> for BusyPolicy {
    fn from(value: Busy) -> Self {
        match value {
            Busy::Queue => BusyPolicy::Queue,
            Busy::Reject => BusyPolicy::Reject,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

fn build_service(cli: &Cli) -> PartitionService {
    let runner = Arc::new(SystemRunner);
    let escalation = PrivilegeEscalation::from(cli.elevation);
    debug!("using {:?} for elevation", escalation);

    let desktop: Arc<dyn DesktopHooks> = if cli.no_open {
        Arc::new(NoDesktop)
    } else {
        Arc::new(SystemDesktop::new(runner.clone()))
    };

    let config = ServiceConfig::default()
        .with_elevation_timeout(Duration::from_secs(cli.timeout))
        .with_busy_policy(cli.busy_policy.into());

    PartitionService::new(runner, Arc::new(escalation), desktop, config)
}

async fn run(cli: Cli) -> Result<()> {
    let service = build_service(&cli);

    match &cli.command {
        Commands::List => {
            let snapshot = service.scan().await?;
            if cli.json {
                print_json(&*snapshot);
            } else {
                print!("{}", output::render_snapshot(&snapshot));
            }
        }
        Commands::Boot => {
            let snapshot = service.scan().await?;
            if cli.json {
                print_json(&snapshot.boot_efi);
            } else {
                println!("{}", output::render_boot(&snapshot));
            }
        }
        Commands::Mount { device_id } => {
            let record = find(&service, device_id).await?;
            let outcome = run_mutation(&service, service.mount(&record)).await?;
            print_outcome(&outcome, cli.json);
        }
        Commands::Unmount { device_id } => {
            let record = find(&service, device_id).await?;
            let outcome = run_mutation(&service, service.unmount(&record)).await?;
            print_outcome(&outcome, cli.json);
        }
        Commands::Toggle { device_id } => {
            let record = find(&service, device_id).await?;
            let outcome = run_mutation(&service, service.toggle_mount(&record)).await?;
            print_outcome(&outcome, cli.json);
        }
        Commands::Eject { device_id } => {
            let record = find(&service, device_id).await?;
            let outcome = run_mutation(&service, service.eject(&record)).await?;
            print_outcome(&outcome, cli.json);
        }
        Commands::Rescan => {
            let snapshot = service.force_rescan().await?;
            if cli.json {
                print_json(&*snapshot);
            } else {
                print!("{}", output::render_snapshot(&snapshot));
            }
        }
        Commands::Watch { interval } => watch(&service, Duration::from_secs(*interval), cli.json).await,
    }

    Ok(())
}

/// Scans and looks up `device_id` in the fresh snapshot.
async fn find(service: &PartitionService, device_id: &str) -> Result<PartitionRecord> {
    let snapshot = service.scan().await?;
    snapshot
        .find(device_id)
        .cloned()
        .with_whatever_context(|| format!("no EFI partition named {device_id}"))
}

/// Exit code after a second Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// How an interruptible mutation ended.
enum Interrupt {
    Finished(Result<MutationOutcome>),
    /// Interrupted again while the cancelled mutation was winding down.
    ForceQuit,
}

/// Runs a mutation. The first interrupt cancels it and waits for it to wind
/// down; a second one gives up on it.
async fn interruptible<F, I, S>(service: &PartitionService, mutation: F, mut interrupt: I) -> Interrupt
where
    F: Future<Output = Result<MutationOutcome>>,
    I: FnMut() -> S,
    S: Future<Output = ()>,
{
    tokio::pin!(mutation);
    tokio::select! {
        result = &mut mutation => return Interrupt::Finished(result),
        () = interrupt() => {
            eprintln!("Cancelling, press Ctrl-C again to quit.");
            service.cancel();
        }
    }

    tokio::select! {
        result = &mut mutation => Interrupt::Finished(result),
        () = interrupt() => Interrupt::ForceQuit,
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_mutation<F>(service: &PartitionService, mutation: F) -> Result<MutationOutcome>
where
    F: Future<Output = Result<MutationOutcome>>,
{
    match interruptible(service, mutation, ctrl_c).await {
        Interrupt::Finished(result) => result,
        Interrupt::ForceQuit => std::process::exit(EXIT_INTERRUPTED),
    }
}

async fn watch(service: &PartitionService, interval: Duration, json: bool) {
    let mut events = service.subscribe();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // failures are reported through the event stream
                let _ = service.scan().await;
            }
            event = events.recv() => match event {
                Ok(event) if json => print_json(&event),
                Ok(event) => println!("{}", output::render_event(&event)),
                Err(e) => warn!("event stream: {}", e),
            },
            () = ctrl_c() => break,
        }
    }
}

fn print_outcome(outcome: &MutationOutcome, json: bool) {
    if json {
        print_json(outcome);
    } else {
        println!("{}", output::render_outcome(outcome));
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => warn!("failed to serialize output: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use efi_mount_core::Error;

    use super::*;

    fn service() -> PartitionService {
        PartitionService::new(
            Arc::new(SystemRunner),
            Arc::new(PrivilegeEscalation::None),
            Arc::new(NoDesktop),
            ServiceConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_uninterrupted_mutation_finishes() {
        let svc = service();
        let ended = interruptible(&svc, async { Err(Error::Busy) }, std::future::pending::<()>).await;
        assert!(matches!(ended, Interrupt::Finished(Err(Error::Busy))));
    }

    #[tokio::test]
    async fn test_first_interrupt_waits_for_cancelled_mutation() {
        let svc = service();
        let calls = AtomicUsize::new(0);
        let interrupt = || {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if !first {
                    std::future::pending::<()>().await;
                }
            }
        };
        let mutation = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(Error::Cancelled {
                command: "diskutil mount disk0s1".to_string(),
            })
        };

        let ended = interruptible(&svc, mutation, interrupt).await;
        assert!(matches!(ended, Interrupt::Finished(Err(Error::Cancelled { .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_interrupt_forces_quit() {
        let svc = service();
        let ended = interruptible(&svc, std::future::pending(), || async {}).await;
        assert!(matches!(ended, Interrupt::ForceQuit));
    }
}
