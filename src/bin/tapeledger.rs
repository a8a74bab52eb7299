//! tapeledger
//!
//! Operator CLI over the archive ledger and file-backed tape drives

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use crossbeam::channel::{self, Receiver};
use std::path::PathBuf;
use tapeledger_rs::{
    AttemptOutcome, CoordinatorHandle, FileStatus, NewTape, TapeArchive, TapeStatus, TapeUpdate,
    WorkerEvent,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tapeledger")]
#[command(about = "Archive staged data files to tape and verify them")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "tapeledger.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the ledger if it does not exist
    Init,

    /// Register a blank tape
    RegisterTape {
        barcode: String,
        /// Capacity in bytes
        capacity: u64,
        #[arg(long = "type")]
        tape_type: Option<String>,
        /// Purchase date (YYYY-MM-DD)
        #[arg(long)]
        purchased: Option<NaiveDate>,
    },

    /// Change a tape's type, capacity, or purchase date
    UpdateTape {
        barcode: String,
        #[arg(long)]
        capacity: Option<u64>,
        #[arg(long = "type")]
        tape_type: Option<String>,
        #[arg(long)]
        purchased: Option<NaiveDate>,
    },

    /// Withdraw a tape from further writes
    RetireTape { barcode: String },

    /// Hash and stage files for archival
    Stage {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Observation id (single file only)
        #[arg(long)]
        obsid: Option<i64>,
        /// Observation start as a Julian Date (single file only)
        #[arg(long)]
        jd_start: Option<f64>,
    },

    /// Assign pending files to tapes
    Allocate,

    /// Run one worker per configured drive
    Run {
        /// Exit once nothing is left to claim or allocate
        #[arg(long)]
        until_idle: bool,
    },

    /// Resolve attempts that exceeded the attempt budget
    Recover {
        /// Also fail in-flight attempts of this host's drives (no coordinator may be running)
        #[arg(long)]
        host: bool,
    },

    /// Give a permanently failed file a fresh retry budget
    Requeue { name: String },

    /// Summarize the ledger
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let archive = TapeArchive::from_config_file(&args.config)
        .with_context(|| format!("opening archive from {}", args.config.display()))?;

    match args.command {
        Command::Init => {
            info!("Ledger ready at {}", archive.config().ledger.path.display());
        }
        Command::RegisterTape {
            barcode,
            capacity,
            tape_type,
            purchased,
        } => {
            let mut tape = NewTape::new(barcode, capacity);
            tape.tape_type = tape_type;
            tape.purchase_date = purchased;
            let tape = archive.register_tape(tape)?;
            println!("registered {} ({} bytes)", tape.barcode, tape.capacity);
        }
        Command::UpdateTape {
            barcode,
            capacity,
            tape_type,
            purchased,
        } => {
            let tape = archive.ledger().update_tape(
                &barcode,
                TapeUpdate {
                    tape_type,
                    capacity,
                    purchase_date: purchased,
                },
            )?;
            println!(
                "{} is {} ({} of {} bytes used)",
                tape.barcode, tape.status, tape.bytes_used, tape.capacity
            );
        }
        Command::RetireTape { barcode } => {
            let tape = archive.ledger().retire_tape(&barcode)?;
            println!("{} is {}", tape.barcode, tape.status);
        }
        Command::Stage {
            paths,
            obsid,
            jd_start,
        } => {
            if (obsid.is_some() || jd_start.is_some()) && paths.len() != 1 {
                bail!("--obsid and --jd-start apply to a single file");
            }
            for path in &paths {
                let file = match (obsid, jd_start) {
                    (Some(obsid), Some(jd)) => archive.stage_observation(path, obsid, jd)?,
                    (None, None) => archive.stage_path(path)?,
                    _ => bail!("--obsid and --jd-start must be given together"),
                };
                println!("staged {} ({} bytes)", file.name, file.size);
            }
        }
        Command::Allocate => {
            let report = archive.allocate()?;
            println!(
                "{} assigned, {} tape(s) registered, {} deferred",
                report.assigned.len(),
                report.registered.len(),
                report.deferred.len()
            );
            for deferred in &report.deferred {
                println!("  {}", deferred.to_error());
            }
        }
        Command::Run { until_idle } => run(&archive, until_idle)?,
        Command::Recover { host } => {
            let mut failed = 0;
            if host {
                failed += archive.recover_host()?.failed.len();
            }
            failed += archive.recover()?.failed.len();
            println!("{} attempt(s) recovered", failed);
        }
        Command::Requeue { name } => {
            let file = archive.ledger().requeue_file(&name)?;
            println!("{} is {}", file.name, file.status);
        }
        Command::Status { json } => status(&archive, json)?,
    }
    Ok(())
}

fn run(archive: &TapeArchive, until_idle: bool) -> anyhow::Result<()> {
    let drives = archive.file_drives()?;
    if until_idle {
        let summary = archive.run_until_idle(drives)?;
        println!(
            "{} verified, {} failed ({} permanently), {} lost",
            summary.verified, summary.failed, summary.permanently_failed, summary.lost
        );
        return Ok(());
    }

    let (signal_tx, signal_rx) = channel::unbounded();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .context("installing the interrupt handler")?;

    let handle = archive.coordinator(drives)?.start()?;
    supervise(&handle, &signal_rx);
    let summary = handle.join()?;
    info!("Coordinator stopped: {:?}", summary);
    Ok(())
}

/// What the next interrupt asks of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Drain,
    Cancel,
}

/// Counts interrupts: the first drains, any later one cancels
#[derive(Debug, Default)]
struct Interrupts {
    seen: usize,
}

impl Interrupts {
    fn next(&mut self) -> Shutdown {
        self.seen += 1;
        if self.seen == 1 {
            Shutdown::Drain
        } else {
            Shutdown::Cancel
        }
    }
}

/// Log worker events until every worker has stopped
fn supervise(handle: &CoordinatorHandle, signals: &Receiver<()>) {
    let workers = handle.worker_ids().len();
    let mut stopped = 0;
    let mut interrupts = Interrupts::default();
    loop {
        channel::select! {
            recv(signals) -> _ => match interrupts.next() {
                Shutdown::Drain => {
                    warn!("Interrupted; finishing in-flight attempts, interrupt again to cancel them");
                    handle.drain();
                }
                Shutdown::Cancel => {
                    warn!("Interrupted again; cancelling in-flight attempts");
                    handle.cancel();
                }
            },
            recv(handle.events()) -> event => match event {
                Ok(WorkerEvent::Finished {
                    worker,
                    attempt,
                    outcome: AttemptOutcome::Failed { reason, .. },
                }) => warn!("{}: attempt #{} failed ({})", worker, attempt, reason),
                Ok(WorkerEvent::Error {
                    worker, message, ..
                }) => warn!("{}: {}", worker, message),
                Ok(WorkerEvent::Stopped { .. }) => {
                    stopped += 1;
                    if stopped == workers {
                        return;
                    }
                }
                Ok(_) => {}
                Err(_) => return,
            },
        }
    }
}

fn status(archive: &TapeArchive, json: bool) -> anyhow::Result<()> {
    let stats = archive.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("files:");
    for status in FileStatus::ALL {
        println!("  {:<20} {}", status.as_str(), stats.files_with(status));
    }
    println!("  archived bytes       {}", stats.archived_bytes);
    println!("tapes:");
    for tape in archive.tapes()? {
        let marker = if tape.status == TapeStatus::Available { "" } else { " *" };
        println!(
            "  {:<12} {:<10} {:>16} / {:<16} mounts {}{}",
            tape.barcode,
            tape.status.as_str(),
            tape.bytes_used,
            tape.capacity,
            tape.mount_count,
            marker
        );
    }
    for file in archive.files(FileStatus::PermanentlyFailed)? {
        let reason = file.last_failure.map(|r| r.as_str()).unwrap_or("unknown");
        println!("permanently failed: {} (last failure {})", file.name, reason);
    }
    Ok(())
}
