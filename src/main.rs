use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use verdex::core::types::WorkerAssignment;
use verdex::core::{load_assignment, load_settings};
use verdex::storage::S3Store;
use verdex::worker::Worker;

fn print_usage() {
    eprintln!("verdex — resilient court-judgment PDF scraper");
    eprintln!();
    eprintln!("Usage: verdex --worker <ID> [--assignments <PATH>] [--config <PATH>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --worker <ID>         Worker id (selects the page range and isolates state)");
    eprintln!("  --assignments <PATH>  Page-range assignment file [default: assignments.json]");
    eprintln!("  --config <PATH>       Config file path (overrides VERDEX_CONFIG)");
    eprintln!("  -h, --help            Show this help");
}

struct CliArgs {
    worker_id: u32,
    assignments: PathBuf,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut worker_id: Option<u32> = None;
    let mut assignments = PathBuf::from("assignments.json");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--worker" | "-w" => {
                let value = args.next().ok_or("--worker requires a value")?;
                worker_id = Some(value.parse().map_err(|_| format!("invalid worker id: {value}"))?);
            }
            "--assignments" => {
                assignments = PathBuf::from(args.next().ok_or("--assignments requires a value")?);
            }
            "--config" => {
                let path = args.next().ok_or("--config requires a value")?;
                std::env::set_var("VERDEX_CONFIG", path);
            }
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(CliArgs {
        worker_id: worker_id.ok_or("--worker is required")?,
        assignments,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,verdex=info")),
        )
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    let settings = load_settings();

    let assignment = match load_assignment(&args.assignments, args.worker_id) {
        Ok(Some(a)) => a,
        Ok(None) => {
            warn!(
                worker = args.worker_id,
                "no assignment found, running unbounded from page 1"
            );
            WorkerAssignment {
                worker_id: args.worker_id,
                start_page: 1,
                end_page: None,
                description: "unassigned full range".to_string(),
            }
        }
        Err(e) => {
            error!("could not read assignment file: {e:#}");
            std::process::exit(1);
        }
    };

    let Some(bucket) = settings.storage.resolve_bucket() else {
        error!("no storage bucket configured (verdex.json storage.bucket or VERDEX_S3_BUCKET)");
        std::process::exit(1);
    };
    let store = Arc::new(S3Store::connect(bucket).await);

    // First Ctrl-C requests a graceful stop at the next row boundary; a
    // second one kills the process the hard way.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received, finishing current row");
                shutdown.store(true, Ordering::Relaxed);
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second interrupt, exiting immediately");
                std::process::exit(130);
            }
        });
    }

    let mut worker = match Worker::new(
        args.worker_id,
        &settings,
        assignment,
        store,
        shutdown.clone(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("worker setup failed: {e:#}");
            std::process::exit(1);
        }
    };

    match worker.run(&settings).await {
        Ok(()) => {
            info!("worker {} exited cleanly", args.worker_id);
        }
        Err(e) => {
            error!("worker {} failed: {e}", args.worker_id);
            std::process::exit(1);
        }
    }
}
