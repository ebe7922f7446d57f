use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pktmask::config::PipelineConfig;
use pktmask::directory::DirectoryDriver;
use pktmask::events::tracing_progress_callback;
use pktmask::executor::CancellationToken;

#[derive(Debug, Clone, Parser)]
#[command(author, version)]
#[command(about = "Sanitize packet captures for sharing", long_about = None)]
struct Args {
    /// Directory of PCAP/PCAPNG files to process.
    #[arg(short, long)]
    input: PathBuf,

    /// Directory sanitized files are written into, mirroring `input`'s layout.
    #[arg(short, long)]
    output: PathBuf,

    /// Optional YAML config file; the flags below override its values.
    #[arg(short, long = "config")]
    config_path: Option<PathBuf>,

    #[arg(long)]
    dedup: Option<bool>,

    #[arg(long)]
    anonymize: Option<bool>,

    #[arg(long)]
    mask: Option<bool>,

    #[arg(short, long)]
    verbose: bool,

    /// Directory-level parallelism (spec: "optional parallel across files
    /// within a directory").
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,
}

fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("pktmask=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt::fmt()
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .with_env_filter(filter)
        .init();

    info!("Welcome to pktmask");

    let mut config = match &args.config_path {
        Some(path) => match PipelineConfig::load_from_file(path) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                error!("Failed to load config from {}: {}", path.display(), e);
                exit(1);
            }
        },
        None => PipelineConfig::default(),
    };

    if let Some(enabled) = args.dedup {
        config.dedup.enabled = enabled;
    }
    if let Some(enabled) = args.anonymize {
        config.anonymize.enabled = enabled;
    }
    if let Some(enabled) = args.mask {
        config.mask.enabled = enabled;
    }

    if !args.input.is_dir() {
        error!("Input path {} is not a directory", args.input.display());
        exit(1);
    }

    if let Err(e) = std::fs::create_dir_all(&args.output) {
        error!(
            "Failed to create output directory {}: {}",
            args.output.display(),
            e
        );
        exit(1);
    }

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        warn!("Cancellation requested, finishing in-flight files");
        ctrlc_cancel.cancel();
    }) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }

    let driver = DirectoryDriver::new(config, args.jobs);
    let progress_cb = tracing_progress_callback();

    let aggregate = driver.run(&args.input, &args.output, &progress_cb, &cancel);

    info!(
        files_ok = aggregate.files_ok,
        files_failed = aggregate.files_failed,
        "Finished"
    );

    if aggregate.files_failed > 0 {
        exit(1);
    }
}
