//! ipswx - IPSW firmware archive inspector and filesystem extractor.
//!
//! Inspect build manifests, extract device root filesystems, and
//! assemble Xcode-style device support directories from IPSW bundles.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ipswx::dsc::{SharedCacheSplitter, SplitterTool};
use ipswx::util::format_size;
use ipswx::{
    create_device_support, extract_filesystem, CancelToken, ExtractOptions, Ipsw, Verification,
};

/// Conventional device support location, relative to the home directory.
const DEVICE_SUPPORT_SUBPATH: &str = "Library/Developer/Xcode/iOS DeviceSupport";

/// An IPSW firmware archive inspector and filesystem extractor.
#[derive(Parser, Debug)]
#[command(name = "ipswx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the archive's manifest and restore metadata
    Info {
        /// Path to the .ipsw archive
        ipsw: PathBuf,

        /// Emit the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Extract a build identity's filesystem tree
    Extract {
        /// Path to the .ipsw archive
        ipsw: PathBuf,

        /// Output directory for the extracted tree
        #[arg(short, long)]
        output: PathBuf,

        /// Device class selector (e.g. "iPhone11,8")
        #[arg(short, long)]
        device: Option<String>,

        /// Board config selector (e.g. "n841ap")
        #[arg(short, long)]
        board: Option<String>,

        /// Skip stored-payload digest verification (dangerous)
        #[arg(long)]
        no_verify: bool,

        /// Number of parallel workers (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Split extracted shared caches with the external splitter tool
        #[arg(long)]
        split: bool,

        /// Splitter program invoked for --split
        #[arg(long, default_value = "ipsw")]
        splitter_path: PathBuf,
    },

    /// Extract and assemble the device support directory
    DeviceSupport {
        /// Path to the .ipsw archive
        ipsw: PathBuf,

        /// Device support root
        /// (default: ~/Library/Developer/Xcode/iOS DeviceSupport)
        #[arg(short, long)]
        output_root: Option<PathBuf>,

        /// Device class selector (e.g. "iPhone11,8")
        #[arg(short, long)]
        device: Option<String>,

        /// Board config selector (e.g. "n841ap")
        #[arg(short, long)]
        board: Option<String>,

        /// Skip stored-payload digest verification (dangerous)
        #[arg(long)]
        no_verify: bool,

        /// Number of parallel workers (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Split extracted shared caches with the external splitter tool
        #[arg(long)]
        split: bool,

        /// Splitter program invoked for --split
        #[arg(long, default_value = "ipsw")]
        splitter_path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Err(e) = run(cli) {
        error!("{e:#}");
        std::process::exit(exit_code_for(&e));
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Info { ipsw, json } => cmd_info(ipsw, json),
        Commands::Extract {
            ipsw,
            output,
            device,
            board,
            no_verify,
            jobs,
            split,
            splitter_path,
        } => cmd_extract(
            ipsw,
            output,
            device,
            board,
            no_verify,
            jobs,
            split,
            splitter_path,
        ),
        Commands::DeviceSupport {
            ipsw,
            output_root,
            device,
            board,
            no_verify,
            jobs,
            split,
            splitter_path,
        } => cmd_device_support(
            ipsw,
            output_root,
            device,
            board,
            no_verify,
            jobs,
            split,
            splitter_path,
        ),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Maps a failure to its stable per-category exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ipswx::Error>()
        .map_or(1, ipswx::Error::exit_code)
}

/// Wires SIGINT to the cooperative cancellation token.
fn install_cancel_handler() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    let result = ctrlc::set_handler(move || {
        eprintln!("cancelling, partial output stays in place...");
        handler_token.cancel();
    });
    if let Err(e) = result {
        warn!("failed to install ctrl-c handler: {e}");
    }
    token
}

fn configure_jobs(jobs: Option<usize>) {
    if let Some(n) = jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }
}

#[allow(clippy::too_many_arguments)]
fn build_options(
    device: Option<String>,
    board: Option<String>,
    no_verify: bool,
    split: bool,
    splitter_path: PathBuf,
    cancel: CancelToken,
) -> ExtractOptions {
    let splitter = split.then(|| {
        Box::new(SplitterTool::new(splitter_path)) as Box<dyn SharedCacheSplitter + Send + Sync>
    });
    ExtractOptions {
        device_class: device,
        board_config: board,
        verify: !no_verify,
        cancel,
        splitter,
    }
}

fn spinner(message: String) -> ProgressBar {
    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    progress.enable_steady_tick(Duration::from_millis(120));
    progress.set_message(message);
    progress
}

fn cmd_info(path: PathBuf, json: bool) -> Result<()> {
    let ipsw =
        Ipsw::open(&path).with_context(|| format!("failed to inspect {}", path.display()))?;
    let summary = ipsw.summary();
    let development_files = ipsw.archive.development_entries();

    if json {
        let mut value = serde_json::to_value(&summary)?;
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "development_files".to_string(),
                serde_json::to_value(&development_files)?,
            );
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print!("{summary}");
    if !development_files.is_empty() {
        println!("DevelopmentFiles:");
        for file in development_files {
            println!("- {file}");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_extract(
    path: PathBuf,
    output: PathBuf,
    device: Option<String>,
    board: Option<String>,
    no_verify: bool,
    jobs: Option<usize>,
    split: bool,
    splitter_path: PathBuf,
) -> Result<()> {
    let start = Instant::now();
    configure_jobs(jobs);

    let cancel = install_cancel_handler();
    let options = build_options(device, board, no_verify, split, splitter_path, cancel);

    let mut ipsw =
        Ipsw::open(&path).with_context(|| format!("failed to open {}", path.display()))?;

    let progress = spinner(format!("extracting into {}", output.display()));
    let report = extract_filesystem(&mut ipsw, &output, &options);
    progress.finish_and_clear();
    let report = report?;

    if report.verification == Verification::Unverified {
        warn!("extracted tree is unverified (no digest declared, or verification disabled)");
    }
    for cache in &report.unsplit_caches {
        info!("shared cache left unmerged: {}", cache.display());
    }
    info!(
        "extracted {} files ({}) in {:.2}s",
        report.stats.files,
        format_size(report.stats.bytes),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_device_support(
    path: PathBuf,
    output_root: Option<PathBuf>,
    device: Option<String>,
    board: Option<String>,
    no_verify: bool,
    jobs: Option<usize>,
    split: bool,
    splitter_path: PathBuf,
) -> Result<()> {
    let start = Instant::now();
    configure_jobs(jobs);

    let root = match output_root.or_else(default_device_support_root) {
        Some(root) => root,
        None => bail!("no home directory found; pass --output-root"),
    };

    let cancel = install_cancel_handler();
    let options = build_options(device, board, no_verify, split, splitter_path, cancel);

    let mut ipsw =
        Ipsw::open(&path).with_context(|| format!("failed to open {}", path.display()))?;

    let progress = spinner(format!("building device support under {}", root.display()));
    let target = create_device_support(&mut ipsw, &root, &options);
    progress.finish_and_clear();
    let target = target?;

    info!(
        "device support ready in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    println!("{}", target.display());
    Ok(())
}

fn default_device_support_root() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(DEVICE_SUPPORT_SUBPATH))
}
