//! unbox-cli - Command-line interface for the unbox extraction engine
//!
//! Extracts, detects and inspects archives under the configured security
//! policy.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use unbox_core::{
    ArchiveFormat, Config, ConfigStore, ExtractOptions, Extractor, FileConfigStore,
    FormatSniffer, MetricsCollector, SharedConfig,
};

mod progress;

/// unbox - extract archives safely
///
/// Detects the archive format from its content and extracts it under
/// configurable size, count, path and extension checks.
#[derive(Parser)]
#[command(name = "unbox")]
#[command(author, version, about = "Policy-enforcing archive extractor", long_about = None)]
struct Cli {
    /// Enable verbose output for debugging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show progress bar during operations
    #[arg(long, global = true)]
    progress: bool,

    /// Print a metrics snapshot as JSON when done
    #[arg(long, global = true)]
    metrics: bool,

    /// Configuration file to use instead of the default location
    #[arg(long, global = true, env = "UNBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract files from an archive
    Extract {
        /// Archive file to extract, `-` for stdin
        archive: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Password for encrypted archives
        #[arg(short, long, env = "UNBOX_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Extract entries in parallel on a worker pool
        #[arg(long)]
        concurrent: bool,

        /// Skip detection and treat the input as this format
        #[arg(short, long)]
        format: Option<String>,
    },

    /// Print the detected format of a file
    Detect {
        /// File to classify, `-` for stdin
        file: PathBuf,
    },

    /// List archive contents without extracting
    Inspect {
        /// Archive file to inspect, `-` for stdin
        archive: PathBuf,

        /// Password for encrypted archives
        #[arg(short, long, env = "UNBOX_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Output format as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show configuration
    Config {
        /// Show current configuration
        #[arg(long, conflicts_with = "path")]
        show: bool,

        /// Show configuration file path
        #[arg(long, conflicts_with = "show")]
        path: bool,
    },
}

/// Some entries of a concurrent extraction were dropped
#[derive(Debug)]
struct PartialFailure {
    failed: usize,
    total: usize,
}

impl std::fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} of {} entries failed", self.failed, self.total)
    }
}

impl std::error::Error for PartialFailure {}

fn setup_logging(verbose: bool, quiet: bool) {
    if quiet {
        return;
    }

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let result = run();

    // process::exit skips destructors
    let removed = unbox_core::temp::cleanup_registered();
    if removed > 0 {
        warn!(removed, "Removed leftover temporary files");
    }

    match result {
        Ok(_) => process::exit(0),
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("unbox: {:#}", e);

            let exit_code = map_error_to_exit_code(&e);
            process::exit(exit_code);
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    let metrics = cli.metrics.then(|| Arc::new(MetricsCollector::new()));

    match cli.command {
        Commands::Extract {
            archive,
            output,
            password,
            concurrent,
            format,
        } => {
            let store = open_store(cli.config.as_deref())?;
            let mut extractor = Extractor::new(store, concurrent);
            if let Some(metrics) = &metrics {
                extractor = extractor.with_metrics(metrics.clone());
            }

            let output_dir = output.unwrap_or_else(|| PathBuf::from("."));
            info!("Extracting {:?} into {:?}", archive, output_dir);

            let mut options = ExtractOptions::new()
                .output_dir(&output_dir)
                .retain_bytes(false);
            if let Some(password) = password {
                options = options.password(password);
            }
            if let Some(format) = format {
                let format: ArchiveFormat = format
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid format name: {}", format))?;
                options = options.format(format);
            }
            if cli.progress && !cli.quiet {
                options = options.progress(Arc::new(progress::BarReporter::new()));
            }

            let result = extractor.extract_reader(open_input(&archive)?, options);
            extractor.close()?;
            let output = result?;

            info!(
                "Extracted {} files ({} bytes) from {} archive",
                output.files.len(),
                output.total_bytes(),
                output.format
            );
            for skipped in &output.skipped {
                warn!("Skipped link or special entry: {}", skipped);
            }
            for failure in &output.failures {
                error!("Failed to extract {}: {}", failure.path, failure.message);
            }

            print_metrics(metrics.as_deref())?;

            if !output.is_complete() {
                return Err(PartialFailure {
                    failed: output.failures.len(),
                    total: output.failures.len() + output.files.len(),
                }
                .into());
            }
        }

        Commands::Detect { file } => {
            let (format, _) = FormatSniffer::new()
                .sniff_reader(open_input(&file)?)
                .with_context(|| format!("failed to read {:?}", file))?;
            println!("{}", format);
        }

        Commands::Inspect {
            archive,
            password,
            json,
        } => {
            let store = open_store(cli.config.as_deref())?;
            let mut extractor = Extractor::new(store, false);
            if let Some(metrics) = &metrics {
                extractor = extractor.with_metrics(metrics.clone());
            }

            let mut input = Vec::new();
            open_input(&archive)?
                .read_to_end(&mut input)
                .with_context(|| format!("failed to read {:?}", archive))?;
            let (format, entries) = extractor.inspect(&input, password.as_deref())?;

            if json {
                let document = serde_json::json!({
                    "format": format.to_string(),
                    "entries": entries,
                });
                println!("{}", serde_json::to_string_pretty(&document)?);
            } else {
                println!("Format: {}", format);
                println!("{:>12}  {:<9}  Path", "Size", "Kind");
                for entry in &entries {
                    println!("{:>12}  {:<9}  {}", entry.size, format!("{:?}", entry.kind), entry.path);
                }
                println!("{} entries", entries.len());
            }

            print_metrics(metrics.as_deref())?;
        }

        Commands::Config { show: _, path } => {
            let config_path = match cli.config {
                Some(path) => path,
                None => Config::config_path()?,
            };

            if path {
                println!("{}", config_path.display());
            } else {
                // --show is also the default action
                let store = FileConfigStore::open(&config_path)?;
                print!("{}", store.get_config().to_toml()?);
            }
        }
    }

    Ok(())
}

/// Configuration store for this run, falling back to defaults when the
/// default location is unusable
fn open_store(path: Option<&Path>) -> Result<Arc<dyn ConfigStore>> {
    if let Some(path) = path {
        let store = FileConfigStore::open(path)
            .with_context(|| format!("failed to load configuration from {:?}", path))?;
        return Ok(Arc::new(store));
    }

    match FileConfigStore::open_default() {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            warn!("Using default configuration: {}", e);
            Ok(Arc::new(SharedConfig::default()))
        }
    }
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    Ok(Box::new(BufReader::new(file)))
}

fn print_metrics(metrics: Option<&MetricsCollector>) -> Result<()> {
    if let Some(metrics) = metrics {
        println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }
    Ok(())
}

fn map_error_to_exit_code(err: &anyhow::Error) -> i32 {
    if let Some(unbox_err) = err.downcast_ref::<unbox_core::Error>() {
        match unbox_err {
            unbox_core::Error::Io(_) => 2,
            unbox_core::Error::InvalidFormat(_) => 3,
            unbox_core::Error::UnsupportedFormat(_) => 3,
            unbox_core::Error::SecurityViolation(_) => 5,
            unbox_core::Error::SizeLimitExceeded { .. } => 5,
            unbox_core::Error::CountLimitExceeded { .. } => 5,
            unbox_core::Error::PasswordRequired => 6,
            unbox_core::Error::PasswordIncorrect => 6,
            unbox_core::Error::Timeout { .. } => 4,
            unbox_core::Error::Interrupted(_) => 4,
            unbox_core::Error::Config(_) => 1,
            unbox_core::Error::Unknown { .. } => 1,
        }
    } else if err.is::<PartialFailure>() {
        4
    } else if err.is::<std::io::Error>() {
        2
    } else if err.to_string().contains("invalid") {
        3
    } else {
        1
    }
}
