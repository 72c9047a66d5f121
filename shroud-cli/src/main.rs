//! Shroud - asset protection for packaged desktop applications
//!
//! Build-time entry point: repackage an application archive with selective
//! encryption, bake its digest into freshly compiled startup artifacts, and
//! inspect the results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shroud_core::anchor::{self, EmbedConfig};
use shroud_core::crypto::{self, ContentKey};
use shroud_core::guard;
use shroud_core::pipeline::{self, PipelineConfig};

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "shroud", about = "Asset protection for packaged desktop applications")]
struct Cli {
    /// Log verbosity (overridden by RUST_LOG when set)
    #[arg(long, global = true, value_enum, default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transform a packaged archive and bake its digest into fresh startup
    /// artifacts
    Protect {
        /// Packaged application archive, transformed in place
        archive: PathBuf,

        /// Distribution directory receiving the startup artifacts
        #[arg(long)]
        dist_dir: PathBuf,

        /// Pipeline configuration file (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Snapshot compiler binary; discovered when omitted
        #[arg(long)]
        compiler: Option<PathBuf>,

        /// Write a JSON build report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the SHA-256 digest of an archive
    Digest {
        archive: PathBuf,

        /// Also print the sealed (anchor) form
        #[arg(long)]
        sealed: bool,
    },

    /// Recompute an archive's sealed digest and compare it to an anchor
    Verify {
        archive: PathBuf,

        /// Anchor hex to compare against; the value embedded at build time
        /// when omitted
        #[arg(long)]
        anchor: Option<String>,
    },

    /// Generate a fresh content key as Rust source
    Genkey,
}

fn initialize_tracing(log_level: &LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    initialize_tracing(&cli.log_level);

    match cli.command {
        Command::Protect {
            archive,
            dist_dir,
            config,
            compiler,
            report,
        } => protect_command(archive, dist_dir, config, compiler, report).await,
        Command::Digest { archive, sealed } => digest_command(archive, sealed),
        Command::Verify { archive, anchor } => verify_command(archive, anchor),
        Command::Genkey => {
            println!("{}", crypto::generate_key_source());
            Ok(())
        }
    }
}

async fn protect_command(
    archive: PathBuf,
    dist_dir: PathBuf,
    config: Option<PathBuf>,
    compiler: Option<PathBuf>,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let pipeline_config = match config {
        Some(path) => PipelineConfig::load(&path)?,
        None => PipelineConfig::default(),
    };

    let key = ContentKey::embedded();

    info!("Running archive transform over {}", archive.display());
    let report = pipeline::run(&archive, &pipeline_config, &key)?;

    let mut embed_config = EmbedConfig::new(dist_dir);
    embed_config.compiler_binary = compiler;

    info!("Embedding anchor into startup artifacts");
    anchor::embed(&embed_config, &key, &report.digest).await?;

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)
            .context("Failed to serialize build report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write build report: {}", path.display()))?;
    }

    println!(
        "protected {} files ({} encrypted) in {:.2}s",
        report.files_total, report.files_protected, report.duration_secs
    );
    println!("digest {}", report.digest_hex);
    Ok(())
}

fn digest_command(archive: PathBuf, sealed: bool) -> Result<()> {
    let digest = crypto::digest_file(&archive)?;
    println!("{}", hex::encode(digest));

    if sealed {
        let key = ContentKey::embedded();
        println!("{}", crypto::seal_digest(&key, &digest)?);
    }
    Ok(())
}

fn verify_command(archive: PathBuf, anchor: Option<String>) -> Result<()> {
    let anchor = match anchor {
        Some(value) => value,
        None => guard::VerificationContext::from_embedded()
            .anchor()
            .context("No anchor embedded in this build; pass --anchor")?
            .to_string(),
    };

    let key = ContentKey::embedded();
    let digest = crypto::digest_file(&archive)?;
    let sealed = crypto::seal_digest(&key, &digest)?;

    if sealed == anchor {
        println!("OK {}", archive.display());
        Ok(())
    } else {
        anyhow::bail!(
            "Digest verification failed!\nExpected: {}\nActual: {}",
            anchor,
            sealed
        );
    }
}
