//! External snapshot compiler invocation
//!
//! Drives the engine's snapshot compiler as a subprocess with captured
//! output and an explicit timeout. A hang is a build failure, not an
//! indefinite wait.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Marker the compiler prints once it has accepted the script for embedding
pub const EMBED_MARKER: &str = "Loading script for embedding";

/// Artifacts the compiler must produce
pub const OUTPUT_FILES: [&str; 2] = ["snapshot_blob.bin", "v8_context_snapshot.bin"];

/// Environment variable overriding the compiler binary location
pub const COMPILER_PATH_ENV: &str = "SHROUD_MKSNAPSHOT_PATH";

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Compiler invocation settings
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Explicit compiler binary; discovered when unset
    pub binary: Option<PathBuf>,
    /// Directory the compiler writes its artifacts into
    pub output_dir: PathBuf,
    pub timeout: Duration,
}

impl CompilerConfig {
    pub fn new(output_dir: PathBuf) -> Self {
        CompilerConfig {
            binary: None,
            output_dir,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Captured result of one compiler run
#[derive(Debug)]
pub struct CompilerRun {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Find the snapshot compiler binary, checking the bundled location first
pub fn find_compiler_binary() -> PathBuf {
    let name = if cfg!(windows) {
        "mksnapshot.exe"
    } else {
        "mksnapshot"
    };

    // 1. Bundled alongside the shroud binary
    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(exe_dir) = current_exe.parent() {
            let bundled = exe_dir.join(name);
            if bundled.exists() {
                debug!("Using bundled snapshot compiler at: {:?}", bundled);
                return bundled;
            }
        }
    }

    // 2. Environment override
    if let Ok(env_path) = std::env::var(COMPILER_PATH_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            debug!("Using snapshot compiler from {}: {:?}", COMPILER_PATH_ENV, path);
            return path;
        }
    }

    // 3. System PATH
    debug!("Using snapshot compiler from system PATH");
    PathBuf::from(name)
}

/// Run the compiler over `input`, waiting at most `config.timeout`.
pub async fn run_compiler(config: &CompilerConfig, input: &Path) -> Result<CompilerRun> {
    let binary = config
        .binary
        .clone()
        .unwrap_or_else(find_compiler_binary);

    info!("Executing snapshot compiler: {:?}", binary);
    let mut command = tokio::process::Command::new(&binary);
    command
        .arg(input)
        .arg("--output_dir")
        .arg(&config.output_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    debug!("Compiler command: {:?}", command);

    let child = command.spawn().with_context(|| {
        format!("Failed to spawn snapshot compiler: {}. Is it installed?", binary.display())
    })?;

    let output = tokio::time::timeout(config.timeout, child.wait_with_output())
        .await
        .with_context(|| {
            format!(
                "Snapshot compiler timed out after {}s",
                config.timeout.as_secs()
            )
        })?
        .context("Failed to wait for snapshot compiler output")?;

    Ok(CompilerRun {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Check a compiler run for success: clean exit, no error stream output and
/// the embedding marker present.
pub fn check_run(run: &CompilerRun) -> Result<()> {
    if !run.stderr.trim().is_empty() {
        bail!("Snapshot compiler wrote to stderr: {}", run.stderr.trim());
    }
    if run.exit_code != Some(0) {
        bail!(
            "Snapshot compiler failed with exit code {:?}: {}",
            run.exit_code,
            run.stdout.trim()
        );
    }
    if !run.stdout.contains(EMBED_MARKER) {
        bail!("Snapshot compiler produced no embedding marker: {}", run.stdout.trim());
    }
    Ok(())
}

/// Verify both expected artifacts exist under the output directory.
pub fn verify_outputs(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(OUTPUT_FILES.len());
    for name in OUTPUT_FILES {
        let path = output_dir.join(name);
        if !path.exists() {
            bail!("Snapshot compiler output missing: {}", path.display());
        }
        paths.push(path);
    }
    Ok(paths)
}
