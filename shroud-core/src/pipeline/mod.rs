//! Archive transform pipeline
//!
//! Build-time repackaging of the application archive: unpack, replace the
//! entry point with a stub that defers to the precompiled-module loader,
//! drop the loader's standalone support file (its logic ships inside the
//! startup artifact), repack with selective encryption, and digest the
//! result. Single-threaded batch work over one archive at a time; the fixed
//! work directory makes concurrent builds unsafe.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::archive::{self, EntryTransform};
use crate::crypto::{self, ContentKey};

/// Pipeline configuration, loadable from JSON. Defaults match the standard
/// application layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Entry-point file, relative to the archive root
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Loader support file removed during repacking
    #[serde(default = "default_loader_support")]
    pub loader_support: String,

    /// Compiled-module file the rewritten entry stub defers to
    #[serde(default = "default_compiled_entry")]
    pub compiled_entry: String,

    /// Subtree whose protected-extension files are encrypted
    #[serde(default = "default_asset_subtree")]
    pub asset_subtree: String,

    /// File extensions selected for content encryption
    #[serde(default = "default_protected_extensions")]
    pub protected_extensions: Vec<String>,
}

fn default_entry_point() -> String {
    "app/main.js".to_string()
}

fn default_loader_support() -> String {
    "app/module-loader.js".to_string()
}

fn default_compiled_entry() -> String {
    "./main.jsc".to_string()
}

fn default_asset_subtree() -> String {
    "app/renderer".to_string()
}

fn default_protected_extensions() -> Vec<String> {
    vec!["js".to_string(), "html".to_string(), "css".to_string()]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            entry_point: default_entry_point(),
            loader_support: default_loader_support(),
            compiled_entry: default_compiled_entry(),
            asset_subtree: default_asset_subtree(),
            protected_extensions: default_protected_extensions(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse pipeline config: {}", path.display()))
    }

    /// Whether an archive-relative path is stored encrypted
    pub fn is_protected(&self, relative: &Path) -> bool {
        if !relative.starts_with(&self.asset_subtree) {
            return false;
        }
        relative
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.protected_extensions.iter().any(|p| p == ext))
    }
}

/// Outcome of a completed pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// SHA-256 of the final archive bytes, hex-encoded
    pub digest_hex: String,
    /// Raw digest, sealed into the anchor by the embedding step
    #[serde(skip)]
    pub digest: [u8; 32],
    pub files_total: usize,
    pub files_protected: usize,
    pub duration_secs: f64,
    pub completed_at: DateTime<Utc>,
}

/// Run the transform pipeline over the archive at `archive_path`, in place.
///
/// Any I/O failure aborts the build; no partial archive is left published
/// under the original name.
pub fn run(archive_path: &Path, config: &PipelineConfig, key: &ContentKey) -> Result<BuildReport> {
    let start = Instant::now();

    let work_dir = archive_path
        .parent()
        .context("Archive path has no parent directory")?
        .join("app-unpacked");

    info!("Unpacking {} for transform", archive_path.display());
    let files_total = archive::unpack(archive_path, &work_dir)?;

    std::fs::remove_file(archive_path)
        .with_context(|| format!("Failed to remove original archive: {}", archive_path.display()))?;

    rewrite_entry_point(&work_dir, config)?;

    debug!("Repacking with selective encryption");
    let protected_counter = std::cell::Cell::new(0usize);
    archive::pack_dir(&work_dir, archive_path, key, |relative| {
        if config.is_protected(relative) {
            protected_counter.set(protected_counter.get() + 1);
            EntryTransform::Encrypt
        } else {
            EntryTransform::PassThrough
        }
    })?;
    let files_protected = protected_counter.get();

    let digest = crypto::digest_file(archive_path)?;

    std::fs::remove_dir_all(&work_dir)
        .with_context(|| format!("Failed to remove work directory: {}", work_dir.display()))?;

    let duration_secs = start.elapsed().as_secs_f64();
    let digest_hex = hex::encode(digest);
    info!(
        "Archive transform complete: duration={:.2}s digest={}",
        duration_secs, digest_hex
    );

    Ok(BuildReport {
        digest_hex,
        digest,
        files_total,
        files_protected,
        duration_secs,
        completed_at: Utc::now(),
    })
}

/// Replace the entry file with a stub deferring to the precompiled-module
/// loader, and delete the loader's standalone support file.
fn rewrite_entry_point(work_dir: &Path, config: &PipelineConfig) -> Result<()> {
    let entry_path = work_dir.join(&config.entry_point);
    if !entry_path.exists() {
        bail!("Archive has no entry point at {}", config.entry_point);
    }

    let stub = entry_stub(&config.compiled_entry);
    std::fs::write(&entry_path, stub)
        .with_context(|| format!("Failed to rewrite entry point: {}", entry_path.display()))?;
    debug!("Rewrote entry point: {}", config.entry_point);

    let support_path = work_dir.join(&config.loader_support);
    if support_path.exists() {
        std::fs::remove_file(&support_path).with_context(|| {
            format!("Failed to remove loader support file: {}", support_path.display())
        })?;
        debug!("Removed loader support file: {}", config.loader_support);
    }

    Ok(())
}

/// Minimal entry stub: hands control to the launcher baked into the startup
/// artifact.
fn entry_stub(compiled_entry: &str) -> String {
    format!("\"use strict\";launcher(module,\"{compiled_entry}\");")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_key() -> ContentKey {
        ContentKey::from_bytes([3u8; 32])
    }

    fn packed_fixture(dir: &Path) -> PathBuf {
        let tree = dir.join("tree");
        std::fs::create_dir_all(tree.join("app/renderer")).unwrap();
        std::fs::write(tree.join("app/main.js"), b"require('./boot');").unwrap();
        std::fs::write(tree.join("app/module-loader.js"), b"loader support").unwrap();
        std::fs::write(tree.join("app/renderer/index.html"), b"<html></html>").unwrap();
        std::fs::write(tree.join("app/renderer/app.js"), b"render()").unwrap();
        std::fs::write(tree.join("app/renderer/logo.png"), b"\x89PNGdata").unwrap();

        let archive = dir.join("app.pak");
        archive::pack_dir(&tree, &archive, &test_key(), |_| EntryTransform::PassThrough).unwrap();
        std::fs::remove_dir_all(&tree).unwrap();
        archive
    }

    #[test]
    fn test_is_protected_requires_subtree_and_extension() {
        let config = PipelineConfig::default();

        assert!(config.is_protected(Path::new("app/renderer/app.js")));
        assert!(config.is_protected(Path::new("app/renderer/css/site.css")));
        assert!(!config.is_protected(Path::new("app/renderer/logo.png")));
        assert!(!config.is_protected(Path::new("app/main.js")));
    }

    #[test]
    fn test_run_encrypts_protected_and_rewrites_entry() {
        let dir = TempDir::new().unwrap();
        let archive = packed_fixture(dir.path());
        let key = test_key();
        let config = PipelineConfig::default();

        let report = run(&archive, &config, &key).unwrap();
        assert_eq!(report.files_total, 5);
        assert_eq!(report.files_protected, 2);
        assert_eq!(report.digest_hex, hex::encode(report.digest));

        // Protected entries are ciphertext that decrypts to the original.
        let stored = archive::read_entry(&archive, "app/renderer/app.js")
            .unwrap()
            .unwrap();
        assert_ne!(stored, b"render()");
        assert_eq!(crypto::decrypt(&key, &stored).unwrap(), b"render()");

        // Unprotected bytes pass through unchanged.
        let logo = archive::read_entry(&archive, "app/renderer/logo.png")
            .unwrap()
            .unwrap();
        assert_eq!(logo, b"\x89PNGdata");

        // Entry point is now the stub; loader support file is gone.
        let entry = archive::read_entry(&archive, "app/main.js").unwrap().unwrap();
        assert_eq!(entry, entry_stub("./main.jsc").as_bytes());
        assert!(archive::read_entry(&archive, "app/module-loader.js")
            .unwrap()
            .is_none());

        // Work directory is cleaned up.
        assert!(!dir.path().join("app-unpacked").exists());
    }

    #[test]
    fn test_run_digest_matches_final_archive() {
        let dir = TempDir::new().unwrap();
        let archive = packed_fixture(dir.path());

        let report = run(&archive, &PipelineConfig::default(), &test_key()).unwrap();
        assert_eq!(crypto::digest_file(&archive).unwrap(), report.digest);
    }

    #[test]
    fn test_run_fails_without_entry_point() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("app")).unwrap();
        std::fs::write(tree.join("app/other.js"), b"not the entry").unwrap();

        let archive = dir.path().join("app.pak");
        archive::pack_dir(&tree, &archive, &test_key(), |_| EntryTransform::PassThrough).unwrap();

        let result = run(&archive, &PipelineConfig::default(), &test_key());
        assert!(result.is_err());
    }

    #[test]
    fn test_config_load_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, br#"{ "protected_extensions": ["js"] }"#).unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.protected_extensions, vec!["js"]);
        assert_eq!(config.entry_point, "app/main.js");
    }
}
