//! Anchor embedding
//!
//! Seals the package digest, substitutes it into the startup-artifact
//! source at its placeholder, obfuscates the source deterministically,
//! drives the external snapshot compiler and installs the produced
//! artifacts. A partial or default artifact is never published: that would
//! silently disable verification.

pub mod compiler;
pub mod obfuscate;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::crypto::{self, ContentKey};
use compiler::CompilerConfig;

/// Built-in startup-artifact source
const LAUNCHER_TEMPLATE: &str = include_str!("launcher.js");

/// Placeholder line replaced with the sealed digest before compilation
const ANCHOR_PLACEHOLDER: &str = "global.PACKAGE_ANCHOR = '';";

/// Embedding settings
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Distribution directory the finished artifacts are installed into
    pub dist_dir: PathBuf,
    /// Startup-artifact source template; the built-in launcher when unset
    pub template: Option<PathBuf>,
    /// Snapshot compiler binary; discovered when unset
    pub compiler_binary: Option<PathBuf>,
    pub compiler_timeout: Duration,
}

impl EmbedConfig {
    pub fn new(dist_dir: PathBuf) -> Self {
        EmbedConfig {
            dist_dir,
            template: None,
            compiler_binary: None,
            compiler_timeout: Duration::from_secs(300),
        }
    }
}

/// Substitute the sealed digest into the template source. Fails when the
/// template carries no placeholder; compiling such a source would ship an
/// artifact that verifies nothing.
fn substitute_anchor(template: &str, sealed_hex: &str) -> Result<String> {
    if !template.contains(ANCHOR_PLACEHOLDER) {
        bail!("Startup-artifact source has no anchor placeholder");
    }

    let injected = format!("global.PACKAGE_ANCHOR = '{sealed_hex}';");
    Ok(template.replace(ANCHOR_PLACEHOLDER, &injected))
}

/// Seal `digest` and bake it into freshly compiled startup artifacts under
/// `config.dist_dir`, overwriting any defaults there.
pub async fn embed(config: &EmbedConfig, key: &ContentKey, digest: &[u8; 32]) -> Result<()> {
    let sealed = crypto::seal_digest(key, digest)?;
    debug!("Sealed package digest: {} hex chars", sealed.len());

    let template = match &config.template {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read source template: {}", path.display()))?,
        None => LAUNCHER_TEMPLATE.to_string(),
    };

    let substituted = substitute_anchor(&template, &sealed)?;
    let obfuscated = obfuscate::obfuscate(&substituted, obfuscate::OBFUSCATION_SEED);

    // Compile from a scratch directory; only verified outputs leave it.
    let work = tempfile::tempdir().context("Failed to create compiler work directory")?;
    let source_path = work.path().join("startup.js");
    std::fs::write(&source_path, &obfuscated)
        .with_context(|| format!("Failed to write compiler input: {}", source_path.display()))?;

    let compiler_config = CompilerConfig {
        binary: config.compiler_binary.clone(),
        output_dir: work.path().to_path_buf(),
        timeout: config.compiler_timeout,
    };

    let run = compiler::run_compiler(&compiler_config, &source_path).await?;
    compiler::check_run(&run)?;
    let outputs = compiler::verify_outputs(work.path())?;

    std::fs::create_dir_all(&config.dist_dir).with_context(|| {
        format!("Failed to create distribution directory: {}", config.dist_dir.display())
    })?;

    for output in &outputs {
        let name = output
            .file_name()
            .context("Compiler output has no file name")?;
        let dest = config.dist_dir.join(name);
        std::fs::copy(output, &dest)
            .with_context(|| format!("Failed to install artifact: {}", dest.display()))?;
        info!("Installed startup artifact: {}", dest.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_substitute_anchor_injects_hex() {
        let sealed = "ab".repeat(48);
        let out = substitute_anchor(LAUNCHER_TEMPLATE, &sealed).unwrap();

        assert!(out.contains(&format!("global.PACKAGE_ANCHOR = '{sealed}';")));
        assert!(!out.contains(ANCHOR_PLACEHOLDER));
    }

    #[test]
    fn test_substitute_anchor_requires_placeholder() {
        let result = substitute_anchor("var x = 1;\n", "abcdef");
        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_template_has_placeholder_and_loader_hooks() {
        assert!(LAUNCHER_TEMPLATE.contains(ANCHOR_PLACEHOLDER));
        assert!(LAUNCHER_TEMPLATE.contains("FLAG_HASH_OFFSET: 12"));
        assert!(LAUNCHER_TEMPLATE.contains("SOURCE_HASH_OFFSET: 8"));
        assert!(LAUNCHER_TEMPLATE.contains("'.jsc'"));
    }

    #[test]
    fn test_obfuscated_substitution_is_reproducible() {
        let sealed = "cd".repeat(48);
        let substituted = substitute_anchor(LAUNCHER_TEMPLATE, &sealed).unwrap();

        let first = obfuscate::obfuscate(&substituted, obfuscate::OBFUSCATION_SEED);
        let second = obfuscate::obfuscate(&substituted, obfuscate::OBFUSCATION_SEED);
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_embed_installs_both_artifacts() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let binary = dir.path().join("fake-mksnapshot");
        std::fs::write(
            &binary,
            "#!/bin/sh\necho 'Loading script for embedding'\ntouch \"$3/snapshot_blob.bin\" \"$3/v8_context_snapshot.bin\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dist = dir.path().join("dist");
        let mut config = EmbedConfig::new(dist.clone());
        config.compiler_binary = Some(binary);

        let key = ContentKey::from_bytes([9u8; 32]);
        let digest = crypto::digest(b"final archive");
        embed(&config, &key, &digest).await.unwrap();

        assert!(dist.join("snapshot_blob.bin").exists());
        assert!(dist.join("v8_context_snapshot.bin").exists());
    }
}
