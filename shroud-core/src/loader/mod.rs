//! Precompiled-module loader
//!
//! Reconstructs an engine-validated execution context from a compiled-module
//! cache buffer: the flag-hash header field is patched from a dummy cache so
//! incidental flag differences don't invalidate it, and a placeholder source
//! of invisible characters stands in for the original source, matched in
//! length through the source-hash field. If the engine still rejects the
//! cache, loading fails outright; falling back to plaintext execution would
//! defeat the protection.

pub mod header;

use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use header::{CacheHeader, HeaderError};

/// File extension handled by the loader
pub const COMPILED_EXT: &str = "jsc";

/// Invisible character the placeholder source is padded with
const PLACEHOLDER_CHAR: char = '\u{200b}';

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read compiled module: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Header(#[from] HeaderError),

    /// The engine rejected the cache. Fatal: there is no plaintext source
    /// to fall back to.
    #[error("Invalid or incompatible cached data")]
    CacheIncompatible,

    #[error("Engine failure while loading compiled module: {0}")]
    Engine(anyhow::Error),
}

/// Bindings the compiled wrapper runs under. Host engines extend these with
/// their own exports/require/process objects; the anchor slot always starts
/// empty — the real value was substituted into the launcher source before
/// it was compiled into the startup artifact.
#[derive(Debug, Clone)]
pub struct ModuleScope {
    pub filename: PathBuf,
    pub dirname: PathBuf,
    pub anchor_slot: String,
}

impl ModuleScope {
    pub fn for_file(filename: PathBuf) -> Self {
        let dirname = filename
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        ModuleScope {
            filename,
            dirname,
            anchor_slot: String::new(),
        }
    }
}

/// A module compiled against its cache, ready to execute
pub trait CompiledModule {
    fn execute(&self, scope: &ModuleScope) -> anyhow::Result<()>;
}

/// Engine operations the loader depends on
pub trait CacheEngine {
    /// Cache data from compiling an empty source under the engine's current
    /// flags. Donates the flag-hash header field.
    fn dummy_cache(&self) -> anyhow::Result<Vec<u8>>;

    /// Compile `source` with `cache` attached. Must return
    /// [`LoaderError::CacheIncompatible`] when the engine rejects the cache.
    fn compile_with_cache(
        &self,
        source: &str,
        cache: &[u8],
        filename: &Path,
    ) -> Result<Box<dyn CompiledModule>, LoaderError>;
}

/// Loader service over one engine. Owns the lazily-computed dummy cache;
/// one instance serves the whole process.
pub struct ModuleLoader<E: CacheEngine> {
    engine: E,
    dummy: OnceCell<Vec<u8>>,
}

impl<E: CacheEngine> ModuleLoader<E> {
    pub fn new(engine: E) -> Self {
        ModuleLoader {
            engine,
            dummy: OnceCell::new(),
        }
    }

    /// Load the compiled module at `path`: patch its flag-hash field,
    /// synthesize the placeholder source and compile with the cache
    /// attached.
    pub fn load(&self, path: &Path) -> Result<Box<dyn CompiledModule>, LoaderError> {
        let mut buffer = std::fs::read(path).map_err(|source| LoaderError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let dummy = self
            .dummy
            .get_or_try_init(|| self.engine.dummy_cache())
            .map_err(LoaderError::Engine)?;
        header::patch_flag_hash(&mut buffer, dummy)?;

        let parsed = CacheHeader::parse(&buffer)?;
        let placeholder = placeholder_source(parsed.source_length);
        debug!(
            "Loading compiled module {} (source length {})",
            path.display(),
            parsed.source_length
        );

        self.engine.compile_with_cache(&placeholder, &buffer, path)
    }

    /// Load and immediately execute with a fresh module scope.
    pub fn run(&self, path: &Path) -> Result<(), LoaderError> {
        let module = self.load(path)?;
        let scope = ModuleScope::for_file(path.to_path_buf());
        module.execute(&scope).map_err(LoaderError::Engine)
    }
}

/// Same-length stand-in for the original source: a quoted run of invisible
/// characters totalling exactly `length` characters, or the empty string
/// when the length can't hold the quotes.
pub fn placeholder_source(length: u32) -> String {
    if length <= 1 {
        return String::new();
    }

    let padding = length as usize - 2;
    let mut source = String::with_capacity(2 + padding * PLACEHOLDER_CHAR.len_utf8());
    source.push('"');
    for _ in 0..padding {
        source.push(PLACEHOLDER_CHAR);
    }
    source.push('"');
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::header::{FLAG_HASH_OFFSET, SOURCE_HASH_OFFSET};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct NoopModule;
    impl CompiledModule for NoopModule {
        fn execute(&self, _scope: &ModuleScope) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Engine fake recording what the loader hands it
    struct RecordingEngine {
        dummy_calls: RefCell<usize>,
        last_compile: RefCell<Option<(String, Vec<u8>)>>,
        reject_cache: bool,
    }

    impl RecordingEngine {
        fn new(reject_cache: bool) -> Self {
            RecordingEngine {
                dummy_calls: RefCell::new(0),
                last_compile: RefCell::new(None),
                reject_cache,
            }
        }
    }

    impl CacheEngine for RecordingEngine {
        fn dummy_cache(&self) -> anyhow::Result<Vec<u8>> {
            *self.dummy_calls.borrow_mut() += 1;
            let mut cache = vec![0u8; 32];
            cache[FLAG_HASH_OFFSET..FLAG_HASH_OFFSET + 4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
            Ok(cache)
        }

        fn compile_with_cache(
            &self,
            source: &str,
            cache: &[u8],
            _filename: &Path,
        ) -> Result<Box<dyn CompiledModule>, LoaderError> {
            if self.reject_cache {
                return Err(LoaderError::CacheIncompatible);
            }
            *self.last_compile.borrow_mut() = Some((source.to_string(), cache.to_vec()));
            Ok(Box::new(NoopModule))
        }
    }

    fn cache_fixture(dir: &Path, source_length: u32) -> PathBuf {
        let mut buf = vec![0u8; 64];
        buf[SOURCE_HASH_OFFSET..SOURCE_HASH_OFFSET + 4]
            .copy_from_slice(&source_length.to_le_bytes());
        buf[FLAG_HASH_OFFSET..FLAG_HASH_OFFSET + 4].copy_from_slice(&[1, 2, 3, 4]);

        let path = dir.join("main.jsc");
        std::fs::write(&path, &buf).unwrap();
        path
    }

    #[test]
    fn test_placeholder_length_matches_source_hash() {
        for length in [2u32, 5, 100, 4096] {
            let placeholder = placeholder_source(length);
            assert_eq!(placeholder.chars().count() as u32, length);
            assert!(placeholder.starts_with('"') && placeholder.ends_with('"'));
        }
    }

    #[test]
    fn test_placeholder_empty_for_tiny_lengths() {
        assert_eq!(placeholder_source(0), "");
        assert_eq!(placeholder_source(1), "");
    }

    #[test]
    fn test_load_patches_flag_hash_from_dummy_cache() {
        let dir = TempDir::new().unwrap();
        let path = cache_fixture(dir.path(), 10);

        let loader = ModuleLoader::new(RecordingEngine::new(false));
        loader.load(&path).unwrap();

        let engine = &loader.engine;
        let (source, cache) = engine.last_compile.borrow().clone().unwrap();
        assert_eq!(
            &cache[FLAG_HASH_OFFSET..FLAG_HASH_OFFSET + 4],
            &[0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(source.chars().count(), 10);
    }

    #[test]
    fn test_dummy_cache_computed_once() {
        let dir = TempDir::new().unwrap();
        let path = cache_fixture(dir.path(), 10);

        let loader = ModuleLoader::new(RecordingEngine::new(false));
        loader.load(&path).unwrap();
        loader.load(&path).unwrap();

        assert_eq!(*loader.engine.dummy_calls.borrow(), 1);
    }

    #[test]
    fn test_rejected_cache_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = cache_fixture(dir.path(), 10);

        let loader = ModuleLoader::new(RecordingEngine::new(true));
        assert!(matches!(
            loader.load(&path),
            Err(LoaderError::CacheIncompatible)
        ));
    }

    #[test]
    fn test_truncated_cache_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.jsc");
        std::fs::write(&path, [0u8; 8]).unwrap();

        let loader = ModuleLoader::new(RecordingEngine::new(false));
        assert!(matches!(loader.load(&path), Err(LoaderError::Header(_))));
    }

    #[test]
    fn test_missing_file_reports_read_error() {
        let loader = ModuleLoader::new(RecordingEngine::new(false));
        assert!(matches!(
            loader.load(Path::new("/nonexistent/main.jsc")),
            Err(LoaderError::Read { .. })
        ));
    }

    #[test]
    fn test_scope_anchor_slot_starts_empty() {
        let scope = ModuleScope::for_file(PathBuf::from("/opt/app/main.jsc"));
        assert_eq!(scope.anchor_slot, "");
        assert_eq!(scope.dirname, PathBuf::from("/opt/app"));
    }
}
