//! Package archive handling
//!
//! The shipped application tree is bundled as a single uncompressed tar
//! stream. Packing is deterministic: entries are added in sorted relative
//! path order with zeroed metadata, so identical input trees produce
//! identical archive bytes and the package digest is reproducible.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::crypto::{self, ContentKey};

/// Per-entry packing decision. An `Encrypt` entry is buffered whole and its
/// ciphertext written atomically, so the archive never contains a partially
/// encrypted file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntryTransform {
    PassThrough,
    Encrypt,
}

/// Pack a directory tree into an archive at `dest`.
///
/// `transform` decides per relative path whether the entry's content is
/// passed through or encrypted with `key`. Returns the number of entries
/// written.
pub fn pack_dir(
    src_dir: &Path,
    dest: &Path,
    key: &ContentKey,
    transform: impl Fn(&Path) -> EntryTransform,
) -> Result<usize> {
    let mut files = Vec::new();
    for entry in WalkDir::new(src_dir) {
        let entry = entry.context("Failed to walk source directory")?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();

    let dest_file = File::create(dest)
        .with_context(|| format!("Failed to create archive: {}", dest.display()))?;
    let mut builder = tar::Builder::new(dest_file);

    let mut count = 0;
    for path in &files {
        let relative = path
            .strip_prefix(src_dir)
            .context("Walked file outside the source directory")?;

        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read entry: {}", path.display()))?;

        let data = match transform(relative) {
            EntryTransform::PassThrough => content,
            EntryTransform::Encrypt => {
                debug!("Encrypting entry: {}", relative.display());
                crypto::encrypt(key, &content)?
            }
        };

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();

        builder
            .append_data(&mut header, relative, data.as_slice())
            .with_context(|| format!("Failed to append entry: {}", relative.display()))?;
        count += 1;
    }

    builder.into_inner().context("Failed to finish archive")?;
    debug!("Packed {} entries into {}", count, dest.display());
    Ok(count)
}

/// Unpack an archive into `dest`, returning the number of entries extracted.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;

    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

    let mut count = 0;
    let mut tar = tar::Archive::new(file);
    for entry in tar.entries().context("Failed to read archive entries")? {
        let mut entry = entry.context("Corrupt archive entry")?;
        let rel: PathBuf = entry.path().context("Invalid entry path")?.into_owned();
        if rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            bail!("Archive entry escapes the extraction root: {}", rel.display());
        }
        entry
            .unpack_in(dest)
            .with_context(|| format!("Failed to unpack entry: {}", rel.display()))?;
        count += 1;
    }

    debug!("Unpacked {} entries from {}", count, archive_path.display());
    Ok(count)
}

/// Read a single entry's stored bytes without unpacking the whole archive.
/// Returns `None` when no entry matches `rel_path`.
pub fn read_entry(archive_path: &Path, rel_path: &str) -> Result<Option<Vec<u8>>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;

    let wanted = Path::new(rel_path);
    let mut tar = tar::Archive::new(file);
    for entry in tar.entries().context("Failed to read archive entries")? {
        let mut entry = entry.context("Corrupt archive entry")?;
        let path: PathBuf = entry.path().context("Invalid entry path")?.into_owned();
        if path == wanted {
            let mut content = Vec::with_capacity(entry.size() as usize);
            std::io::Read::read_to_end(&mut entry, &mut content)
                .with_context(|| format!("Failed to read entry: {rel_path}"))?;
            return Ok(Some(content));
        }
    }

    Ok(None)
}

/// List entry paths in archive order.
pub fn list_entries(archive_path: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;

    let mut paths = Vec::new();
    let mut tar = tar::Archive::new(file);
    for entry in tar.entries().context("Failed to read archive entries")? {
        let entry = entry.context("Corrupt archive entry")?;
        paths.push(entry.path().context("Invalid entry path")?.into_owned());
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_key() -> ContentKey {
        ContentKey::from_bytes([7u8; 32])
    }

    fn build_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("app/renderer")).unwrap();
        std::fs::write(dir.join("app/main.js"), b"entry").unwrap();
        std::fs::write(dir.join("app/renderer/app.js"), b"bundle").unwrap();
        std::fs::write(dir.join("app/renderer/logo.png"), b"\x89PNG").unwrap();
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        build_tree(src.path());

        let archive = out.path().join("app.pak");
        let packed = pack_dir(src.path(), &archive, &test_key(), |_| {
            EntryTransform::PassThrough
        })
        .unwrap();
        assert_eq!(packed, 3);

        let dest = out.path().join("extracted");
        let unpacked = unpack(&archive, &dest).unwrap();
        assert_eq!(unpacked, 3);
        assert_eq!(
            std::fs::read(dest.join("app/renderer/app.js")).unwrap(),
            b"bundle"
        );
    }

    #[test]
    fn test_pack_is_deterministic() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        build_tree(src.path());

        let first = out.path().join("first.pak");
        let second = out.path().join("second.pak");
        pack_dir(src.path(), &first, &test_key(), |_| EntryTransform::PassThrough).unwrap();
        pack_dir(src.path(), &second, &test_key(), |_| EntryTransform::PassThrough).unwrap();

        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&second).unwrap()
        );
    }

    #[test]
    fn test_entry_paths_are_sorted_and_unique() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        build_tree(src.path());

        let archive = out.path().join("app.pak");
        pack_dir(src.path(), &archive, &test_key(), |_| EntryTransform::PassThrough).unwrap();

        let entries = list_entries(&archive).unwrap();
        let mut sorted = entries.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(entries, sorted);
    }

    #[test]
    fn test_encrypt_transform_applied_per_extension() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        build_tree(src.path());

        let key = test_key();
        let archive = out.path().join("app.pak");
        pack_dir(src.path(), &archive, &key, |path| {
            if path.extension().is_some_and(|e| e == "js") {
                EntryTransform::Encrypt
            } else {
                EntryTransform::PassThrough
            }
        })
        .unwrap();

        let stored = read_entry(&archive, "app/renderer/app.js")
            .unwrap()
            .unwrap();
        assert_ne!(stored, b"bundle");
        assert_eq!(crypto::decrypt(&key, &stored).unwrap(), b"bundle");

        let logo = read_entry(&archive, "app/renderer/logo.png")
            .unwrap()
            .unwrap();
        assert_eq!(logo, b"\x89PNG");
    }

    #[test]
    fn test_read_entry_missing_returns_none() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        build_tree(src.path());

        let archive = out.path().join("app.pak");
        pack_dir(src.path(), &archive, &test_key(), |_| EntryTransform::PassThrough).unwrap();

        assert!(read_entry(&archive, "app/missing.js").unwrap().is_none());
    }
}
