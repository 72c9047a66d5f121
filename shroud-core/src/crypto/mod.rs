//! Content encryption and package digests
//!
//! AES-256-GCM for shipped content, SHA-256 for the package digest. The key
//! is fixed at build time and compiled into the distribution; the nonce is
//! derived from the key, so encryption is deterministic. That property is
//! load-bearing: the startup guard compares a freshly re-encrypted digest
//! against the anchor baked into the startup artifact, which only works when
//! identical plaintext always produces identical ciphertext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{bail, Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Content key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length, appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// Build-time content key. Regenerate with `shroud genkey` and keep the
/// build pipeline and the shipped runtime on the same value. Stored as a
/// byte array rather than a string literal: precompiled artifacts do not
/// protect string constants.
const CONTENT_KEY: [u8; KEY_LEN] = [
    0xd1, 0x25, 0xcf, 0x0a, 0xd5, 0x9d, 0x1c, 0x64, 0xee, 0xef, 0xda, 0xcb, 0xcd, 0x87, 0xfd,
    0x6e, 0x6a, 0x16, 0xf2, 0x84, 0x6e, 0x13, 0xad, 0xa0, 0x09, 0x4e, 0xb9, 0x69, 0x67, 0xd0,
    0x27, 0xae,
];

/// Fixed symmetric key for content encryption
#[derive(Clone)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        ContentKey(bytes)
    }

    /// The key compiled into this build
    pub const fn embedded() -> Self {
        ContentKey(CONTENT_KEY)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Key-derived nonce: the first 12 bytes of the key. Deterministic by
    /// construction, see the module docs for why this is required.
    fn nonce(&self) -> &[u8] {
        &self.0[..NONCE_LEN]
    }
}

/// Encrypt `plaintext`, returning ciphertext with the 16-byte tag appended.
///
/// Deterministic: the same plaintext under the same key always yields the
/// same bytes.
pub fn encrypt(key: &ContentKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to initialize content cipher: {e}"))?;
    let nonce = Nonce::from_slice(key.nonce());

    cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("Content encryption failed: {e}"))
}

/// Decrypt ciphertext produced by [`encrypt`], verifying the trailing tag.
pub fn decrypt(key: &ContentKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < TAG_LEN {
        bail!(
            "Ciphertext too short: {} bytes, need at least {}",
            data.len(),
            TAG_LEN
        );
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to initialize content cipher: {e}"))?;
    let nonce = Nonce::from_slice(key.nonce());

    cipher
        .decrypt(nonce, data)
        .map_err(|_| anyhow::anyhow!("Content decryption failed (corrupt data or wrong key)"))
}

/// SHA-256 of a byte slice
pub fn digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of a file's contents, streamed
pub fn digest_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for digest: {}", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().into())
}

/// Seal a package digest into its anchor form: encrypt it with the content
/// key and hex-encode the result (ciphertext plus tag). This is the value
/// baked into the startup artifact and the value the startup guard
/// recomputes at launch.
pub fn seal_digest(key: &ContentKey, digest: &[u8; 32]) -> Result<String> {
    Ok(hex::encode(encrypt(key, digest)?))
}

/// Generate a fresh random key and render it as Rust source, ready to paste
/// over the `CONTENT_KEY` constant.
pub fn generate_key_source() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);

    let bytes = key
        .iter()
        .map(|b| format!("0x{b:02x}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!("const CONTENT_KEY: [u8; KEY_LEN] = [{bytes}];")
}
