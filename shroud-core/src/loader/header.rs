//! Precompiled-module cache header
//!
//! The engine validates a cache buffer against its current flags and the
//! source it is attached to through two 4-byte header fields. Offsets are
//! fixed by the cache format this loader understands:
//!
//! | offset | field       | meaning                                   |
//! |--------|-------------|-------------------------------------------|
//! | 8      | source hash | original source character length (u32 LE) |
//! | 12     | flag hash   | hash of the engine flags at compile time  |
//!
//! Everything past the header region is opaque engine data.

use thiserror::Error;

/// Cache format revision these offsets describe
pub const FORMAT_VERSION: u32 = 1;

/// Byte offset of the 4-byte flag-hash field
pub const FLAG_HASH_OFFSET: usize = 12;

/// Byte offset of the 4-byte little-endian source-hash field
pub const SOURCE_HASH_OFFSET: usize = 8;

/// Minimum buffer length covering both header fields
pub const HEADER_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Cache buffer too short for its header: {len} bytes, need at least {need}")]
    TooShort { len: usize, need: usize },
}

/// Parsed header fields of a cache buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheHeader {
    pub flag_hash: [u8; 4],
    /// Character length of the source the cache was compiled from
    pub source_length: u32,
}

impl CacheHeader {
    /// Parse the header region, rejecting buffers too short to hold it.
    pub fn parse(buf: &[u8]) -> Result<CacheHeader, HeaderError> {
        check_len(buf)?;

        let mut flag_hash = [0u8; 4];
        flag_hash.copy_from_slice(&buf[FLAG_HASH_OFFSET..FLAG_HASH_OFFSET + 4]);

        let mut source_hash = [0u8; 4];
        source_hash.copy_from_slice(&buf[SOURCE_HASH_OFFSET..SOURCE_HASH_OFFSET + 4]);

        Ok(CacheHeader {
            flag_hash,
            source_length: u32::from_le_bytes(source_hash),
        })
    }
}

/// Overwrite `buf`'s flag-hash field with the one from `donor`, making the
/// buffer pass flag validation despite incidental flag differences that do
/// not affect code semantics. Both buffers must cover the header region.
pub fn patch_flag_hash(buf: &mut [u8], donor: &[u8]) -> Result<(), HeaderError> {
    check_len(buf)?;
    check_len(donor)?;

    buf[FLAG_HASH_OFFSET..FLAG_HASH_OFFSET + 4]
        .copy_from_slice(&donor[FLAG_HASH_OFFSET..FLAG_HASH_OFFSET + 4]);
    Ok(())
}

fn check_len(buf: &[u8]) -> Result<(), HeaderError> {
    if buf.len() < HEADER_LEN {
        return Err(HeaderError::TooShort {
            len: buf.len(),
            need: HEADER_LEN,
        });
    }
    Ok(())
}
