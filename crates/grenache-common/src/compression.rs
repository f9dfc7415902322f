//! Gzip adapter for serialized envelopes.
//!
//! Compression is negotiated per message, so both directions take an
//! `enabled` flag and pass bytes through untouched when it is false.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{self, Read, Write};

/// Gzips `bytes` when `enabled`; borrows them unchanged otherwise.
pub fn maybe_compress(bytes: &[u8], enabled: bool) -> io::Result<Cow<'_, [u8]>> {
    if !enabled {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2 + 32), Compression::default());
    encoder.write_all(bytes)?;
    Ok(Cow::Owned(encoder.finish()?))
}

/// Gunzips `bytes` when `enabled`; borrows them unchanged otherwise.
pub fn maybe_decompress(bytes: &[u8], enabled: bool) -> io::Result<Cow<'_, [u8]>> {
    if !enabled {
        return Ok(Cow::Borrowed(bytes));
    }

    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(Cow::Owned(out))
}
