//! Compression codec (component A): a Snappy-framed symmetric compressor
//! for RPC payloads, installed on both directions of a connection when
//! `Config::rpc_compression` is set on both peers.
//!
//! No framing changes beyond the wire `Frame`'s own `COMPRESSED` flag
//! (spec §4.1: "the RPC framework's own length prefixes remain").
//! Writers stream-encode; readers fully decompress into a buffer before
//! handing the payload up, matching spec's "writers stream-encode each
//! RPC payload; readers fully decompress into a buffer".

use std::io::Write;

use crate::error::CompressionError;

/// Compress `payload` with a Snappy frame stream.
pub fn compress(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut writer = snap::write::FrameEncoder::new(Vec::with_capacity(payload.len()));
    writer
        .write_all(payload)
        .map_err(CompressionError::Encode)?;
    writer
        .into_inner()
        .map_err(|e| CompressionError::Encode(e.into_error()))
}

/// Fully decompress a Snappy frame stream into a buffer.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut reader = snap::read::FrameDecoder::new(payload);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut out).map_err(CompressionError::Decode)?;
    Ok(out)
}
