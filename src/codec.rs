// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire encoding for replication messages.
//!
//! A message travels as two fields:
//!
//! | Field | Content |
//! |-------|---------|
//! | `payload` | JSON, zstd-compressed when larger than the threshold |
//! | `hash` | SHA-256 hex of the uncompressed JSON |
//!
//! Compression is detected on decode by the zstd magic bytes, so a reader does
//! not need to know the writer's threshold. The hash is verified after
//! decompression; a mismatch means the entry is corrupt and must be dropped.

use crate::error::{DualWriteError, Result};
use crate::message::ReplicationMessage;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;

pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_HASH: &str = "hash";

/// zstd frame magic bytes.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

const ZSTD_LEVEL: i32 = 3;

/// A message ready to be written to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub payload: Vec<u8>,
    pub hash: String,
}

impl EncodedMessage {
    pub fn is_compressed(&self) -> bool {
        has_zstd_magic(&self.payload)
    }
}

/// Serialize `msg`, compressing when the JSON exceeds `compress_threshold` bytes.
pub fn encode(msg: &ReplicationMessage, compress_threshold: usize) -> Result<EncodedMessage> {
    let json = serde_json::to_vec(msg)?;
    let hash = content_hash(&json);

    let payload = if json.len() > compress_threshold {
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
            .map_err(|e| DualWriteError::Codec(format!("zstd encode: {e}")))?;
        if compressed.len() < json.len() {
            compressed
        } else {
            json
        }
    } else {
        json
    };

    Ok(EncodedMessage { payload, hash })
}

/// Decode a payload, verifying `hash` when present.
pub fn decode(payload: &[u8], hash: Option<&str>) -> Result<ReplicationMessage> {
    let json = maybe_decompress(payload)?;

    if let Some(expected) = hash {
        let computed = content_hash(&json);
        if computed != expected {
            return Err(DualWriteError::Codec(format!(
                "content hash mismatch: expected {expected}, got {computed}"
            )));
        }
    }

    Ok(serde_json::from_slice(&json)?)
}

/// Decode a stream entry's field map.
pub fn decode_fields(fields: &HashMap<String, redis::Value>) -> Result<ReplicationMessage> {
    let payload = get_bytes_field(fields, FIELD_PAYLOAD)?;
    let hash = get_string_field(fields, FIELD_HASH).ok();
    decode(&payload, hash.as_deref())
}

fn has_zstd_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if has_zstd_magic(data) {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| DualWriteError::Codec(format!("zstd init: {e}")))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| DualWriteError::Codec(format!("zstd decode: {e}")))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// SHA-256 as lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn get_string_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<String> {
    let bytes = get_bytes_field(fields, name)?;
    String::from_utf8(bytes)
        .map_err(|e| DualWriteError::Codec(format!("invalid UTF-8 in {name}: {e}")))
}

fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Result<Vec<u8>> {
    let value = fields
        .get(name)
        .ok_or_else(|| DualWriteError::Codec(format!("missing field: {name}")))?;

    match value {
        redis::Value::BulkString(bytes) => Ok(bytes.clone()),
        redis::Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        _ => Err(DualWriteError::Codec(format!(
            "unexpected type for field {name}: {value:?}"
        ))),
    }
}
