//! # Embedding Blob Codec
//!
//! Embeddings are persisted as the raw little-endian bytes of an `f32` array.
//! An absent embedding is simply not stored.

use crate::StrataError;

/// Encode an embedding as little-endian `f32` bytes.
#[must_use]
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes into an embedding.
///
/// # Errors
///
/// Returns `StrataError::Serialization` if the length is not a multiple of 4.
pub fn embedding_from_bytes(bytes: &[u8]) -> Result<Vec<f32>, StrataError> {
    if bytes.len() % 4 != 0 {
        return Err(StrataError::Serialization(format!(
            "Embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
