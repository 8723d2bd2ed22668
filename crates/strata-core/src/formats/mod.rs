//! # Formats
//!
//! Byte-level encodings shared by the persistent store:
//! - `embedding`: little-endian `f32` blobs
//! - `rows`: postcard-encoded version rows

pub mod embedding;
pub mod rows;

pub use embedding::{embedding_from_bytes, embedding_to_bytes};
pub use rows::{EntityRow, RelationRow, decode_row, encode_row};
