//! Embedding blob encoding: packed little-endian `f32`, no header.
//!
//! The dimension is stored in its own column and checked on decode.

use rollcall_core::Embedding;
use thiserror::Error;

const F32_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("embedding blob length {0} is not a multiple of 4")]
    Misaligned(usize),
    #[error("embedding blob holds {actual} values, row says {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding blob is empty")]
    Empty,
}

pub fn encode(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.values.len() * F32_BYTES);
    for v in &embedding.values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn decode(blob: &[u8], expected_dim: usize) -> Result<Embedding, CodecError> {
    if blob.is_empty() {
        return Err(CodecError::Empty);
    }
    if blob.len() % F32_BYTES != 0 {
        return Err(CodecError::Misaligned(blob.len()));
    }
    let actual = blob.len() / F32_BYTES;
    if actual != expected_dim {
        return Err(CodecError::DimensionMismatch {
            expected: expected_dim,
            actual,
        });
    }
    let values = blob
        .chunks_exact(F32_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_survive_exactly() {
        let values = vec![0.1f32, -1.5e-7, f32::MAX, f32::MIN_POSITIVE, -0.0, 123.456];
        let blob = encode(&Embedding::new(values.clone()));
        assert_eq!(blob.len(), values.len() * 4);
        let decoded = decode(&blob, values.len()).unwrap();
        for (a, b) in values.iter().zip(decoded.values.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let blob = encode(&Embedding::new(vec![1.0]));
        assert_eq!(blob, vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_misaligned_blob() {
        assert_eq!(decode(&[0, 0, 0], 1), Err(CodecError::Misaligned(3)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let blob = encode(&Embedding::new(vec![1.0, 2.0]));
        assert_eq!(
            decode(&blob, 128),
            Err(CodecError::DimensionMismatch { expected: 128, actual: 2 })
        );
    }

    #[test]
    fn test_empty_blob() {
        assert_eq!(decode(&[], 0), Err(CodecError::Empty));
    }
}
