//! Packed fixed-width vector storage: little-endian `f32`, four bytes each.

use kbsearch_core::error::{Error, Result};

pub fn pack_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn unpack_vector(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::Vector(format!("vector blob of {} bytes is not a whole number of f32", blob.len())));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Dimensionality stored in a blob without decoding it.
pub fn blob_dim(blob: &[u8]) -> usize {
    blob.len() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_keeps_values_and_width() {
        let v = vec![1.5f32, -0.25, 0.0, f32::MIN_POSITIVE];
        let blob = pack_vector(&v);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_dim(&blob), 4);
        assert_eq!(unpack_vector(&blob).expect("unpack"), v);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(unpack_vector(&[0, 0, 128]).is_err());
    }
}
