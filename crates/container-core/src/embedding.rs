//! Embedding provider abstraction and vector utilities (C2).
//!
//! Mirrors the teacher's `EmbeddingProvider` trait split (model metadata
//! lives on the trait object, the actual batched call is a free function
//! so it can be async without `#[async_trait]` object-safety headaches in
//! the synchronous parts of this crate). Concrete providers (OpenAI-style,
//! local, disabled) live in `container-service`; this crate only owns the
//! trait, L2 normalization, cosine similarity, and the little-endian f32
//! blob codec used to persist vectors in the relational embedding cache.

/// Metadata about a configured embedding backend.
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
}

/// A provider that is deliberately not configured. Any attempt to embed
/// fails, which callers translate into the `VECTOR_DOWN` issue code.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

/// L2-normalize a vector in place. A zero vector is left unchanged (its
/// norm is already zero; normalizing it would divide by zero).
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity between two vectors. For already L2-normalized
/// vectors this reduces to the dot product (§4.2), but this function does
/// not assume normalization so it is also safe to use on raw vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

/// Encode a float vector as little-endian f32 bytes, for BLOB storage in
/// the embedding cache table.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 BLOB back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Deterministic zero-vector fallback used when the embedding provider is
/// unreachable (§4.2 failure semantics: logged as `VECTOR_DOWN`, not fatal).
pub fn zero_vector(dims: usize) -> Vec<f32> {
    vec![0.0; dims]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn cosine_of_normalized_equals_dot_product() {
        let mut a = vec![1.0, 2.0, 2.0];
        let mut b = vec![2.0, 1.0, 2.0];
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        assert!((cosine_similarity(&a, &b) - dot).abs() < 1e-6);
    }

    #[test]
    fn blob_roundtrip_is_byte_identical() {
        let v = vec![1.0f32, -2.5, 0.0, 3.125];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn zero_vector_has_requested_dims() {
        assert_eq!(zero_vector(768).len(), 768);
        assert!(zero_vector(4).iter().all(|v| *v == 0.0));
    }
}
