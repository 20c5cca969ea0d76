//! Opaque embedding function.
//!
//! The store and runtime treat embeddings as a black box: a function from
//! text to a fixed-dimension vector. The default is a deterministic
//! seeded-hash projection — same input, same vector — sufficient for the
//! cosine-distance plumbing until a real model is wired in.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Fixed embedding dimension.
pub const EMBED_DIM: usize = 384;

/// Boxed embedding function handed to the runtime.
pub type Embedder = Arc<dyn Fn(&str) -> Vec<f32> + Send + Sync>;

/// Deterministic placeholder embedding: one hash per dimension, mapped
/// into [-1, 1] and L2-normalized.
pub fn hash_embedding(content: &str) -> Vec<f32> {
    let mut v = Vec::with_capacity(EMBED_DIM);
    for seed in 0..EMBED_DIM {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        content.hash(&mut hasher);
        let raw = hasher.finish();
        v.push((raw % 2000) as f32 / 1000.0 - 1.0);
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

pub fn default_embedder() -> Embedder {
    Arc::new(hash_embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(hash_embedding("hello world"), hash_embedding("hello world"));
    }

    #[test]
    fn correct_dimension() {
        assert_eq!(hash_embedding("test").len(), EMBED_DIM);
    }

    #[test]
    fn normalized() {
        let v = hash_embedding("some text");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(hash_embedding("alpha"), hash_embedding("beta"));
    }
}
