//! Feature-hashing embedding backend
//!
//! Maps each lower-cased alphanumeric token to a signed bucket with FNV-1a and
//! L2-normalises the result. Documents sharing vocabulary land close together
//! under cosine distance. No model files, no network, fully deterministic:
//! used for tests, CI and air-gapped installs where lexical overlap is enough.

use async_trait::async_trait;

use crate::embeddings::{EmbeddingBackend, EmbeddingError};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone)]
pub struct HashEmbeddingClient {
    dimensions: usize,
}

impl HashEmbeddingClient {
    pub fn new(dimensions: usize) -> Result<Self, EmbeddingError> {
        if dimensions == 0 {
            return Err(EmbeddingError::InvalidDimensions {
                expected: 1,
                actual: 0,
            });
        }
        Ok(Self { dimensions })
    }

    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in tokenize(trimmed) {
            self.accumulate(&mut vector, &token);
        }

        // Punctuation-only input, or colliding buckets that cancelled out.
        if l2_norm(&vector) == 0.0 {
            self.accumulate(&mut vector, trimmed);
        }

        let norm = l2_norm(&vector);
        for v in &mut vector {
            *v /= norm;
        }
        Ok(vector)
    }

    fn accumulate(&self, vector: &mut [f32], token: &str) {
        let hash = fnv1a(token.as_bytes());
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_sync(text)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hash"
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(FNV_PRIME)
    })
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}
