//! Embedding service contract and the shared vector wire format.

use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Text embedding service producing fixed-dimension vectors.
pub trait Embedder: Send + Sync {
    /// Embeds a batch of inputs, one vector per input in the same order.
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single input.
    fn embed(&self, input: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[input])?
            .pop()
            .context("embedding service returned no vector")
    }
}

/// Query/insert vector in store wire format: comma separated, 8 decimals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VectorLiteral(String);

impl VectorLiteral {
    /// Formats an embedding as `0.12345678,-0.00000001,...`.
    pub fn from_embedding(values: &[f32]) -> Self {
        let mut out = String::with_capacity(values.len() * 12);
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&format!("{value:.8}"));
        }
        Self(out)
    }

    /// Raw comma-separated form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bracketed form accepted by pgvector's text input (`[a,b,c]`).
    pub fn to_pgvector(&self) -> String {
        format!("[{}]", self.0)
    }

    /// Parses the literal back into numbers.
    pub fn values(&self) -> Result<Vec<f32>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        self.0
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f32>()
                    .with_context(|| format!("invalid vector component '{part}'"))
            })
            .collect()
    }

    /// Number of components.
    pub fn dimensions(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split(',').count()
        }
    }
}

impl fmt::Display for VectorLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One embedded resource, as written to the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    /// Patient (group key) the resource belongs to.
    pub patient_id: String,
    /// Patient family name, denormalized for display.
    pub patient_lastname: String,
    /// Patient given name, denormalized for display.
    pub patient_firstname: String,
    /// FHIR resource type (category).
    pub resource_type: String,
    /// FHIR resource id (entity id).
    pub resource_id: String,
    /// Flattened resource text that was embedded.
    pub text: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
}

/// Cosine similarity of two vectors; 0.0 when either is all zeros or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_uses_eight_decimals() {
        let literal = VectorLiteral::from_embedding(&[0.5, -0.25, 1.0]);
        assert_eq!(literal.as_str(), "0.50000000,-0.25000000,1.00000000");
        assert_eq!(literal.to_pgvector(), "[0.50000000,-0.25000000,1.00000000]");
        assert_eq!(literal.dimensions(), 3);
    }

    #[test]
    fn literal_parses_back() {
        let literal = VectorLiteral::from_embedding(&[0.125, 0.75]);
        assert_eq!(literal.values().unwrap(), vec![0.125, 0.75]);
        assert!(VectorLiteral::from_embedding(&[]).values().unwrap().is_empty());
    }

    #[test]
    fn cosine_of_parallel_and_orthogonal_vectors() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }
}
