#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use clinsum::{Embedder, LlmClient, StoredResource};

/// Replies `summary #n` to the n-th call and fails on prompts containing any
/// of `fail_on`.
#[derive(Default)]
pub struct ScriptedLlm {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    fail_on: Vec<String>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(markers: &[&str]) -> Self {
        Self {
            fail_on: markers.iter().map(|marker| marker.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete(&self, prompt: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_on.iter().any(|marker| prompt.contains(marker.as_str())) {
            bail!("scripted failure on call {n}");
        }
        Ok(format!("summary #{n}"))
    }
}

/// Embeds every input as the same unit vector.
#[derive(Default)]
pub struct FixedEmbedder {
    calls: AtomicUsize,
}

impl FixedEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Embedder for FixedEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

/// Fails on inputs containing `poison`, otherwise embeds like [`FixedEmbedder`].
pub struct PoisonedEmbedder {
    pub poison: &'static str,
}

impl Embedder for PoisonedEmbedder {
    fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.iter().any(|input| input.contains(self.poison)) {
            bail!("embedding service rejected input");
        }
        Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

/// Two-dimensional vector whose cosine similarity to `[1, 0]` is `score`.
pub fn scored_vector(score: f32) -> Vec<f32> {
    vec![score, (1.0 - score * score).max(0.0).sqrt()]
}

pub fn stored(patient: &str, kind: &str, id: &str, text: &str, score: f32) -> StoredResource {
    StoredResource {
        patient_id: patient.into(),
        patient_lastname: "Doe".into(),
        patient_firstname: "Jane".into(),
        resource_type: kind.into(),
        resource_id: id.into(),
        text: text.into(),
        embedding: scored_vector(score),
    }
}
