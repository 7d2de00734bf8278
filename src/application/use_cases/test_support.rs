//! In-process fakes for the generation, embedding and execution collaborators.

use crate::application::use_cases::embedding_service::Embedder;
use crate::application::use_cases::execution_gate::QueryExecutor;
use crate::application::use_cases::sql_generator::{parse_generation_output, SqlGenerator};
use crate::domain::error::{AppError, Result};
use crate::domain::parameter::ParameterSet;
use crate::domain::prompt::GenerationPrompt;
use crate::domain::query::{GenerationOutput, RowSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const TEST_DIMS: usize = 64;

/// Bag-of-tokens embedding: each token is hashed into one of `TEST_DIMS`
/// buckets. Same text, same vector; similar SQL, similar vectors.
pub struct HashEmbedder {
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; TEST_DIMS];
        for token in text
            .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            v[digest[0] as usize % TEST_DIMS] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let v = Self::vector(text);
        if v.iter().all(|x| *x == 0.0) {
            return Err(AppError::Embedding("nothing to embed".to_string()));
        }
        Ok(v)
    }
}

/// Replays canned replies in order and records every prompt it was given.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<GenerationPrompt>>,
}

impl ScriptedGenerator {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<GenerationOutput> {
        self.prompts.lock().push(prompt.clone());
        match self.replies.lock().pop_front() {
            Some(reply) => parse_generation_output(&reply),
            None => Err(AppError::Generation("script exhausted".to_string())),
        }
    }
}

/// Returns one row per call and records the SQL it was asked to run.
pub struct FakeExecutor {
    pub executed: Mutex<Vec<(String, ParameterSet)>>,
    failures: Mutex<VecDeque<AppError>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn failing_with(errors: Vec<AppError>) -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            failures: Mutex::new(errors.into_iter().collect()),
        }
    }

    pub fn calls(&self) -> usize {
        self.executed.lock().len()
    }
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, sql: &str, params: &ParameterSet) -> Result<RowSet> {
        self.executed.lock().push((sql.to_string(), params.clone()));
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        let mut row = HashMap::new();
        row.insert(
            "provider_name".to_string(),
            serde_json::json!("Mercy General Hospital"),
        );
        row.insert(
            "average_covered_charges".to_string(),
            serde_json::json!(18250.5),
        );
        Ok(RowSet {
            columns: vec![
                "provider_name".to_string(),
                "average_covered_charges".to_string(),
            ],
            rows: vec![row],
            row_count: 1,
            truncated: false,
        })
    }
}
