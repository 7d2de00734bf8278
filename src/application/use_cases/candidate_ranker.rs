//! Candidate Ranker
//!
//! Confirms an embedding-space neighbour with two lexical checks before the
//! fast path may reuse it:
//! - normalized Levenshtein distance between canonical strings
//! - Jaccard similarity over SQL tokens (keywords, identifiers, operators)
//!
//! A candidate is acceptable only when its edit distance is under the
//! threshold and its cosine similarity is over the floor.

use super::sql_normalizer::sql_tokens;
use super::template_catalog::TemplateCatalog;
use crate::domain::error::{AppError, Result};
use crate::domain::query::CandidateMatch;
use crate::domain::template::Template;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Neighbours fetched per draft, clamped to 3..=5
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Acceptance requires edit distance strictly below this
    #[serde(default = "default_max_edit_distance")]
    pub max_edit_distance: f32,
    /// Acceptance requires cosine similarity strictly above this
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    #[serde(default = "default_edit_weight")]
    pub edit_weight: f32,
    #[serde(default = "default_jaccard_weight")]
    pub jaccard_weight: f32,
}

fn default_top_k() -> usize {
    5
}

fn default_max_edit_distance() -> f32 {
    0.15
}

fn default_min_similarity() -> f32 {
    0.8
}

fn default_similarity_weight() -> f32 {
    0.7
}

fn default_edit_weight() -> f32 {
    0.2
}

fn default_jaccard_weight() -> f32 {
    0.1
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_edit_distance: default_max_edit_distance(),
            min_similarity: default_min_similarity(),
            similarity_weight: default_similarity_weight(),
            edit_weight: default_edit_weight(),
            jaccard_weight: default_jaccard_weight(),
        }
    }
}

pub struct CandidateRanker {
    catalog: Arc<TemplateCatalog>,
    config: MatchingConfig,
}

impl CandidateRanker {
    pub fn new(catalog: Arc<TemplateCatalog>, config: MatchingConfig) -> Self {
        Self { catalog, config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Scores the nearest templates. Acceptable candidates come first in
    /// preference order, followed by the rejected ones.
    pub fn rank(&self, canonical_sql: &str, embedding: &[f32]) -> Result<Vec<CandidateMatch>> {
        let k = self.config.top_k.clamp(3, 5);
        let neighbours = self.catalog.nearest_neighbors(embedding, k)?;
        let draft_tokens = sql_tokens(canonical_sql);

        let mut candidates: Vec<CandidateMatch> = neighbours
            .into_iter()
            .filter_map(|(id, similarity)| {
                self.catalog
                    .get(id)
                    .map(|template| self.score(canonical_sql, &draft_tokens, &template, similarity))
            })
            .collect();

        candidates.sort_by(|a, b| {
            let accept_a = self.is_acceptable(a);
            let accept_b = self.is_acceptable(b);
            accept_b.cmp(&accept_a).then_with(|| preference(a, b))
        });

        for candidate in &candidates {
            debug!(
                template_id = candidate.template_id,
                similarity = candidate.similarity,
                edit_distance = candidate.edit_distance,
                jaccard = candidate.jaccard,
                confidence = candidate.confidence,
                "Scored template candidate"
            );
        }

        Ok(candidates)
    }

    /// The preferred acceptable candidate, or `NoTemplateMatch`.
    pub fn best_match(&self, canonical_sql: &str, embedding: &[f32]) -> Result<CandidateMatch> {
        let candidates = self.rank(canonical_sql, embedding)?;
        match candidates.into_iter().next() {
            Some(best) if self.is_acceptable(&best) => {
                info!(
                    template_id = best.template_id,
                    similarity = best.similarity,
                    edit_distance = best.edit_distance,
                    "Template match accepted"
                );
                Ok(best)
            }
            Some(best) => {
                info!(
                    template_id = best.template_id,
                    similarity = best.similarity,
                    edit_distance = best.edit_distance,
                    "Nearest template rejected"
                );
                Err(AppError::NoTemplateMatch)
            }
            None => Err(AppError::NoTemplateMatch),
        }
    }

    pub fn is_acceptable(&self, candidate: &CandidateMatch) -> bool {
        candidate.edit_distance < self.config.max_edit_distance
            && candidate.similarity > self.config.min_similarity
    }

    fn score(
        &self,
        canonical_sql: &str,
        draft_tokens: &std::collections::HashSet<String>,
        template: &Template,
        similarity: f32,
    ) -> CandidateMatch {
        let edit_distance = normalized_levenshtein(canonical_sql, &template.canonical_sql);
        let jaccard = jaccard(draft_tokens, &sql_tokens(&template.canonical_sql));
        let confidence = (self.config.similarity_weight * similarity.max(0.0)
            + self.config.edit_weight * (1.0 - edit_distance)
            + self.config.jaccard_weight * jaccard)
            .clamp(0.0, 1.0);

        CandidateMatch {
            template_id: template.id,
            similarity,
            edit_distance,
            jaccard,
            confidence,
            usage_count: template.usage_count,
        }
    }
}

/// Highest similarity, then higher usage, then lower id.
fn preference(a: &CandidateMatch, b: &CandidateMatch) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then(b.usage_count.cmp(&a.usage_count))
        .then(a.template_id.cmp(&b.template_id))
}

/// Levenshtein distance over chars divided by the longer length.
/// 0 means identical, 1 means nothing in common.
pub fn normalized_levenshtein(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }
    if a.is_empty() || b.is_empty() {
        return 1.0;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=b.len() {
            let cost = if *ca == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()] as f32 / longest as f32
}

pub fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union as f32
}
