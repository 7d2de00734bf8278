use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::parameter::ParamType;

/// A vetted, parameterized query shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    /// Literal-free, lowercased, whitespace-collapsed form.
    pub canonical_sql: String,
    /// Executable form with `$1..$n` placeholders.
    pub raw_sql: String,
    pub fingerprint: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub description: String,
    /// Type observed for each placeholder; `None` accepts any scalar.
    pub parameter_types: Vec<Option<ParamType>>,
    pub placeholder_count: usize,
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert request for the catalog. Produced by seeding or promotion.
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub raw_sql: String,
    pub canonical_sql: String,
    pub fingerprint: String,
    pub embedding: Vec<f32>,
    pub description: String,
    pub parameter_types: Vec<Option<ParamType>>,
    pub placeholder_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateUsage {
    pub template_id: i64,
    pub description: String,
    pub usage_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub template_count: usize,
    pub total_usage: u64,
    pub most_used: Vec<TemplateUsage>,
    /// Number of templates assigned to each index cell.
    pub cell_occupancy: Vec<usize>,
    pub snapshot_version: u64,
}

/// One slow-path success, recorded for promotion counting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintOccurrence {
    pub fingerprint: String,
    pub canonical_sql: String,
    pub raw_sql: String,
    pub parameter_types: Vec<Option<ParamType>>,
    pub placeholder_count: usize,
    pub question: String,
    pub observed_at: DateTime<Utc>,
}
