use crate::application::use_cases::prompt_builder::PromptBuilder;
use crate::application::use_cases::sql_generator::LlmSqlGenerator;
use crate::domain::error::{AppError, Result};
use crate::domain::prompt::GenerationPrompt;
use crate::domain::query::RowSet;
use crate::infrastructure::response::clean_llm_response;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const SAMPLE_ROWS: usize = 10;
const PREVIEW_COLUMNS: usize = 3;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, prompt: &GenerationPrompt) -> Result<String>;
}

#[async_trait]
impl Summarizer for LlmSqlGenerator {
    async fn summarize(&self, prompt: &GenerationPrompt) -> Result<String> {
        let raw = self.complete(&prompt.system, &prompt.render_user()).await?;
        Ok(clean_llm_response(&raw))
    }
}

/// Turns an executed row set into `answer_text`. Summaries are optional; any
/// failure or timeout falls back to a deterministic description.
pub struct AnswerWriter {
    summarizer: Option<Arc<dyn Summarizer>>,
    prompts: PromptBuilder,
    timeout: Duration,
}

impl AnswerWriter {
    pub fn new(summarizer: Option<Arc<dyn Summarizer>>, timeout: Duration) -> Self {
        Self {
            summarizer,
            prompts: PromptBuilder::default(),
            timeout,
        }
    }

    pub fn deterministic() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub async fn write(&self, question: &str, sql: &str, rows: &RowSet) -> String {
        if rows.row_count == 0 {
            return "No matching records were found for this question.".to_string();
        }

        if let Some(summarizer) = &self.summarizer {
            let prompt = self
                .prompts
                .build_explanation_prompt(question, sql, rows, SAMPLE_ROWS);
            let result = tokio::time::timeout(self.timeout, summarizer.summarize(&prompt))
                .await
                .unwrap_or_else(|_| Err(AppError::Generation("summary timed out".to_string())));
            match result {
                Ok(text) if !text.trim().is_empty() => return text,
                Ok(_) => warn!("Summary was empty, using deterministic answer"),
                Err(e) => warn!("Summary failed, using deterministic answer: {}", e),
            }
        }

        describe_rows(rows)
    }
}

/// Plain description of the first row plus the count.
pub fn describe_rows(rows: &RowSet) -> String {
    let noun = if rows.row_count == 1 { "result" } else { "results" };
    let mut text = format!(
        "Found {}{} {}.",
        rows.row_count,
        if rows.truncated { "+" } else { "" },
        noun
    );

    if let Some(first) = rows.rows.first() {
        let preview: Vec<String> = rows
            .columns
            .iter()
            .take(PREVIEW_COLUMNS)
            .filter_map(|column| {
                first.get(column).and_then(|value| match value {
                    serde_json::Value::Null => None,
                    serde_json::Value::String(s) => Some(format!("{}: {}", column, s)),
                    other => Some(format!("{}: {}", column, other)),
                })
            })
            .collect();
        if !preview.is_empty() {
            text.push_str(&format!(" Top result: {}.", preview.join(", ")));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct SlowSummarizer;

    #[async_trait]
    impl Summarizer for SlowSummarizer {
        async fn summarize(&self, _prompt: &GenerationPrompt) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("late".to_string())
        }
    }

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _prompt: &GenerationPrompt) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn rows() -> RowSet {
        let mut row = HashMap::new();
        row.insert("provider_name".to_string(), serde_json::json!("Mercy General"));
        row.insert("average_covered_charges".to_string(), serde_json::json!(18250.5));
        RowSet {
            columns: vec![
                "provider_name".to_string(),
                "average_covered_charges".to_string(),
            ],
            rows: vec![row],
            row_count: 1,
            truncated: false,
        }
    }

    #[test]
    fn test_describe_rows() {
        assert_eq!(
            describe_rows(&rows()),
            "Found 1 result. Top result: provider_name: Mercy General, average_covered_charges: 18250.5."
        );
    }

    #[tokio::test]
    async fn test_empty_rows_skip_summary() {
        let writer = AnswerWriter::new(
            Some(Arc::new(FixedSummarizer("should not be used"))),
            Duration::from_secs(1),
        );
        let answer = writer.write("q", "SELECT 1", &RowSet::default()).await;
        assert!(answer.starts_with("No matching records"));
    }

    #[tokio::test]
    async fn test_summary_used_when_available() {
        let writer = AnswerWriter::new(
            Some(Arc::new(FixedSummarizer("Mercy General is cheapest."))),
            Duration::from_secs(1),
        );
        assert_eq!(
            writer.write("q", "SELECT 1", &rows()).await,
            "Mercy General is cheapest."
        );
    }

    #[tokio::test]
    async fn test_summary_timeout_falls_back() {
        let writer = AnswerWriter::new(Some(Arc::new(SlowSummarizer)), Duration::from_millis(10));
        let answer = writer.write("q", "SELECT 1", &rows()).await;
        assert!(answer.starts_with("Found 1 result."));
    }
}
