//! Prompt construction for the generation collaborator
//!
//! One prompt serves both paths: it lists catalog templates the model may pick
//! by id (fast path tool choice) and otherwise asks for a single read-only
//! PostgreSQL SELECT (slow path).

use crate::domain::prompt::GenerationPrompt;
use crate::domain::query::RowSet;
use crate::domain::template::Template;
use std::fmt::Write;

/// Relations the generated SQL may reference.
pub const HEALTHCARE_SCHEMA: &[(&str, &[&str])] = &[
    (
        "providers",
        &[
            "provider_id",
            "provider_name",
            "provider_city",
            "provider_state",
            "provider_zip_code",
            "provider_address",
            "provider_state_fips",
            "provider_ruca",
            "provider_ruca_description",
        ],
    ),
    ("drg_procedures", &["drg_code", "drg_description"]),
    (
        "provider_procedures",
        &[
            "id",
            "provider_id",
            "drg_code",
            "total_discharges",
            "average_covered_charges",
            "average_total_payments",
            "average_medicare_payments",
        ],
    ),
    (
        "provider_ratings",
        &[
            "id",
            "provider_id",
            "overall_rating",
            "quality_rating",
            "safety_rating",
            "patient_experience_rating",
        ],
    ),
];

pub struct PromptBuilder {
    max_examples: usize,
    default_limit: u64,
    tables: Vec<(String, Vec<String>)>,
}

impl PromptBuilder {
    pub fn new(max_examples: usize, default_limit: u64) -> Self {
        let tables = HEALTHCARE_SCHEMA
            .iter()
            .map(|(name, columns)| {
                (
                    name.to_string(),
                    columns.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect();
        Self {
            max_examples,
            default_limit,
            tables,
        }
    }

    pub fn with_tables(mut self, tables: Vec<(String, Vec<String>)>) -> Self {
        self.tables = tables;
        self
    }

    /// Builds the generation prompt. `templates` are the catalog entries closest
    /// to the question, best first.
    pub fn build(&self, question: &str, templates: &[Template]) -> GenerationPrompt {
        let mut system = String::new();
        system.push_str(
            "You translate questions about US hospital pricing and quality into PostgreSQL.\n",
        );
        system.push_str("Rules:\n");
        system.push_str("- Produce exactly one read-only SELECT statement. Never modify data.\n");
        system.push_str("- Do not use comments, semicolons between statements or UNION.\n");
        let _ = writeln!(
            system,
            "- Always end with a LIMIT clause; use LIMIT {} unless the question asks for a count.",
            self.default_limit
        );
        system.push_str("- Only use the tables and columns listed below.\n\n");
        self.add_schema_info(&mut system);

        if !templates.is_empty() {
            system.push_str("## Templates\n");
            system.push_str(
                "If one template answers the question, reply with JSON only: \
                 {\"template_id\": <id>, \"parameters\": [<value for $1>, <value for $2>, ...]}\n\n",
            );
            for template in templates {
                self.add_template(&mut system, template);
            }
            system.push('\n');
        }

        let examples: Vec<&Template> = templates.iter().take(self.max_examples).collect();
        if !examples.is_empty() {
            system.push_str("## Examples\n\n");
            for (idx, template) in examples.iter().enumerate() {
                let _ = writeln!(system, "### Example {}", idx + 1);
                let _ = writeln!(system, "**Intent:** {}", template.description);
                let _ = writeln!(system, "**SQL:** {}\n", template.raw_sql);
            }
        }

        system.push_str("## Output Format\n");
        system.push_str(
            "Either the template JSON above or the SQL query alone, without explanation.",
        );

        GenerationPrompt::new(system, format!("Question: {}", question.trim()))
    }

    fn add_template(&self, out: &mut String, template: &Template) {
        let slots: Vec<String> = template
            .parameter_types
            .iter()
            .enumerate()
            .map(|(i, t)| match t {
                Some(t) => format!("${}: {}", i + 1, t),
                None => format!("${}", i + 1),
            })
            .collect();
        let _ = writeln!(
            out,
            "- id {}: {} [{}]",
            template.id,
            template.description,
            slots.join(", ")
        );
    }

    fn add_schema_info(&self, out: &mut String) {
        out.push_str("## Available Tables\n\n");
        for (table_name, columns) in &self.tables {
            let _ = writeln!(out, "**{}**", table_name);
            let _ = writeln!(out, "Columns: {}", columns.join(", "));
        }
        out.push('\n');
    }

    /// Prompt asking for a plain-language summary of executed results.
    pub fn build_explanation_prompt(
        &self,
        question: &str,
        sql: &str,
        rows: &RowSet,
        sample_rows: usize,
    ) -> GenerationPrompt {
        let sample: Vec<_> = rows.rows.iter().take(sample_rows).collect();
        let sample_json = serde_json::to_string(&sample).unwrap_or_else(|_| "[]".to_string());
        let system = "You are a healthcare cost assistant. Answer the user's question from the query results in two or three sentences. Mention concrete names and amounts. Do not describe the SQL.";
        let user = format!(
            "**User Question:** {}\n**SQL Query:** {}\n**Results Found:** {}{}\n**Rows:** {}",
            question,
            sql,
            rows.row_count,
            if rows.truncated { " (truncated)" } else { "" },
            sample_json
        );
        GenerationPrompt::new(system, user)
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(3, 20)
    }
}
