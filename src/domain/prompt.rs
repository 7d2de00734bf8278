use serde::{Deserialize, Serialize};

/// Prior attempt fed back to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairContext {
    pub previous_sql: String,
    pub failure_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPrompt {
    pub system: String,
    pub user: String,
    pub repair: Option<RepairContext>,
}

impl GenerationPrompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            repair: None,
        }
    }

    pub fn with_repair(&self, previous_sql: &str, failure_reason: &str) -> Self {
        Self {
            system: self.system.clone(),
            user: self.user.clone(),
            repair: Some(RepairContext {
                previous_sql: previous_sql.to_string(),
                failure_reason: failure_reason.to_string(),
            }),
        }
    }

    /// User message including the repair section, if any.
    pub fn render_user(&self) -> String {
        match &self.repair {
            None => self.user.clone(),
            Some(repair) => format!(
                "{}\n\n## Previous Attempt\nThe query below failed.\n```sql\n{}\n```\nFailure: {}\n\nReturn a corrected SQL query only.",
                self.user, repair.previous_sql, repair.failure_reason
            ),
        }
    }
}
