//! Parameter Binder
//!
//! Pairs a matched template with the draft's extracted values. Arity must
//! match exactly; each value must be compatible with the type the slot was
//! recorded with. Values travel beside the SQL text and are bound by the
//! driver, never interpolated.

use crate::domain::error::{AppError, Result};
use crate::domain::parameter::{ParamType, ParamValue, ParameterSet};
use crate::domain::query::BoundStatement;
use crate::domain::template::Template;
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct ParameterBinder;

impl ParameterBinder {
    pub fn new() -> Self {
        Self
    }

    /// Binds extracted values to `template.raw_sql`.
    pub fn bind(&self, template: &Template, params: &ParameterSet) -> Result<BoundStatement> {
        if params.len() != template.placeholder_count {
            debug!(
                template_id = template.id,
                expected = template.placeholder_count,
                actual = params.len(),
                "Parameter arity mismatch"
            );
            return Err(AppError::ParameterArityMismatch {
                expected: template.placeholder_count,
                actual: params.len(),
            });
        }

        let mut bound = Vec::with_capacity(params.len());
        for (index, value) in params.iter().enumerate() {
            let slot = template.parameter_types.get(index).copied().flatten();
            bound.push(coerce(index + 1, slot, value)?);
        }

        Ok(BoundStatement {
            sql: template.raw_sql.clone(),
            params: ParameterSet::new(bound),
            template_id: Some(template.id),
        })
    }

    /// Binds tool-choice arguments, which arrive as JSON.
    pub fn bind_arguments(
        &self,
        template: &Template,
        arguments: &[serde_json::Value],
    ) -> Result<BoundStatement> {
        let mut values = Vec::with_capacity(arguments.len());
        for (index, argument) in arguments.iter().enumerate() {
            let value = ParamValue::from_json(argument).ok_or_else(|| {
                AppError::ParameterTypeMismatch {
                    position: index + 1,
                    expected: slot_name(template, index),
                    actual: json_kind(argument).to_string(),
                }
            })?;
            values.push(value);
        }
        self.bind(template, &ParameterSet::new(values))
    }
}

fn slot_name(template: &Template, index: usize) -> String {
    template
        .parameter_types
        .get(index)
        .copied()
        .flatten()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "any".to_string())
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Checks `value` against the recorded slot type and converts where the
/// driver needs a different representation.
fn coerce(position: usize, slot: Option<ParamType>, value: &ParamValue) -> Result<ParamValue> {
    let mismatch = || AppError::ParameterTypeMismatch {
        position,
        expected: slot.map(|t| t.to_string()).unwrap_or_else(|| "any".to_string()),
        actual: value.param_type().to_string(),
    };

    match (slot, value) {
        (None, _) => Ok(value.clone()),

        (Some(ParamType::Number), ParamValue::Number(_)) => Ok(value.clone()),
        (Some(ParamType::Number), ParamValue::String(s)) if value.is_numeric_text() => {
            Ok(ParamValue::Number(s.trim().to_string()))
        }

        (Some(ParamType::NumericText), ParamValue::String(s)) if value.is_numeric_text() => {
            Ok(ParamValue::String(s.trim().to_string()))
        }
        (Some(ParamType::NumericText), ParamValue::Number(n)) => Ok(ParamValue::String(n.clone())),

        (Some(ParamType::String), ParamValue::String(_)) => Ok(value.clone()),
        (Some(ParamType::String), ParamValue::Number(n)) => Ok(ParamValue::String(n.clone())),

        (Some(ParamType::Boolean), ParamValue::Boolean(_)) => Ok(value.clone()),

        (Some(ParamType::Array), ParamValue::Array(items)) if !items.is_empty() => {
            Ok(value.clone())
        }

        _ => Err(mismatch()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn template(types: Vec<Option<ParamType>>) -> Template {
        Template {
            id: 7,
            canonical_sql: "select provider_name from providers p join provider_procedures pp on p.provider_id = pp.provider_id where pp.drg_code = $1 and p.provider_state = $2 limit $3".to_string(),
            raw_sql: "SELECT provider_name FROM providers AS p JOIN provider_procedures AS pp ON p.provider_id = pp.provider_id WHERE pp.drg_code = $1 AND p.provider_state = $2 LIMIT $3".to_string(),
            fingerprint: "fp".to_string(),
            embedding: vec![1.0],
            description: "Providers for a DRG in a state".to_string(),
            placeholder_count: types.len(),
            parameter_types: types,
            usage_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn drg_template() -> Template {
        template(vec![
            Some(ParamType::NumericText),
            Some(ParamType::String),
            Some(ParamType::Number),
        ])
    }

    #[test]
    fn test_bind_keeps_values_out_of_sql() {
        let params = ParameterSet::new(vec![
            ParamValue::String("470".into()),
            ParamValue::String("NY'; DROP TABLE providers; --".into()),
            ParamValue::Number("10".into()),
        ]);
        let bound = ParameterBinder::new().bind(&drg_template(), &params).unwrap();
        assert_eq!(bound.sql, drg_template().raw_sql);
        assert!(!bound.sql.contains("DROP"));
        assert_eq!(bound.params.len(), 3);
        assert_eq!(bound.template_id, Some(7));
    }

    #[test]
    fn test_arity_mismatch() {
        let params = ParameterSet::new(vec![ParamValue::String("470".into())]);
        let err = ParameterBinder::new().bind(&drg_template(), &params).unwrap_err();
        assert!(matches!(
            err,
            AppError::ParameterArityMismatch {
                expected: 3,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_numeric_code_slot_rejects_words() {
        let params = ParameterSet::new(vec![
            ParamValue::String("knee".into()),
            ParamValue::String("NY".into()),
            ParamValue::Number("10".into()),
        ]);
        let err = ParameterBinder::new().bind(&drg_template(), &params).unwrap_err();
        assert!(matches!(
            err,
            AppError::ParameterTypeMismatch { position: 1, .. }
        ));
    }

    #[test]
    fn test_number_slot_rejects_text_and_coerces_numeric_text() {
        let binder = ParameterBinder::new();
        let template = template(vec![Some(ParamType::Number)]);
        let ok = binder
            .bind(&template, &ParameterSet::new(vec![ParamValue::String(" 25 ".into())]))
            .unwrap();
        assert_eq!(ok.params.get(0), Some(&ParamValue::Number("25".into())));

        let err = binder
            .bind(&template, &ParameterSet::new(vec![ParamValue::String("many".into())]))
            .unwrap_err();
        assert!(matches!(err, AppError::ParameterTypeMismatch { .. }));

        for word in ["NaN", "inf", "-Infinity"] {
            let err = binder
                .bind(&template, &ParameterSet::new(vec![ParamValue::String(word.into())]))
                .unwrap_err();
            assert!(matches!(err, AppError::ParameterTypeMismatch { .. }), "{}", word);
        }
    }

    #[test]
    fn test_untyped_slot_accepts_anything() {
        let template = template(vec![None]);
        let bound = ParameterBinder::new()
            .bind(&template, &ParameterSet::new(vec![ParamValue::Boolean(true)]))
            .unwrap();
        assert_eq!(bound.params.get(0), Some(&ParamValue::Boolean(true)));
    }

    #[test]
    fn test_bind_tool_choice_arguments() {
        let binder = ParameterBinder::new();
        let bound = binder
            .bind_arguments(&drg_template(), &[json!(470), json!("NY"), json!(5)])
            .unwrap();
        assert_eq!(bound.params.get(0), Some(&ParamValue::String("470".into())));
        assert_eq!(bound.params.get(2), Some(&ParamValue::Number("5".into())));

        let err = binder
            .bind_arguments(&drg_template(), &[json!(null), json!("NY"), json!(5)])
            .unwrap_err();
        assert!(matches!(err, AppError::ParameterTypeMismatch { position: 1, .. }));
    }
}
