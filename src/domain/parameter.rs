use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static DECIMAL_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(?:\d+(?:\.\d*)?|\.\d+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Number,
    String,
    /// Quoted text made only of digits, such as DRG or ZIP codes.
    NumericText,
    Boolean,
    Array,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Number => "number",
            ParamType::String => "string",
            ParamType::NumericText => "numeric_text",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
        };
        f.write_str(name)
    }
}

/// A literal lifted out of a query. Numbers keep their source text so that
/// precision survives until the driver binds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    Number(String),
    String(String),
    Boolean(bool),
    Array(Vec<ParamValue>),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Number(_) => ParamType::Number,
            ParamValue::String(_) => ParamType::String,
            ParamValue::Boolean(_) => ParamType::Boolean,
            ParamValue::Array(_) => ParamType::Array,
        }
    }

    /// Type recorded for a template slot. Narrower than [`param_type`](Self::param_type):
    /// a string of digits is remembered as a code so later bindings must be
    /// numeric too.
    pub fn slot_type(&self) -> ParamType {
        match self {
            ParamValue::String(s) if is_code(s) => ParamType::NumericText,
            other => other.param_type(),
        }
    }

    /// Identity used to share one placeholder between repeated literals.
    pub fn dedupe_key(&self) -> String {
        match self {
            ParamValue::Number(n) => format!("n:{}", n),
            ParamValue::String(s) => format!("s:{}", s),
            ParamValue::Boolean(b) => format!("b:{}", b),
            ParamValue::Array(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.dedupe_key()).collect();
                format!("a:[{}]", inner.join(","))
            }
        }
    }

    /// Reads a tool-choice argument. `null` and objects are not bindable.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => Some(ParamValue::Number(n.to_string())),
            serde_json::Value::String(s) => Some(ParamValue::String(s.clone())),
            serde_json::Value::Bool(b) => Some(ParamValue::Boolean(*b)),
            serde_json::Value::Array(items) => items
                .iter()
                .map(ParamValue::from_json)
                .collect::<Option<Vec<_>>>()
                .map(ParamValue::Array),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Number(n) => n
                .parse::<i64>()
                .map(serde_json::Value::from)
                .or_else(|_| n.parse::<f64>().map(serde_json::Value::from))
                .unwrap_or_else(|_| serde_json::Value::String(n.clone())),
            ParamValue::String(s) => serde_json::Value::String(s.clone()),
            ParamValue::Boolean(b) => serde_json::Value::Bool(*b),
            ParamValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
        }
    }

    pub fn is_numeric_text(&self) -> bool {
        match self {
            ParamValue::Number(_) => true,
            ParamValue::String(s) => is_decimal_text(s.trim()),
            _ => false,
        }
    }
}

/// Plain decimal notation with a finite value. Rejects `NaN`, `inf` and
/// exponent forms that `f64::from_str` would accept.
fn is_decimal_text(text: &str) -> bool {
    DECIMAL_TEXT.is_match(text) && text.parse::<f64>().is_ok_and(f64::is_finite)
}

fn is_code(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}

/// Ordered literals; index `i` binds placeholder `$i+1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    values: Vec<ParamValue>,
}

impl ParameterSet {
    pub fn new(values: Vec<ParamValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ParamValue> {
        self.values.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ParamValue> {
        self.values.iter()
    }

    pub fn types(&self) -> Vec<ParamType> {
        self.values.iter().map(|v| v.param_type()).collect()
    }

    pub fn slot_types(&self) -> Vec<Option<ParamType>> {
        self.values.iter().map(|v| Some(v.slot_type())).collect()
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<ParamValue> {
        self.values
    }
}

impl From<Vec<ParamValue>> for ParameterSet {
    fn from(values: Vec<ParamValue>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_arguments() {
        assert_eq!(
            ParamValue::from_json(&json!(470)),
            Some(ParamValue::Number("470".into()))
        );
        assert_eq!(
            ParamValue::from_json(&json!(["CA", "NY"])),
            Some(ParamValue::Array(vec![
                ParamValue::String("CA".into()),
                ParamValue::String("NY".into())
            ]))
        );
        assert_eq!(ParamValue::from_json(&json!(null)), None);
        assert_eq!(ParamValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_dedupe_key_distinguishes_types() {
        let number = ParamValue::Number("470".into());
        let text = ParamValue::String("470".into());
        assert_ne!(number.dedupe_key(), text.dedupe_key());
    }

    #[test]
    fn test_slot_type_marks_digit_strings_as_codes() {
        assert_eq!(
            ParamValue::String("470".into()).slot_type(),
            ParamType::NumericText
        );
        assert_eq!(ParamValue::String("NY".into()).slot_type(), ParamType::String);
        assert_eq!(ParamValue::Number("470".into()).slot_type(), ParamType::Number);
        assert_eq!(ParamValue::String("".into()).slot_type(), ParamType::String);
    }

    #[test]
    fn test_numeric_text() {
        assert!(ParamValue::String(" 470 ".into()).is_numeric_text());
        assert!(!ParamValue::String("abc".into()).is_numeric_text());
        assert!(ParamValue::String("-12.50".into()).is_numeric_text());
        for word in ["NaN", "nan", "inf", "-Infinity", "1e5", "", "."] {
            assert!(!ParamValue::String(word.into()).is_numeric_text(), "{}", word);
        }
        assert!(ParamValue::Number("3.5".into()).is_numeric_text());
    }
}
