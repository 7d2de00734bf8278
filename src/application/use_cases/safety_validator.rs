//! Safety Validator for generated and templated SQL
//!
//! Deterministic gate that runs on every statement before execution,
//! regardless of where the statement came from:
//! - exactly one top-level statement, and it is a read-only SELECT (CTEs allowed)
//! - no DDL/DML keyword anywhere, including SQL fragments hidden in strings
//! - no comments, no stray or encoded statement terminators
//! - join depth, predicate count and LIMIT stay under configured ceilings
//!
//! Security philosophy: deny by default, every failure names its rule code.

use super::sql_normalizer::{analyze_shape, QueryShape};
use crate::domain::error::{AppError, Result};
use crate::domain::parameter::{ParamValue, ParameterSet};
use crate::domain::query::{BoundStatement, RuleCode, ValidationResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Statement, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::collections::HashSet;
use tracing::{debug, warn};

static ENCODED_TERMINATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[\x{037E}\x{FF1B}\x{FE54}\x{0000}]|%3b|\\x3b|\\u003b|&#59;|&#x3b;|chr\s*\(\s*59\s*\)")
        .unwrap()
});

static EMBEDDED_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        ;\s*(insert|update|delete|drop|alter|truncate|create|grant|revoke|copy|execute|call|merge|vacuum)\b
        | \binsert\s+into\b
        | \bupdate\s+\w+\s+set\b
        | \bdelete\s+from\b
        | \bdrop\s+(table|database|schema|view|index|function|role|user|extension|trigger)\b
        | \balter\s+(table|database|schema|role|user|system|view)\b
        | \btruncate\s+(table\s+)?\w+
        | \bcreate\s+(or\s+replace\s+)?(table|database|schema|view|index|function|role|user|extension|trigger)\b
        | \b(grant|revoke)\s+\w+\s+on\b
        | \bcopy\s+\w+\s+(to|from)\b
        | \bexec(ute)?\s*\(",
    )
    .unwrap()
});

/// Policy knobs for the validator
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyRules {
    /// Maximum joins inside any single query block
    #[serde(default = "default_max_joins")]
    pub max_joins: usize,
    /// Maximum comparison predicates across the whole statement
    #[serde(default = "default_max_predicates")]
    pub max_predicates: usize,
    /// Ceiling for a top-level LIMIT
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
    #[serde(default)]
    pub require_limit: bool,
    #[serde(default)]
    pub allow_set_operations: bool,
    #[serde(default = "default_max_sql_length")]
    pub max_sql_length: usize,
    /// Statement keywords that may not appear as bare words (case-insensitive)
    #[serde(default = "default_forbidden_keywords")]
    pub forbidden_keywords: Vec<String>,
    /// Function name prefixes that may not be called
    #[serde(default = "default_forbidden_function_prefixes")]
    pub forbidden_function_prefixes: Vec<String>,
    /// Relations the query may read. Empty allows any relation.
    #[serde(default)]
    pub allowed_tables: Vec<String>,
}

fn default_max_joins() -> usize {
    5
}

fn default_max_predicates() -> usize {
    10
}

fn default_max_limit() -> u64 {
    1000
}

fn default_max_sql_length() -> usize {
    5000
}

fn default_forbidden_keywords() -> Vec<String> {
    [
        "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
        "COPY", "EXECUTE", "EXEC", "CALL", "MERGE", "UPSERT", "VACUUM", "REINDEX", "CLUSTER",
        "LOCK", "PREPARE", "DEALLOCATE", "LISTEN", "NOTIFY", "ATTACH", "DETACH", "PRAGMA",
        "REFRESH", "DO",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_forbidden_function_prefixes() -> Vec<String> {
    ["pg_", "dblink", "lo_", "set_config", "current_setting", "query_to_xml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SafetyRules {
    fn default() -> Self {
        Self {
            max_joins: default_max_joins(),
            max_predicates: default_max_predicates(),
            max_limit: default_max_limit(),
            require_limit: false,
            allow_set_operations: false,
            max_sql_length: default_max_sql_length(),
            forbidden_keywords: default_forbidden_keywords(),
            forbidden_function_prefixes: default_forbidden_function_prefixes(),
            allowed_tables: Vec::new(),
        }
    }
}

/// A statement that passed validation. Only the validator can create one,
/// so the execution gate cannot be handed unchecked SQL.
#[derive(Debug, Clone)]
pub struct ValidatedStatement {
    statement: BoundStatement,
}

impl ValidatedStatement {
    pub fn sql(&self) -> &str {
        &self.statement.sql
    }

    pub fn params(&self) -> &ParameterSet {
        &self.statement.params
    }

    pub fn template_id(&self) -> Option<i64> {
        self.statement.template_id
    }
}

pub struct SafetyValidator {
    rules: SafetyRules,
    forbidden: HashSet<String>,
    allowed_tables: HashSet<String>,
}

impl SafetyValidator {
    pub fn new(rules: SafetyRules) -> Self {
        let forbidden = rules
            .forbidden_keywords
            .iter()
            .map(|k| k.to_ascii_uppercase())
            .collect();
        let allowed_tables = rules
            .allowed_tables
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        Self {
            rules,
            forbidden,
            allowed_tables,
        }
    }

    pub fn rules(&self) -> &SafetyRules {
        &self.rules
    }

    pub fn validate(&self, sql: &str) -> ValidationResult {
        self.validate_with_params(sql, &ParameterSet::default())
    }

    /// Runs every rule. Parameters are only consulted to resolve a
    /// placeholder LIMIT.
    pub fn validate_with_params(&self, sql: &str, params: &ParameterSet) -> ValidationResult {
        let mut result = ValidationResult::pass();

        if sql.trim().is_empty() {
            result.add(RuleCode::EmptyQuery, "Query is empty");
            return result;
        }
        if sql.len() > self.rules.max_sql_length {
            result.add(
                RuleCode::QueryTooLong,
                format!(
                    "Query is {} bytes, limit is {}",
                    sql.len(),
                    self.rules.max_sql_length
                ),
            );
        }
        if ENCODED_TERMINATOR.is_match(sql) {
            result.add(
                RuleCode::EncodedTerminator,
                "Query contains an encoded or look-alike statement terminator",
            );
        }

        if !self.check_tokens(sql, &mut result) {
            return result;
        }

        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(statements) => statements,
            Err(e) => {
                result.add(RuleCode::ParseFailure, format!("Query does not parse: {}", e));
                return result;
            }
        };

        match statements.len() {
            0 => result.add(RuleCode::EmptyQuery, "Query contains no statement"),
            1 => {}
            n => result.add(
                RuleCode::MultipleStatements,
                format!("Expected one statement, found {}", n),
            ),
        }

        for statement in &statements {
            self.check_statement(statement, params, &mut result);
        }

        if !result.passed() {
            debug!("Safety validation failed: {}", result.describe());
        }
        result
    }

    /// Validates a bound statement and wraps it for execution.
    pub fn approve(&self, statement: BoundStatement) -> Result<ValidatedStatement> {
        let result = self.validate_with_params(&statement.sql, &statement.params);
        if !result.passed() {
            warn!(
                "Rejected statement (template {:?}): {}",
                statement.template_id,
                result.describe()
            );
            return Err(AppError::SafetyViolation(result.codes()));
        }

        let expected = placeholder_count(&statement.sql);
        if expected != statement.params.len() {
            return Err(AppError::ParameterArityMismatch {
                expected,
                actual: statement.params.len(),
            });
        }

        Ok(ValidatedStatement { statement })
    }

    /// Token-level rules. Returns false when tokenization itself failed.
    fn check_tokens(&self, sql: &str, result: &mut ValidationResult) -> bool {
        let dialect = PostgreSqlDialect {};
        let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => {
                result.add(RuleCode::ParseFailure, format!("Query does not tokenize: {}", e));
                return false;
            }
        };

        let mut pending_semicolon = false;
        for token in &tokens {
            match token {
                Token::Whitespace(Whitespace::SingleLineComment { .. })
                | Token::Whitespace(Whitespace::MultiLineComment(_)) => {
                    result.add(RuleCode::CommentNotAllowed, "Comments are not allowed");
                }
                Token::Whitespace(_) | Token::EOF => {}
                Token::SemiColon => {
                    if pending_semicolon {
                        result.add(
                            RuleCode::MultipleStatements,
                            "Repeated statement terminator",
                        );
                    }
                    pending_semicolon = true;
                }
                other => {
                    if pending_semicolon {
                        result.add(
                            RuleCode::MultipleStatements,
                            "Content follows a statement terminator",
                        );
                        pending_semicolon = false;
                    }
                    self.check_token(other, result);
                }
            }
        }
        true
    }

    fn check_token(&self, token: &Token, result: &mut ValidationResult) {
        match token {
            Token::Word(word) if word.quote_style.is_none() => {
                let upper = word.value.to_ascii_uppercase();
                if self.forbidden.contains(&upper) {
                    result.add(
                        RuleCode::ForbiddenKeyword,
                        format!("Forbidden keyword: {}", upper),
                    );
                }
            }
            Token::SingleQuotedString(text)
            | Token::EscapedStringLiteral(text)
            | Token::NationalStringLiteral(text) => self.check_embedded(text, result),
            Token::DollarQuotedString(dollar) => self.check_embedded(&dollar.value, result),
            _ => {}
        }
    }

    fn check_embedded(&self, text: &str, result: &mut ValidationResult) {
        if EMBEDDED_STATEMENT.is_match(text) {
            result.add(
                RuleCode::EmbeddedForbiddenKeyword,
                "String literal contains an embedded SQL statement",
            );
        }
    }

    fn check_statement(
        &self,
        statement: &Statement,
        params: &ParameterSet,
        result: &mut ValidationResult,
    ) {
        if !matches!(statement, Statement::Query(_)) {
            result.add(
                RuleCode::ForbiddenStatementType,
                "Only SELECT statements are allowed",
            );
        }

        let shape = analyze_shape(statement);
        if shape.non_query_statements > 0 || shape.non_select_bodies > 0 {
            result.add(
                RuleCode::ForbiddenStatementType,
                "Statement contains a non-SELECT component",
            );
        }
        if shape.set_operations > 0 && !self.rules.allow_set_operations {
            result.add(
                RuleCode::SetOperationNotAllowed,
                "UNION / INTERSECT / EXCEPT are not allowed",
            );
        }
        if shape.select_into {
            result.add(RuleCode::SelectInto, "SELECT INTO creates a table");
        }
        if shape.locking_clauses > 0 {
            result.add(RuleCode::LockingClause, "Row locking clauses are not allowed");
        }
        for function in &shape.functions {
            let bare = function.rsplit('.').next().unwrap_or(function);
            if self
                .rules
                .forbidden_function_prefixes
                .iter()
                .any(|prefix| bare.starts_with(&prefix.to_lowercase()))
            {
                result.add(
                    RuleCode::ForbiddenFunction,
                    format!("Function '{}' is not allowed", function),
                );
            }
        }
        self.check_tables(&shape, result);
        self.check_ceilings(&shape, params, result);
    }

    fn check_tables(&self, shape: &QueryShape, result: &mut ValidationResult) {
        for relation in &shape.relations {
            let bare = relation.rsplit('.').next().unwrap_or(relation);
            if is_system_relation(relation) {
                result.add(
                    RuleCode::TableNotAllowed,
                    format!("System catalog '{}' is not readable", relation),
                );
                continue;
            }
            if self.allowed_tables.is_empty() {
                continue;
            }
            if !self.allowed_tables.contains(relation) && !self.allowed_tables.contains(bare) {
                result.add(
                    RuleCode::TableNotAllowed,
                    format!("Table '{}' is not in the allowlist", relation),
                );
            }
        }
    }

    fn check_ceilings(
        &self,
        shape: &QueryShape,
        params: &ParameterSet,
        result: &mut ValidationResult,
    ) {
        if shape.max_joins > self.rules.max_joins {
            result.add(
                RuleCode::JoinDepthExceeded,
                format!(
                    "Query joins {} tables in one block, limit is {}",
                    shape.max_joins, self.rules.max_joins
                ),
            );
        }
        if shape.predicates > self.rules.max_predicates {
            result.add(
                RuleCode::PredicateCountExceeded,
                format!(
                    "Query has {} predicates, limit is {}",
                    shape.predicates, self.rules.max_predicates
                ),
            );
        }

        match &shape.top_level_limit {
            None => {
                if self.rules.require_limit {
                    result.add(RuleCode::MissingLimit, "Query must carry a LIMIT");
                }
            }
            Some(limit) => {
                if let Some(value) = resolve_limit(limit, params) {
                    if value > self.rules.max_limit {
                        result.add(
                            RuleCode::LimitExceeded,
                            format!("LIMIT {} exceeds ceiling {}", value, self.rules.max_limit),
                        );
                    }
                }
            }
        }
    }
}

fn is_system_relation(relation: &str) -> bool {
    let bare = relation.rsplit('.').next().unwrap_or(relation);
    bare.starts_with("pg_")
        || relation.starts_with("pg_catalog.")
        || relation.starts_with("information_schema.")
}

/// Numeric LIMIT, looking placeholders up in the bound parameters.
/// Non-numeric limits resolve to `u64::MAX` so they fail the ceiling.
fn resolve_limit(limit: &Expr, params: &ParameterSet) -> Option<u64> {
    let text = match limit {
        Expr::Value(Value::Number(n, _)) => n.clone(),
        Expr::Value(Value::Placeholder(p)) => {
            let index: usize = p.trim_start_matches('$').parse().ok()?;
            match params.get(index.checked_sub(1)?)? {
                ParamValue::Number(n) => n.clone(),
                ParamValue::String(s) => s.trim().to_string(),
                _ => return Some(u64::MAX),
            }
        }
        Expr::Value(Value::Null) => return None,
        _ => return Some(u64::MAX),
    };
    Some(text.parse::<u64>().unwrap_or(u64::MAX))
}

/// Distinct `$n` placeholders in the statement text.
pub fn placeholder_count(sql: &str) -> usize {
    let dialect = PostgreSqlDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, sql).tokenize() else {
        return 0;
    };
    tokens
        .iter()
        .filter_map(|t| match t {
            Token::Placeholder(p) => Some(p.as_str()),
            _ => None,
        })
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(SafetyRules::default())
    }

    fn codes(sql: &str) -> Vec<RuleCode> {
        validator().validate(sql).codes()
    }

    #[test]
    fn test_plain_select_passes() {
        let result = validator().validate(
            "SELECT p.provider_name, pp.average_covered_charges FROM providers p JOIN provider_procedures pp ON p.provider_id = pp.provider_id WHERE pp.drg_code = '470' ORDER BY pp.average_covered_charges LIMIT 10",
        );
        assert!(result.passed(), "{}", result.describe());
    }

    #[test]
    fn test_cte_of_selects_passes() {
        let result = validator().validate(
            "WITH cheap AS (SELECT provider_id FROM provider_procedures WHERE average_covered_charges < 5000) SELECT p.provider_name FROM providers p JOIN cheap c ON c.provider_id = p.provider_id",
        );
        assert!(result.passed(), "{}", result.describe());
    }

    #[test]
    fn test_delete_is_forbidden_statement_type() {
        let found = codes("DELETE FROM providers WHERE drg_code='470'");
        assert!(found.contains(&RuleCode::ForbiddenStatementType));
    }

    #[test]
    fn test_stacked_statements_fail() {
        let found = codes("SELECT 1; DELETE FROM x");
        assert!(found.contains(&RuleCode::MultipleStatements));
        assert!(found.contains(&RuleCode::ForbiddenKeyword));
    }

    #[test]
    fn test_trailing_semicolon_is_fine() {
        assert!(validator().validate("SELECT 1;").passed());
        assert!(validator().validate("SELECT 1;  \n").passed());
    }

    #[test]
    fn test_union_injection_fails() {
        let found = codes("SELECT * FROM x WHERE 1=1 UNION SELECT password FROM y");
        assert!(found.contains(&RuleCode::SetOperationNotAllowed));
    }

    #[test]
    fn test_comment_hidden_statement_fails() {
        let line = codes("SELECT * FROM providers -- ; DROP TABLE providers");
        assert!(line.contains(&RuleCode::CommentNotAllowed));
        let block = codes("SELECT * FROM providers /* DROP */");
        assert!(block.contains(&RuleCode::CommentNotAllowed));
    }

    #[test]
    fn test_encoded_terminators_fail() {
        assert!(codes("SELECT 1 %3B DROP TABLE t").contains(&RuleCode::EncodedTerminator));
        assert!(codes("SELECT 1\u{037E} SELECT 2").contains(&RuleCode::EncodedTerminator));
        assert!(codes("SELECT chr(59)").contains(&RuleCode::EncodedTerminator));
    }

    #[test]
    fn test_embedded_sql_in_string_fails() {
        let found = codes("SELECT * FROM providers WHERE provider_name = 'x; DROP TABLE providers'");
        assert!(found.contains(&RuleCode::EmbeddedForbiddenKeyword));
    }

    #[test]
    fn test_plain_words_in_strings_pass() {
        let result =
            validator().validate("SELECT * FROM providers WHERE provider_name = 'Drop-In Care Center'");
        assert!(result.passed(), "{}", result.describe());
    }

    #[test]
    fn test_quoted_identifier_is_not_a_keyword() {
        let result = validator().validate("SELECT \"update\" FROM audit_view");
        assert!(result.passed(), "{}", result.describe());
    }

    #[test]
    fn test_data_modifying_cte_fails() {
        let found = codes("WITH gone AS (DELETE FROM providers RETURNING *) SELECT * FROM gone");
        assert!(found.contains(&RuleCode::ForbiddenKeyword));
    }

    #[test]
    fn test_select_into_and_locks_fail() {
        assert!(codes("SELECT * INTO backup FROM providers").contains(&RuleCode::SelectInto));
        assert!(codes("SELECT * FROM providers FOR SHARE").contains(&RuleCode::LockingClause));
    }

    #[test]
    fn test_forbidden_functions() {
        assert!(codes("SELECT pg_sleep(10)").contains(&RuleCode::ForbiddenFunction));
        assert!(codes("SELECT dblink_exec('host=x', 'vacuum')")
            .contains(&RuleCode::ForbiddenFunction));
        assert!(codes("SELECT * FROM pg_catalog.pg_authid").contains(&RuleCode::TableNotAllowed));
        assert!(codes("SELECT * FROM lo_get(16400) AS t LIMIT 5")
            .contains(&RuleCode::ForbiddenFunction));
        assert!(codes("SELECT * FROM current_setting('data_directory') AS t LIMIT 5")
            .contains(&RuleCode::ForbiddenFunction));
        assert!(codes("SELECT * FROM providers p, LATERAL pg_ls_dir('.') AS f LIMIT 5")
            .contains(&RuleCode::ForbiddenFunction));
        let series = validator().validate("SELECT * FROM generate_series(1, 5) AS g LIMIT 5");
        assert!(series.passed(), "{}", series.describe());
    }

    #[test]
    fn test_join_ceiling() {
        let rules = SafetyRules {
            max_joins: 1,
            ..SafetyRules::default()
        };
        let result = SafetyValidator::new(rules).validate(
            "SELECT * FROM a JOIN b ON a.id = b.id JOIN c ON b.id = c.id",
        );
        assert!(result.has(RuleCode::JoinDepthExceeded));
    }

    #[test]
    fn test_predicate_ceiling() {
        let rules = SafetyRules {
            max_predicates: 2,
            ..SafetyRules::default()
        };
        let result = SafetyValidator::new(rules)
            .validate("SELECT * FROM t WHERE a = 1 AND b = 2 AND c > 3");
        assert!(result.has(RuleCode::PredicateCountExceeded));
    }

    #[test]
    fn test_limit_ceiling_literal_and_placeholder() {
        assert!(codes("SELECT * FROM t LIMIT 5000").contains(&RuleCode::LimitExceeded));
        assert!(validator().validate("SELECT * FROM t LIMIT 50").passed());

        let params = ParameterSet::new(vec![
            ParamValue::String("CA".into()),
            ParamValue::Number("100000".into()),
        ]);
        let result = validator()
            .validate_with_params("SELECT * FROM providers WHERE provider_state = $1 LIMIT $2", &params);
        assert!(result.has(RuleCode::LimitExceeded));
    }

    #[test]
    fn test_missing_limit_when_required() {
        let rules = SafetyRules {
            require_limit: true,
            ..SafetyRules::default()
        };
        let result = SafetyValidator::new(rules).validate("SELECT * FROM providers");
        assert!(result.has(RuleCode::MissingLimit));
    }

    #[test]
    fn test_table_allowlist() {
        let rules = SafetyRules {
            allowed_tables: vec!["providers".into(), "provider_ratings".into()],
            ..SafetyRules::default()
        };
        let validator = SafetyValidator::new(rules);
        assert!(validator.validate("SELECT * FROM public.providers").passed());
        assert!(validator
            .validate("SELECT usename FROM pg_user")
            .has(RuleCode::TableNotAllowed));
    }

    #[test]
    fn test_approve_checks_arity() {
        let statement = BoundStatement {
            sql: "SELECT * FROM providers WHERE provider_state = $1 AND provider_city = $2".into(),
            params: ParameterSet::new(vec![ParamValue::String("CA".into())]),
            template_id: Some(3),
        };
        let err = validator().approve(statement).unwrap_err();
        assert!(matches!(
            err,
            AppError::ParameterArityMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_approve_wraps_passing_statement() {
        let statement = BoundStatement {
            sql: "SELECT * FROM providers WHERE provider_state = $1".into(),
            params: ParameterSet::new(vec![ParamValue::String("CA".into())]),
            template_id: Some(3),
        };
        let validated = validator().approve(statement).unwrap();
        assert_eq!(validated.template_id(), Some(3));
        assert_eq!(validated.params().len(), 1);
    }

    const SAFE_BASES: &[&str] = &[
        "SELECT provider_name FROM providers WHERE provider_state = 'NY'",
        "SELECT p.provider_name FROM providers p JOIN provider_ratings r ON p.provider_id = r.provider_id WHERE r.overall_rating > 3",
        "SELECT drg_code, COUNT(*) FROM provider_procedures GROUP BY drg_code",
    ];

    const UNSAFE_FRAGMENTS: &[&str] = &[
        "; DROP TABLE providers; --",
        "; DELETE FROM x",
        "; INSERT INTO t VALUES (1)",
        "; UPDATE providers SET provider_name = 'x'",
        "; ALTER TABLE providers ADD COLUMN c int",
        "; TRUNCATE providers",
        "; GRANT ALL ON providers TO public",
        "; COPY providers TO '/tmp/out'",
        "; CREATE TABLE z (a int)",
        "; EXECUTE stmt",
        " UNION SELECT password FROM users",
        " /* */; DROP TABLE t",
        "%3B DROP TABLE providers",
        "\u{FF1B} DELETE FROM providers",
    ];

    proptest! {
        #[test]
        fn prop_unsafe_fragments_always_fail(
            base in prop::sample::select(SAFE_BASES),
            fragment in prop::sample::select(UNSAFE_FRAGMENTS),
            quoted in any::<bool>(),
        ) {
            prop_assert!(validator().validate(base).passed());

            let sql = if quoted {
                format!("{} AND 'x' = '{}'", base.replace(" GROUP BY", " WHERE 1 = 1 GROUP BY"), fragment.replace('\'', "''"))
            } else {
                format!("{}{}", base, fragment)
            };
            let fragment_is_pure_select = fragment.trim_start().starts_with("UNION") && quoted;
            if !fragment_is_pure_select {
                let result = validator().validate(&sql);
                prop_assert!(!result.passed(), "accepted unsafe SQL: {}", sql);
            }
        }

        #[test]
        fn prop_breakout_from_string_fails(
            keyword in prop::sample::select(vec!["DROP TABLE t", "DELETE FROM t", "INSERT INTO t VALUES (1)", "UPDATE t SET a = 1"]),
        ) {
            let sql = format!("SELECT * FROM providers WHERE provider_name = ''; {}; --'", keyword);
            prop_assert!(!validator().validate(&sql).passed());
        }
    }
}
