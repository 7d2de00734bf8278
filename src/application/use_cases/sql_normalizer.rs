//! SQL Normalizer / Fingerprinter
//!
//! Turns untrusted SQL text into a canonical, literal-free shape:
//! - conjunctions are reordered into a fixed total order
//! - literals are lifted into `$n` placeholders (IN lists collapse into one array)
//! - repeated literals share a placeholder
//! - the canonical text is hashed into a structural fingerprint
//!
//! Predicate order under AND: operands are flattened through nested ANDs and
//! sorted by `(subject, predicate)`, where `subject` is the left-hand operand
//! and both keys are the lowercased text of the expression with every literal
//! masked as `?`. Equal keys keep their input order.

use crate::domain::error::{AppError, Result};
use crate::domain::parameter::{ParamValue, ParameterSet};
use crate::domain::query::NormalizedQuery;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlparser::ast::{
    visit_expressions_mut, BinaryOperator, Expr, GroupByExpr, Ident, Query, SetExpr, Statement,
    TableFactor, Value, Visit, VisitMut, Visitor, VisitorMut,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::ControlFlow;
use tracing::debug;

static PLACEHOLDER_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\d+").unwrap());

const AGGREGATES: &[&str] = &["count", "sum", "avg", "min", "max", "array_agg", "string_agg"];

#[derive(Debug, Default, Clone)]
pub struct SqlNormalizer;

impl SqlNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Parses exactly one statement.
    pub fn parse_single(&self, sql: &str) -> Result<Statement> {
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| AppError::Parse(e.to_string()))?;
        match statements.len() {
            0 => Err(AppError::Parse("no SQL statement found".to_string())),
            1 => Ok(statements.remove(0)),
            n => Err(AppError::Parse(format!(
                "expected a single statement, found {}",
                n
            ))),
        }
    }

    pub fn normalize(&self, sql: &str) -> Result<NormalizedQuery> {
        let mut statement = self.parse_single(sql)?;

        let mut reorder = ConjunctionReorder;
        let _ = VisitMut::visit(&mut statement, &mut reorder);

        let mut extractor = LiteralExtractor {
            placeholder_mode: has_placeholder(&statement),
            next_index: 1,
            ..LiteralExtractor::default()
        };
        if let ControlFlow::Break(reason) = VisitMut::visit(&mut statement, &mut extractor) {
            return Err(AppError::Parse(reason));
        }
        if extractor.mixed {
            return Err(AppError::Parse(
                "query mixes bound placeholders with literal values".to_string(),
            ));
        }

        let raw_sql = statement.to_string();
        let canonical_sql = collapse_whitespace(&raw_sql.to_lowercase());
        let fingerprint = Self::fingerprint(&canonical_sql);
        let placeholder_count = extractor.next_index - 1;

        debug!(
            "Normalized query: {} placeholders, fingerprint {}",
            placeholder_count,
            &fingerprint[..12]
        );

        Ok(NormalizedQuery {
            canonical_sql,
            raw_sql,
            parameters: ParameterSet::new(extractor.values),
            placeholder_count,
            fingerprint,
        })
    }

    /// SHA-256 of the canonical text with placeholder numbers masked, so that
    /// queries differing only in literal values hash identically even when
    /// their literals repeat differently.
    pub fn fingerprint(canonical_sql: &str) -> String {
        let shape = PLACEHOLDER_NUMBER.replace_all(canonical_sql, "$$?");
        hex::encode(Sha256::digest(shape.as_bytes()))
    }

    pub fn extract_table_references(&self, sql: &str) -> Result<Vec<String>> {
        let statement = self.parse_single(sql)?;
        Ok(analyze_shape(&statement).relations.into_iter().collect())
    }

    pub fn complexity_score(&self, sql: &str) -> Result<u32> {
        let statement = self.parse_single(sql)?;
        Ok(analyze_shape(&statement).complexity_score())
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased token set used for Jaccard similarity. Literals collapse to
/// a single marker so only shape contributes.
pub fn sql_tokens(sql: &str) -> HashSet<String> {
    let dialect = PostgreSqlDialect {};
    let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens,
        Err(_) => {
            return sql
                .split_whitespace()
                .map(|t| t.to_lowercase())
                .collect()
        }
    };

    tokens
        .into_iter()
        .filter_map(|token| match token {
            Token::Whitespace(_) | Token::EOF => None,
            Token::Word(word) => Some(word.value.to_lowercase()),
            Token::Number(_, _)
            | Token::SingleQuotedString(_)
            | Token::EscapedStringLiteral(_)
            | Token::NationalStringLiteral(_)
            | Token::DollarQuotedString(_) => Some("?".to_string()),
            Token::Placeholder(_) => Some("$".to_string()),
            other => Some(other.to_string().to_lowercase()),
        })
        .collect()
}

fn literal_value(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Number(n, _) => Some(ParamValue::Number(n.clone())),
        Value::SingleQuotedString(s)
        | Value::EscapedStringLiteral(s)
        | Value::NationalStringLiteral(s)
        | Value::DoubleQuotedString(s) => Some(ParamValue::String(s.clone())),
        Value::DollarQuotedString(d) => Some(ParamValue::String(d.value.clone())),
        Value::Boolean(b) => Some(ParamValue::Boolean(*b)),
        _ => None,
    }
}

fn parse_expr(text: &str) -> std::result::Result<Expr, String> {
    Parser::new(&PostgreSqlDialect {})
        .try_with_sql(text)
        .and_then(|mut parser| parser.parse_expr())
        .map_err(|e| format!("failed to rebuild expression `{}`: {}", text, e))
}

fn masked(expr: &Expr) -> String {
    let mut copy = expr.clone();
    let _ = visit_expressions_mut(&mut copy, |e| {
        let literal = matches!(e, Expr::TypedString { .. })
            || matches!(e, Expr::Value(v) if !matches!(v, Value::Null));
        if literal {
            *e = Expr::Identifier(Ident::new("?"));
            return ControlFlow::<()>::Continue(());
        }
        match e {
            Expr::InList { list, .. } => {
                if list
                    .iter()
                    .all(|item| matches!(item, Expr::Identifier(id) if id.value == "?"))
                {
                    list.truncate(1);
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    copy.to_string().to_lowercase()
}

fn predicate_subject(expr: &Expr) -> &Expr {
    match expr {
        Expr::BinaryOp { left, .. } => left,
        Expr::InList { expr, .. }
        | Expr::InSubquery { expr, .. }
        | Expr::Between { expr, .. }
        | Expr::Like { expr, .. }
        | Expr::ILike { expr, .. } => expr,
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => inner,
        Expr::AnyOp { left, .. } | Expr::AllOp { left, .. } => left,
        Expr::Nested(inner) => predicate_subject(inner),
        other => other,
    }
}

fn flatten_and(expr: Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_and(*left, out);
            flatten_and(*right, out);
        }
        Expr::Nested(inner)
            if matches!(
                inner.as_ref(),
                Expr::BinaryOp {
                    op: BinaryOperator::And,
                    ..
                }
            ) =>
        {
            flatten_and(*inner, out);
        }
        other => out.push(other),
    }
}

struct ConjunctionReorder;

impl VisitorMut for ConjunctionReorder {
    type Break = ();

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if !matches!(
            expr,
            Expr::BinaryOp {
                op: BinaryOperator::And,
                ..
            }
        ) {
            return ControlFlow::Continue(());
        }

        let owned = std::mem::replace(expr, Expr::Value(Value::Null));
        let mut operands = Vec::new();
        flatten_and(owned, &mut operands);

        let mut keyed: Vec<((String, String), Expr)> = operands
            .into_iter()
            .map(|e| ((masked(predicate_subject(&e)), masked(&e)), e))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut iter = keyed.into_iter().map(|(_, e)| e);
        if let Some(first) = iter.next() {
            *expr = iter.fold(first, |acc, next| Expr::BinaryOp {
                left: Box::new(acc),
                op: BinaryOperator::And,
                right: Box::new(next),
            });
        }
        ControlFlow::Continue(())
    }
}

/// Lifts literals into placeholders. In placeholder mode the statement
/// already carries placeholders: they are renumbered and any liftable
/// literal marks the statement as mixed.
#[derive(Default)]
struct LiteralExtractor {
    placeholder_mode: bool,
    mixed: bool,
    values: Vec<ParamValue>,
    by_value: HashMap<String, usize>,
    renumbered: HashMap<String, usize>,
    next_index: usize,
    /// ORDER BY and GROUP BY items. A bare integer there is a column
    /// ordinal, not a value.
    positional_roots: HashSet<*const Expr>,
}

impl LiteralExtractor {
    fn placeholder_for(&mut self, value: ParamValue) -> String {
        let key = value.dedupe_key();
        let index = match self.by_value.get(&key) {
            Some(index) => *index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.values.push(value);
                self.by_value.insert(key, index);
                index
            }
        };
        format!("${}", index)
    }

    fn renumber(&mut self, original: &str) -> String {
        let index = match self.renumbered.get(original) {
            Some(index) => *index,
            None => {
                let index = self.next_index;
                self.next_index += 1;
                self.renumbered.insert(original.to_string(), index);
                index
            }
        };
        format!("${}", index)
    }
}

fn has_placeholder(statement: &Statement) -> bool {
    let mut found = false;
    let _ = sqlparser::ast::visit_expressions(statement, |e| {
        if matches!(e, Expr::Value(Value::Placeholder(_))) {
            found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });
    found
}

fn has_literal(expr: &Expr) -> bool {
    let mut found = false;
    let _ = sqlparser::ast::visit_expressions(expr, |e| {
        if let Expr::Value(v) = e {
            if literal_value(v).is_some() {
                found = true;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    });
    found
}

impl VisitorMut for LiteralExtractor {
    type Break = String;

    fn pre_visit_query(&mut self, query: &mut Query) -> ControlFlow<Self::Break> {
        if let Some(order_by) = query.order_by.as_ref() {
            for item in &order_by.exprs {
                self.positional_roots.insert(&item.expr as *const Expr);
            }
        }
        collect_group_by(&query.body, &mut self.positional_roots);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        if self.placeholder_mode {
            return ControlFlow::Continue(());
        }

        if let Expr::InList {
            expr: subject,
            list,
            negated,
        } = expr
        {
            let items: Option<Vec<ParamValue>> = list
                .iter()
                .map(|item| match item {
                    Expr::Value(v) => literal_value(v),
                    _ => None,
                })
                .collect();
            if let Some(items) = items {
                if !items.is_empty() && !has_literal(subject) {
                    let placeholder = self.placeholder_for(ParamValue::Array(items));
                    let text = if *negated {
                        format!("{} <> ALL({})", subject, placeholder)
                    } else {
                        format!("{} = ANY({})", subject, placeholder)
                    };
                    match parse_expr(&text) {
                        Ok(rebuilt) => *expr = rebuilt,
                        Err(reason) => return ControlFlow::Break(reason),
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
        let positional = self.positional_roots.contains(&(&*expr as *const Expr));

        match expr {
            Expr::Value(Value::Placeholder(text)) => {
                if self.placeholder_mode {
                    let renumbered = self.renumber(text);
                    *text = renumbered;
                }
            }
            Expr::Value(value) => {
                if positional && matches!(value, Value::Number(..)) {
                    return ControlFlow::Continue(());
                }
                if let Some(param) = literal_value(value) {
                    if self.placeholder_mode {
                        self.mixed = true;
                    } else {
                        let placeholder = self.placeholder_for(param);
                        *value = Value::Placeholder(placeholder);
                    }
                }
            }
            Expr::TypedString { .. } if self.placeholder_mode => self.mixed = true,
            Expr::TypedString { data_type, value } => {
                let placeholder = self.placeholder_for(ParamValue::String(value.clone()));
                match parse_expr(&format!("CAST({} AS {})", placeholder, data_type)) {
                    Ok(rebuilt) => *expr = rebuilt,
                    Err(reason) => return ControlFlow::Break(reason),
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

fn collect_group_by(body: &SetExpr, roots: &mut HashSet<*const Expr>) {
    match body {
        SetExpr::Select(select) => {
            if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
                roots.extend(exprs.iter().map(|e| e as *const Expr));
            }
        }
        SetExpr::SetOperation { left, right, .. } => {
            collect_group_by(left, roots);
            collect_group_by(right, roots);
        }
        _ => {}
    }
}

/// Structural facts about a parsed statement.
#[derive(Debug, Default, Clone)]
pub struct QueryShape {
    pub statements: usize,
    pub non_query_statements: usize,
    pub query_blocks: usize,
    pub cte_count: usize,
    pub max_joins: usize,
    pub total_joins: usize,
    pub set_operations: usize,
    pub non_select_bodies: usize,
    pub select_into: bool,
    pub locking_clauses: usize,
    pub predicates: usize,
    pub aggregates: usize,
    pub functions: BTreeSet<String>,
    pub relations: BTreeSet<String>,
    pub cte_names: BTreeSet<String>,
    pub top_level_limit: Option<Expr>,
}

impl QueryShape {
    pub fn subqueries(&self) -> usize {
        self.query_blocks.saturating_sub(1 + self.cte_count)
    }

    pub fn complexity_score(&self) -> u32 {
        (self.total_joins * 2
            + self.subqueries() * 3
            + self.cte_count * 2
            + self.set_operations * 2
            + self.aggregates
            + self.predicates) as u32
    }
}

pub fn analyze_shape(statement: &Statement) -> QueryShape {
    let mut shape = QueryShape::default();
    if let Statement::Query(query) = statement {
        shape.top_level_limit = query.limit.clone();
    }
    let mut walker = ShapeWalker { shape: &mut shape };
    let _ = Visit::visit(statement, &mut walker);

    let ctes = shape.cte_names.clone();
    shape.relations.retain(|name| !ctes.contains(name));
    shape
}

struct ShapeWalker<'a> {
    shape: &'a mut QueryShape,
}

impl ShapeWalker<'_> {
    fn walk_body(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                let joins: usize = select.from.iter().map(|t| t.joins.len()).sum();
                self.shape.total_joins += joins;
                self.shape.max_joins = self.shape.max_joins.max(joins);
                if select.into.is_some() {
                    self.shape.select_into = true;
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.shape.set_operations += 1;
                self.walk_body(left);
                self.walk_body(right);
            }
            // Visited on its own through pre_visit_query.
            SetExpr::Query(_) => {}
            _ => self.shape.non_select_bodies += 1,
        }
    }
}

impl Visitor for ShapeWalker<'_> {
    type Break = ();

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.shape.statements += 1;
        if !matches!(statement, Statement::Query(_)) {
            self.shape.non_query_statements += 1;
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.shape.query_blocks += 1;
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.shape.cte_count += 1;
                self.shape
                    .cte_names
                    .insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.shape.locking_clauses += query.locks.len();
        self.walk_body(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(
        &mut self,
        relation: &sqlparser::ast::ObjectName,
    ) -> ControlFlow<Self::Break> {
        self.shape
            .relations
            .insert(relation.to_string().to_lowercase());
        ControlFlow::Continue(())
    }

    // Set-returning calls in FROM count as function calls too.
    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        match factor {
            TableFactor::Table {
                name,
                args: Some(_),
                ..
            }
            | TableFactor::Function { name, .. } => {
                self.shape.functions.insert(name.to_string().to_lowercase());
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::BinaryOp { op, .. } => {
                if matches!(
                    op,
                    BinaryOperator::Eq
                        | BinaryOperator::NotEq
                        | BinaryOperator::Lt
                        | BinaryOperator::LtEq
                        | BinaryOperator::Gt
                        | BinaryOperator::GtEq
                ) {
                    self.shape.predicates += 1;
                }
            }
            Expr::InList { .. }
            | Expr::InSubquery { .. }
            | Expr::Between { .. }
            | Expr::Like { .. }
            | Expr::ILike { .. }
            | Expr::IsNull(_)
            | Expr::IsNotNull(_)
            | Expr::Exists { .. }
            | Expr::AnyOp { .. }
            | Expr::AllOp { .. } => self.shape.predicates += 1,
            Expr::Function(function) => {
                let name = function.name.to_string().to_lowercase();
                if AGGREGATES.contains(&name.as_str()) {
                    self.shape.aggregates += 1;
                }
                self.shape.functions.insert(name);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
