//! Text-level safety audit of generated SQL.
//!
//! The auditor never sees the [`crate::spec::QuerySpec`]; it inspects only the
//! statement text and the model's security rules, so it still catches problems
//! if the generator is wrong or bypassed. It is pattern matching, not parsing.
//! Each check is a standalone function returning its own violations, and
//! [`audit`] runs all of them without short-circuiting.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::model::{SecurityRules, SemanticModel};

static MULTI_STATEMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r";\s*\S").unwrap());

static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSELECT\s+\*").unwrap());

static DANGEROUS_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(DROP|ALTER|TRUNCATE|INSERT|UPDATE|DELETE|MERGE|GRANT|REVOKE|CREATE|REPLACE|EXECUTE|EXEC|CALL|COPY|SET\s+ROLE|RESET\s+ROLE)\b",
    )
    .unwrap()
});

static AGGREGATE_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(COUNT|SUM|AVG|MIN|MAX)\s*\([^)]*\)").unwrap());

static TABLE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:FROM|JOIN)\s+(\w+\.\w+|\w+)").unwrap());

static LIMIT_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").unwrap());

/// Statement must begin with `SELECT` or `WITH`.
#[must_use]
pub fn check_statement_kind(sql: &str) -> Vec<String> {
    let head = sql.trim_start().as_bytes();
    let starts_with = |keyword: &str| {
        head.len() >= keyword.len() && head[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
    };
    if starts_with("SELECT") || starts_with("WITH") {
        Vec::new()
    } else {
        vec!["SQL must be a SELECT statement.".to_string()]
    }
}

/// No `;` followed by anything other than whitespace.
#[must_use]
pub fn check_single_statement(sql: &str) -> Vec<String> {
    if MULTI_STATEMENT.is_match(sql) {
        vec![
            "Multi-statement SQL is not allowed (found ';' followed by another statement)."
                .to_string(),
        ]
    } else {
        Vec::new()
    }
}

#[must_use]
pub fn check_no_select_star(sql: &str) -> Vec<String> {
    if SELECT_STAR.is_match(sql) {
        vec!["SELECT * is not allowed. Specify explicit columns.".to_string()]
    } else {
        Vec::new()
    }
}

/// One violation per distinct DDL/DML/privilege keyword found as a whole word.
#[must_use]
pub fn check_dangerous_keywords(sql: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for caps in DANGEROUS_KEYWORD.captures_iter(sql) {
        let keyword = caps[1]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();
        if !seen.contains(&keyword) {
            seen.push(keyword);
        }
    }
    seen.into_iter()
        .map(|kw| format!("Dangerous keyword detected: '{kw}'."))
        .collect()
}

#[must_use]
pub fn check_no_comments(sql: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if sql.contains("--") {
        errors.push("Inline comments (--) are not allowed.".to_string());
    }
    if sql.contains("/*") {
        errors.push("Block comments (/* */) are not allowed.".to_string());
    }
    errors
}

/// Substring match on `<schema>.`, case-insensitive.
#[must_use]
pub fn check_blocked_schemas(sql: &str, security: &SecurityRules) -> Vec<String> {
    let lower = sql.to_ascii_lowercase();
    security
        .blocked_schemas
        .iter()
        .filter(|schema| lower.contains(&format!("{}.", schema.to_ascii_lowercase())))
        .map(|schema| format!("Blocked schema referenced: '{schema}'."))
        .collect()
}

/// The text before the first `FROM` clause, or all of `sql` if there is none.
fn projection(sql: &str) -> &str {
    let lower = sql.to_ascii_lowercase();
    match lower.find("\nfrom ").or_else(|| lower.find(" from ")) {
        Some(idx) => &sql[..idx],
        None => sql,
    }
}

/// Blocked columns may not be projected as `<alias>.<col>` or `AS <col>`.
///
/// Aggregate calls are masked first: a blocked column that only feeds a
/// `COUNT`/`SUM`/`AVG`/`MIN`/`MAX` never has its raw value exposed.
#[must_use]
pub fn check_blocked_columns(sql: &str, security: &SecurityRules) -> Vec<String> {
    let masked = AGGREGATE_CALL.replace_all(projection(sql), "__agg__");
    let mut errors = Vec::new();
    for column in &security.blocked_columns {
        let escaped = regex::escape(column);
        let pattern = RegexBuilder::new(&format!(r"\b\w+\.{escaped}\b|\bAS\s+{escaped}\b"))
            .case_insensitive(true)
            .build();
        match pattern {
            Ok(re) if re.is_match(&masked) => errors.push(format!(
                "Blocked column '{column}' appears in the SELECT projection."
            )),
            Ok(_) => {}
            Err(_) => errors.push(format!(
                "Blocked column '{column}' could not be checked in the SELECT projection."
            )),
        }
    }
    errors
}

/// Every `schema.table` after `FROM`/`JOIN` must be allow-listed.
///
/// Unqualified names are aliases or CTE names and are not checked. Each
/// offending table is reported once, in order of first appearance. A `FROM`
/// inside a function call such as `EXTRACT(YEAR FROM d.col)` is read as a
/// table reference too.
#[must_use]
pub fn check_allowed_tables(sql: &str, allowed_tables: &BTreeSet<String>) -> Vec<String> {
    let allowed: BTreeSet<String> = allowed_tables
        .iter()
        .map(|t| t.to_ascii_lowercase())
        .collect();
    let mut rejected: Vec<&str> = Vec::new();
    for caps in TABLE_REFERENCE.captures_iter(sql) {
        let reference = caps.get(1).map_or("", |m| m.as_str());
        if !reference.contains('.')
            || allowed.contains(&reference.to_ascii_lowercase())
            || rejected.contains(&reference)
        {
            continue;
        }
        rejected.push(reference);
    }
    rejected
        .into_iter()
        .map(|t| format!("Table '{t}' is not in the allowed tables list."))
        .collect()
}

/// A `LIMIT` must be present, and every `LIMIT` value must be within `max_rows`.
#[must_use]
pub fn check_limit(sql: &str, max_rows: u32) -> Vec<String> {
    let mut errors = Vec::new();
    let mut found = false;
    for caps in LIMIT_CLAUSE.captures_iter(sql) {
        found = true;
        let digits = &caps[1];
        let within = digits
            .parse::<u64>()
            .is_ok_and(|value| value <= u64::from(max_rows));
        if !within {
            errors.push(format!(
                "LIMIT {digits} exceeds maximum allowed ({max_rows})."
            ));
        }
    }
    if !found {
        errors.push(format!(
            "SQL must include a LIMIT clause (max {max_rows})."
        ));
    }
    errors
}

/// Run every check over `sql` and return all violations together.
#[must_use]
pub fn audit(sql: &str, model: &SemanticModel) -> Vec<String> {
    let sql = sql.trim();
    let security = model.security();

    let mut errors = check_statement_kind(sql);
    errors.extend(check_single_statement(sql));
    errors.extend(check_no_select_star(sql));
    errors.extend(check_dangerous_keywords(sql));
    errors.extend(check_no_comments(sql));
    errors.extend(check_blocked_schemas(sql, security));
    errors.extend(check_blocked_columns(sql, security));
    errors.extend(check_allowed_tables(sql, model.allowed_tables()));
    errors.extend(check_limit(sql, security.max_rows));

    if !errors.is_empty() {
        warn!(violations = ?errors, "SQL safety violations");
    }
    errors
}
