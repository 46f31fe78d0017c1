//! Checks a [`QuerySpec`] against the semantic model before compilation.
//!
//! Violations are returned as human-readable messages in a fixed order. An
//! empty list means the spec may be handed to [`crate::generate`].
//!
//! Order of checks:
//!
//! 1. a metric is named
//! 2. the metric exists
//! 3. the metric is not derived
//! 4. every dimension exists
//! 5. every filter key names a dimension
//! 6. the time grain is allowed on the date dimension
//! 7. every required table is joinable from the metric's base table
//!    (skipped when any of 4-6 failed)
//! 8. filter value lists are non-empty and contain no blank values
//! 9. the requested limit does not exceed `security.max_rows`
//!
//! Checks 1-3 stop validation on failure; the rest accumulate.

use crate::model::{SemanticModel, DATE_DIMENSION};
use crate::spec::QuerySpec;

/// Suggest the closest matching name from `available` using Levenshtein distance.
///
/// Returns `Some(name)` (with original casing) if the best match has an edit
/// distance of 3 or fewer characters. Returns `None` if no candidate is close
/// enough. Both the query and candidates are lowercased for comparison.
#[must_use]
pub fn suggest_closest(name: &str, available: &[String]) -> Option<String> {
    let query = name.to_ascii_lowercase();
    let mut best: Option<(usize, &str)> = None;
    for candidate in available {
        let dist = strsim::levenshtein(&query, &candidate.to_ascii_lowercase());
        if dist <= 3 && best.is_none_or(|(best_dist, _)| dist < best_dist) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, s)| s.to_string())
}

/// Append the allowed names, plus a suggestion when one is close to `name`.
fn with_allowed(mut message: String, name: &str, available: &[String]) -> String {
    message.push_str(" Allowed: ");
    message.push_str(&available.join(", "));
    if let Some(s) = suggest_closest(name, available) {
        message.push_str(". Did you mean '");
        message.push_str(&s);
        message.push_str("'?");
    }
    message
}

/// Return every violation `spec` has against `model`, in check order.
#[must_use]
pub fn validate(spec: &QuerySpec, model: &SemanticModel) -> Vec<String> {
    let mut errors = Vec::new();

    let metric_name = spec.metric.as_str();
    if metric_name.trim().is_empty() {
        errors.push("No metric specified.".to_string());
        return errors;
    }

    let Some(metric) = model.metric(metric_name) else {
        errors.push(with_allowed(
            format!("Unknown metric '{metric_name}'."),
            metric_name,
            &model.queryable_metric_names(),
        ));
        return errors;
    };

    if metric.is_derived {
        errors.push(format!(
            "Metric '{metric_name}' is a derived/composite metric and cannot be queried directly. \
             Its components are: {}",
            metric.components.join(", ")
        ));
        return errors;
    }

    let dimension_names = model.dimension_names();
    for name in &spec.dimensions {
        if model.dimension(name).is_none() {
            errors.push(with_allowed(
                format!("Unknown dimension '{name}'."),
                name,
                &dimension_names,
            ));
        }
    }

    for key in spec.filters.keys() {
        if model.dimension(key).is_none() {
            errors.push(with_allowed(
                format!("Filter key '{key}' is not a recognized dimension."),
                key,
                &dimension_names,
            ));
        }
    }

    if let Some(grain) = spec.time_grain.as_deref() {
        match model.dimension(DATE_DIMENSION) {
            Some(date) if date.allows_grain(grain) => {}
            Some(date) => errors.push(format!(
                "Invalid time grain '{grain}'. Allowed grains for '{DATE_DIMENSION}': {}",
                date.grains.join(", ")
            )),
            None => errors.push(format!(
                "Time grain '{grain}' requested but the model has no '{DATE_DIMENSION}' dimension."
            )),
        }
    }

    if errors.is_empty() {
        if let Some(base_table) = metric.base_table.as_deref() {
            check_join_paths(spec, model, base_table, &mut errors);
        }
    }

    for (key, values) in &spec.filters {
        if values.is_empty() {
            errors.push(format!("Filter '{key}' has an empty value list."));
        }
        for value in values.iter().filter(|v| v.trim().is_empty()) {
            errors.push(format!("Filter '{key}' has an invalid/empty value: {value:?}"));
        }
    }

    let max_rows = model.security().max_rows;
    if let Some(limit) = spec.limit.filter(|&l| l > max_rows) {
        errors.push(format!(
            "Requested limit ({limit}) exceeds maximum allowed ({max_rows})."
        ));
    }

    errors
}

fn check_join_paths(
    spec: &QuerySpec,
    model: &SemanticModel,
    base_table: &str,
    errors: &mut Vec<String>,
) {
    let reachable = model.tables_reachable_from(base_table);
    for table in spec.required_tables(model, base_table) {
        if !reachable.contains(table) {
            errors.push(format!(
                "Dimension table '{table}' is not reachable from metric base table \
                 '{base_table}' via approved join paths."
            ));
        } else if model.find_join_path(base_table, table).is_none() {
            errors.push(format!(
                "No approved join path from '{base_table}' to '{table}'."
            ));
        }
    }
}
