use std::collections::HashSet;

use chrono::{Local, NaiveDate};
use tracing::{debug, warn};

use crate::error::GenerateError;
use crate::model::{JoinEdge, SemanticModel, DATE_DIMENSION};
use crate::spec::QuerySpec;
use crate::time_range;

/// Alias given to a metric's CTE when it is auto-joined to the base table.
pub const CTE_ALIAS: &str = "uo";

/// Knobs for [`generate_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Anchor date for time-range resolution.
    pub today: NaiveDate,
    /// Fail with [`GenerateError::NoJoinPath`] instead of skipping a join
    /// that cannot be resolved.
    pub strict_joins: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            today: Local::now().date_naive(),
            strict_joins: false,
        }
    }
}

/// Quote a string as a SQL literal, doubling embedded single quotes.
///
/// # Examples
///
/// ```
/// # use governed_sql::generate::quote_literal;
/// assert_eq!(quote_literal("India"), "'India'");
/// assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
/// ```
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Compile a validated spec into governed SQL, using today's date and
/// lenient join handling.
pub fn generate(spec: &QuerySpec, model: &SemanticModel) -> Result<String, GenerateError> {
    generate_with(spec, model, &GenerateOptions::default())
}

/// Compile a validated spec into a single governed `SELECT`.
///
/// Only expressions, columns and joins declared in `model` are emitted. The
/// spec is expected to have passed [`crate::validate::validate`]; names the
/// model does not know are skipped rather than reported.
///
/// Output layout, clause by clause:
///
/// ```text
/// WITH <cte>                          -- only when the metric declares one
/// SELECT
///   <dimension> AS <name>,
///   <metric expression> AS <metric>
/// FROM <base table> AS <alias>
/// LEFT JOIN <cte name> AS uo ON ...   -- only with a CTE
/// <LEFT|INNER|RIGHT> JOIN ...
/// WHERE <metric filters>
///   AND <spec filters>
///   AND <time range bounds>
/// GROUP BY <dimension expressions>
/// ORDER BY <metric> DESC
/// LIMIT <min(limit, max_rows)>
/// ```
pub fn generate_with(
    spec: &QuerySpec,
    model: &SemanticModel,
    options: &GenerateOptions,
) -> Result<String, GenerateError> {
    let metric = model
        .metric(&spec.metric)
        .ok_or_else(|| GenerateError::UnknownMetric {
            name: spec.metric.clone(),
        })?;
    if metric.is_derived {
        return Err(GenerateError::DerivedMetric {
            name: metric.name.clone(),
            components: metric.components.clone(),
        });
    }
    let (Some(expression), Some(base_table)) =
        (metric.expression.as_deref(), metric.base_table.as_deref())
    else {
        return Err(GenerateError::IncompleteMetric {
            name: metric.name.clone(),
        });
    };
    let base_alias = metric.alias.as_deref();

    // SELECT / GROUP BY
    let mut select_items = Vec::with_capacity(spec.dimensions.len() + 1);
    let mut group_items = Vec::with_capacity(spec.dimensions.len());
    for name in &spec.dimensions {
        let Some(dim) = model.dimension(name) else {
            continue;
        };
        match spec.time_grain.as_deref() {
            Some(grain) if dim.name == DATE_DIMENSION => {
                let bucket = dim.grain_expression(grain).unwrap_or(&dim.column);
                select_items.push(format!("{bucket} AS date_{grain}"));
                group_items.push(bucket);
            }
            _ => {
                select_items.push(format!("{} AS {}", dim.column, dim.name));
                group_items.push(dim.column.as_str());
            }
        }
    }
    select_items.push(format!("{expression} AS {}", metric.name));

    // JOIN
    let edges = collect_join_edges(spec, model, base_table, options.strict_joins)?;
    let cte = metric
        .cte
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    let mut join_lines = Vec::with_capacity(edges.len() + 1);
    if let Some(cte_name) = cte.and_then(|c| c.split_whitespace().next()) {
        let qualifier = base_alias.unwrap_or(base_table);
        join_lines.push(format!(
            "LEFT JOIN {cte_name} AS {CTE_ALIAS} ON {qualifier}.user_id = {CTE_ALIAS}.user_id"
        ));
    }
    let mut joined: HashSet<&str> = HashSet::from([base_table]);
    for edge in edges {
        let (target, alias) = match (
            joined.contains(edge.left.as_str()),
            joined.contains(edge.right.as_str()),
        ) {
            (true, true) => continue,
            (false, true) => (edge.left.as_str(), edge.left_alias.as_str()),
            // Neither side joined yet: treat the right side as new.
            (_, false) => (edge.right.as_str(), edge.right_alias.as_str()),
        };
        join_lines.push(format!(
            "{} JOIN {target} AS {alias} ON {}",
            edge.join_type.keyword(),
            edge.on
        ));
        joined.insert(target);
    }

    // WHERE
    let mut predicates: Vec<String> = metric.filters.clone();
    for (name, values) in &spec.filters {
        let Some(dim) = model.dimension(name) else {
            continue;
        };
        match values.as_slice() {
            [] => {}
            [single] => predicates.push(format!("{} = {}", dim.column, quote_literal(single))),
            many => {
                let list: Vec<String> = many.iter().map(|v| quote_literal(v)).collect();
                predicates.push(format!("{} IN ({})", dim.column, list.join(", ")));
            }
        }
    }
    if let (Some(range), Some(date)) = (
        time_range::resolve(spec.time_range.as_deref(), options.today),
        model.dimension(DATE_DIMENSION),
    ) {
        predicates.push(format!("{} >= '{}'", date.column, range.start.format("%Y-%m-%d")));
        predicates.push(format!("{} <= '{}'", date.column, range.end.format("%Y-%m-%d")));
    }

    // Assemble
    let mut lines = Vec::new();
    if let Some(cte) = cte {
        lines.push(format!("WITH {cte}"));
    }
    lines.push("SELECT".to_string());
    lines.push(format!("  {}", select_items.join(",\n  ")));
    lines.push(match base_alias {
        Some(alias) => format!("FROM {base_table} AS {alias}"),
        None => format!("FROM {base_table}"),
    });
    lines.extend(join_lines);
    if !predicates.is_empty() {
        lines.push(format!("WHERE {}", predicates.join("\n  AND ")));
    }
    if !group_items.is_empty() {
        lines.push(format!("GROUP BY {}", group_items.join(", ")));
    }
    lines.push(format!("ORDER BY {} DESC", metric.name));
    lines.push(format!("LIMIT {}", effective_limit(spec, model)));

    let sql = lines.join("\n");
    debug!(metric = %metric.name, %sql, "generated SQL");
    Ok(sql)
}

/// The row cap actually emitted: the requested limit clamped to
/// `security.max_rows`, or `max_rows` when none was requested.
#[must_use]
pub fn effective_limit(spec: &QuerySpec, model: &SemanticModel) -> u32 {
    let max_rows = model.security().max_rows;
    spec.limit.map_or(max_rows, |limit| limit.min(max_rows))
}

/// Edges needed to reach every table the spec touches, de-duplicated and in
/// first-use order.
fn collect_join_edges<'m>(
    spec: &QuerySpec,
    model: &'m SemanticModel,
    base_table: &str,
    strict: bool,
) -> Result<Vec<&'m JoinEdge>, GenerateError> {
    let mut edges: Vec<&JoinEdge> = Vec::new();
    for table in spec.required_tables(model, base_table) {
        if edges.iter().any(|edge| edge.touches(table)) {
            continue;
        }
        match model.find_join_path(base_table, table) {
            Some(path) => {
                for edge in path {
                    if !edges.contains(&edge) {
                        edges.push(edge);
                    }
                }
            }
            None if strict => {
                return Err(GenerateError::NoJoinPath {
                    from: base_table.to_string(),
                    to: table.to_string(),
                });
            }
            None => warn!(from = base_table, to = table, "no join path; skipping join"),
        }
    }
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> SemanticModel {
        SemanticModel::from_yaml(include_str!("../tests/fixtures/semantic_model.yml")).unwrap()
    }

    fn options() -> GenerateOptions {
        GenerateOptions {
            today: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            strict_joins: false,
        }
    }

    fn compile(spec: &QuerySpec) -> String {
        generate_with(spec, &model(), &options()).unwrap()
    }

    mod quote_literal_tests {
        use super::*;

        #[test]
        fn plain_value() {
            assert_eq!(quote_literal("US"), "'US'");
        }

        #[test]
        fn embedded_quotes_are_doubled() {
            assert_eq!(quote_literal("it's"), "'it''s'");
            assert_eq!(quote_literal("''"), "''''''");
        }
    }

    mod layout {
        use super::*;

        #[test]
        fn metric_only() {
            let sql = compile(&QuerySpec::new("revenue"));
            let expected = "\
SELECT
  SUM(oi.quantity * oi.unit_price) AS revenue
FROM marts_marts.fct_order_items AS oi
WHERE oi.status = 'completed'
ORDER BY revenue DESC
LIMIT 200";
            assert_eq!(sql, expected);
        }

        #[test]
        fn dimension_with_time_range() {
            let spec = QuerySpec::new("revenue")
                .with_dimension("country")
                .with_time_range("last 6 months");
            let expected = "\
SELECT
  u.country AS country,
  SUM(oi.quantity * oi.unit_price) AS revenue
FROM marts_marts.fct_order_items AS oi
INNER JOIN marts_marts.fct_orders AS o ON oi.order_id = o.order_id
LEFT JOIN marts_marts.dim_users AS u ON o.user_id = u.user_id
LEFT JOIN marts_marts.dim_date AS d ON o.order_date = d.date_day
WHERE oi.status = 'completed'
  AND d.date_day >= '2023-09-01'
  AND d.date_day <= '2024-03-15'
GROUP BY u.country
ORDER BY revenue DESC
LIMIT 200";
            assert_eq!(compile(&spec), expected);
        }

        #[test]
        fn time_grain_uses_bucket_expression() {
            let spec = QuerySpec::new("orders")
                .with_dimension("date")
                .with_dimension("country")
                .with_time_grain("month")
                .with_limit(12);
            let expected = "\
SELECT
  d.month_start AS date_month,
  u.country AS country,
  COUNT(DISTINCT o.order_id) AS orders
FROM marts_marts.fct_orders AS o
LEFT JOIN marts_marts.dim_date AS d ON o.order_date = d.date_day
LEFT JOIN marts_marts.dim_users AS u ON o.user_id = u.user_id
WHERE o.status = 'completed'
GROUP BY d.month_start, u.country
ORDER BY orders DESC
LIMIT 12";
            assert_eq!(compile(&spec), expected);
        }

        #[test]
        fn date_without_grain_uses_column() {
            let sql = compile(&QuerySpec::new("orders").with_dimension("date"));
            assert!(sql.contains("  d.date_day AS date,\n"));
            assert!(sql.contains("GROUP BY d.date_day\n"));
        }

        #[test]
        fn cte_is_prepended_and_joined_first() {
            let spec = QuerySpec::new("returning_customers").with_dimension("country");
            let expected = "\
WITH user_orders AS (SELECT user_id, COUNT(*) AS order_count FROM marts_marts.fct_orders GROUP BY user_id)
SELECT
  u.country AS country,
  COUNT(DISTINCT CASE WHEN uo.order_count > 1 THEN o.user_id END) AS returning_customers
FROM marts_marts.fct_orders AS o
LEFT JOIN user_orders AS uo ON o.user_id = uo.user_id
LEFT JOIN marts_marts.dim_users AS u ON o.user_id = u.user_id
GROUP BY u.country
ORDER BY returning_customers DESC
LIMIT 200";
            assert_eq!(compile(&spec), expected);
        }
    }

    mod filters {
        use super::*;

        #[test]
        fn single_value_uses_equality() {
            let sql = compile(&QuerySpec::new("revenue").with_filter("country", ["India"]));
            assert!(sql.contains("WHERE oi.status = 'completed'\n  AND u.country = 'India'"));
            assert!(sql.contains("LEFT JOIN marts_marts.dim_users AS u"));
            assert!(!sql.contains("GROUP BY"));
        }

        #[test]
        fn multiple_values_use_in_list() {
            let sql = compile(&QuerySpec::new("revenue").with_filter("country", ["India", "US"]));
            assert!(sql.contains("u.country IN ('India', 'US')"));
        }

        #[test]
        fn values_are_quote_escaped() {
            let sql = compile(&QuerySpec::new("revenue").with_filter("brand", ["O'Neill"]));
            assert!(sql.contains("p.brand = 'O''Neill'"));
        }

        #[test]
        fn filters_are_emitted_in_key_order() {
            let spec = QuerySpec::new("revenue")
                .with_filter("country", ["US"])
                .with_filter("category", ["Books"]);
            let sql = compile(&spec);
            let category = sql.find("p.category = 'Books'").unwrap();
            let country = sql.find("u.country = 'US'").unwrap();
            assert!(category < country);
        }

        #[test]
        fn filter_on_base_table_needs_no_join() {
            let sql = compile(&QuerySpec::new("orders").with_filter("order_status", ["shipped"]));
            assert!(!sql.contains("JOIN"));
            assert!(sql.contains("o.status = 'shipped'"));
        }
    }

    mod joins {
        use super::*;

        #[test]
        fn shared_path_edges_are_not_repeated() {
            let spec = QuerySpec::new("revenue")
                .with_dimension("country")
                .with_dimension("category")
                .with_time_range("ytd");
            let sql = compile(&spec);
            assert_eq!(sql.matches("JOIN marts_marts.fct_orders").count(), 1);
            assert_eq!(sql.matches(" JOIN ").count(), 4);
        }

        #[test]
        fn edges_declared_backwards_join_the_far_side() {
            let sql = compile(&QuerySpec::new("active_users").with_dimension("country"));
            assert!(sql.contains("FROM raw.raw_sessions AS s\nLEFT JOIN marts_marts.dim_users AS u ON s.user_id = u.user_id"));

            // users -> orders walks the orders->users edge from its right side
            let sql = compile(&QuerySpec::new("active_users").with_dimension("date"));
            assert!(sql.contains("LEFT JOIN marts_marts.fct_orders AS o ON o.user_id = u.user_id"));
            assert!(sql.contains("LEFT JOIN marts_marts.dim_date AS d ON o.order_date = d.date_day"));
        }

        #[test]
        fn missing_path_is_skipped_when_lenient() {
            let sql = compile(&QuerySpec::new("revenue").with_dimension("warehouse_region"));
            assert!(sql.contains("w.region AS warehouse_region"));
            assert!(!sql.contains("dim_warehouses"));
        }

        #[test]
        fn missing_path_is_an_error_when_strict() {
            let strict = GenerateOptions {
                strict_joins: true,
                ..options()
            };
            let err = generate_with(
                &QuerySpec::new("revenue").with_dimension("warehouse_region"),
                &model(),
                &strict,
            )
            .unwrap_err();
            assert_eq!(
                err,
                GenerateError::NoJoinPath {
                    from: "marts_marts.fct_order_items".to_string(),
                    to: "marts_marts.dim_warehouses".to_string(),
                }
            );
        }
    }

    mod limits {
        use super::*;

        #[test]
        fn limit_is_clamped_to_max_rows() {
            let sql = compile(&QuerySpec::new("revenue").with_limit(9999));
            assert!(sql.ends_with("\nLIMIT 200"));
            assert!(!sql.contains("9999"));
        }

        #[test]
        fn smaller_limit_is_kept() {
            let sql = compile(&QuerySpec::new("revenue").with_limit(5));
            assert!(sql.ends_with("\nLIMIT 5"));
        }
    }

    mod errors {
        use super::*;

        #[test]
        fn unknown_metric() {
            let err = generate_with(&QuerySpec::new("profit"), &model(), &options()).unwrap_err();
            assert_eq!(
                err,
                GenerateError::UnknownMetric {
                    name: "profit".to_string()
                }
            );
            assert_eq!(err.to_string(), "Unknown metric 'profit'");
        }

        #[test]
        fn derived_metric() {
            let err = generate_with(&QuerySpec::new("conversion_proxy"), &model(), &options())
                .unwrap_err();
            assert!(matches!(err, GenerateError::DerivedMetric { .. }));
            assert!(err.to_string().contains("orders, active_users"));
        }
    }

    #[test]
    fn unparseable_time_range_adds_no_bounds() {
        let sql = compile(&QuerySpec::new("orders").with_time_range("since the dawn of time"));
        assert!(!sql.contains(">="));
    }

    #[test]
    fn generation_is_deterministic() {
        let spec = QuerySpec::new("aov")
            .with_dimension("category")
            .with_dimension("country")
            .with_filter("device", ["mobile", "desktop"])
            .with_time_range("last 2 weeks");
        assert_eq!(compile(&spec), compile(&spec));
    }
}
