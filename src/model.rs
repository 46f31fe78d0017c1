use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Name of the dimension that carries time grains and time-range bounds.
pub const DATE_DIMENSION: &str = "date";

/// Default hard cap on result rows when the source omits `security.max_rows`.
pub const DEFAULT_MAX_ROWS: u32 = 200;

/// `alias.` qualifiers inside a join predicate.
static QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.[A-Za-z_]").unwrap());

/// A named, pre-approved aggregation.
///
/// Derived metrics are compositions of other metrics. They carry
/// `components` and cannot be compiled on their own; their `expression` and
/// `base_table` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub base_table: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    /// Predicates always applied when this metric is queried.
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub is_derived: bool,
    #[serde(default)]
    pub components: Vec<String>,
    /// Common table expression text, e.g. `user_orders AS (SELECT ...)`.
    #[serde(default)]
    pub cte: Option<String>,
    /// Joins the metric's author expects it to need. Informational; join
    /// paths are always resolved from the graph.
    #[serde(default)]
    pub requires_joins: Vec<String>,
    #[serde(default)]
    pub is_complex: bool,
}

/// A named, approved group-by / filter axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    pub name: String,
    pub column: String,
    pub table: String,
    pub alias: String,
    #[serde(default)]
    pub grains: Vec<String>,
    #[serde(default)]
    pub grain_expressions: BTreeMap<String, String>,
}

impl Dimension {
    /// The bucketing expression for `grain`, if the dimension declares one.
    #[must_use]
    pub fn grain_expression(&self, grain: &str) -> Option<&str> {
        self.grain_expressions.get(grain).map(String::as_str)
    }

    #[must_use]
    pub fn allows_grain(&self, grain: &str) -> bool {
        self.grains.iter().any(|g| g == grain)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Left,
    Inner,
    Right,
}

impl JoinType {
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Left => "LEFT",
            Self::Inner => "INNER",
            Self::Right => "RIGHT",
        }
    }
}

/// A join between two tables. Declared with a direction, traversed both ways.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinEdge {
    pub left: String,
    pub left_alias: String,
    pub right: String,
    pub right_alias: String,
    pub on: String,
    #[serde(rename = "type", default)]
    pub join_type: JoinType,
}

impl JoinEdge {
    #[must_use]
    pub fn touches(&self, table: &str) -> bool {
        self.left == table || self.right == table
    }

    /// The table on the far side of this edge when standing on `table`.
    #[must_use]
    pub fn neighbor_of(&self, table: &str) -> Option<&str> {
        if self.left == table {
            Some(&self.right)
        } else if self.right == table {
            Some(&self.left)
        } else {
            None
        }
    }
}

/// Process-wide guardrails applied to every generated statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityRules {
    #[serde(default)]
    pub blocked_columns: Vec<String>,
    #[serde(default)]
    pub blocked_schemas: Vec<String>,
    #[serde(default = "default_read_only")]
    pub read_only: bool,
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,
}

fn default_read_only() -> bool {
    true
}

fn default_max_rows() -> u32 {
    DEFAULT_MAX_ROWS
}

impl Default for SecurityRules {
    fn default() -> Self {
        Self {
            blocked_columns: Vec::new(),
            blocked_schemas: Vec::new(),
            read_only: true,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

/// On-disk shape of the model source.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelSource {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    metrics: Vec<Metric>,
    #[serde(default)]
    dimensions: Vec<Dimension>,
    #[serde(default)]
    joins: Vec<JoinEdge>,
    #[serde(default)]
    security: SecurityRules,
    #[serde(default)]
    allowed_tables: Vec<String>,
}

fn default_version() -> u32 {
    1
}

/// Catalog entry for a metric, as exposed to API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub description: String,
    pub is_derived: bool,
}

/// Catalog entry for a dimension, as exposed to API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionSummary {
    pub name: String,
    pub column: String,
    pub grains: Vec<String>,
}

/// The approved catalog of metrics, dimensions, joins and security rules.
///
/// Built only through [`SemanticModel::from_yaml`] or [`SemanticModel::load`]
/// and exposes no mutating methods, so a shared `Arc<SemanticModel>` can be
/// read from any number of threads. Metrics, dimensions and joins keep their
/// declaration order; join order is part of the model contract because it
/// breaks ties between equal-length join paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticModel {
    version: u32,
    metrics: Vec<Metric>,
    metric_index: HashMap<String, usize>,
    dimensions: Vec<Dimension>,
    dimension_index: HashMap<String, usize>,
    joins: Vec<JoinEdge>,
    security: SecurityRules,
    allowed_tables: BTreeSet<String>,
}

impl SemanticModel {
    /// Parse and check a YAML model source.
    pub fn from_yaml(yaml: &str) -> Result<Self, LoadError> {
        let source: ModelSource = yaml_serde::from_str(yaml)?;
        Self::build(source)
    }

    /// Read and parse the model source at `path`.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    fn build(source: ModelSource) -> Result<Self, LoadError> {
        let ModelSource {
            version,
            metrics,
            dimensions,
            joins,
            mut security,
            allowed_tables,
        } = source;

        let mut metric_index = HashMap::with_capacity(metrics.len());
        for (idx, metric) in metrics.iter().enumerate() {
            if metric_index.insert(metric.name.clone(), idx).is_some() {
                return Err(LoadError::DuplicateMetric(metric.name.clone()));
            }
        }
        for metric in &metrics {
            check_metric(metric, &metric_index)?;
        }

        let mut dimension_index = HashMap::with_capacity(dimensions.len());
        for (idx, dim) in dimensions.iter().enumerate() {
            if dimension_index.insert(dim.name.clone(), idx).is_some() {
                return Err(LoadError::DuplicateDimension(dim.name.clone()));
            }
            if let Some(grain) = dim.grain_expressions.keys().find(|g| !dim.allows_grain(g)) {
                return Err(LoadError::UndeclaredGrain {
                    dimension: dim.name.clone(),
                    grain: grain.clone(),
                });
            }
        }

        for join in &joins {
            check_join(join)?;
        }

        if !security.read_only {
            return Err(LoadError::WritableModel);
        }
        if security.max_rows == 0 {
            return Err(LoadError::ZeroMaxRows);
        }
        for column in &mut security.blocked_columns {
            *column = column.to_ascii_lowercase();
        }
        for schema in &mut security.blocked_schemas {
            *schema = schema.to_ascii_lowercase();
        }

        Ok(Self {
            version,
            metrics,
            metric_index,
            dimensions,
            dimension_index,
            joins,
            security,
            allowed_tables: allowed_tables.into_iter().collect(),
        })
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metric_index.get(name).map(|&idx| &self.metrics[idx])
    }

    #[must_use]
    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimension_index.get(name).map(|&idx| &self.dimensions[idx])
    }

    #[must_use]
    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    #[must_use]
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    #[must_use]
    pub fn joins(&self) -> &[JoinEdge] {
        &self.joins
    }

    #[must_use]
    pub fn security(&self) -> &SecurityRules {
        &self.security
    }

    #[must_use]
    pub fn allowed_tables(&self) -> &BTreeSet<String> {
        &self.allowed_tables
    }

    /// All metric names in declaration order, derived ones included.
    #[must_use]
    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name.clone()).collect()
    }

    /// Names of metrics that can be compiled directly.
    #[must_use]
    pub fn queryable_metric_names(&self) -> Vec<String> {
        self.metrics
            .iter()
            .filter(|m| !m.is_derived)
            .map(|m| m.name.clone())
            .collect()
    }

    #[must_use]
    pub fn dimension_names(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.name.clone()).collect()
    }

    #[must_use]
    pub fn metric_summaries(&self) -> Vec<MetricSummary> {
        self.metrics
            .iter()
            .map(|m| MetricSummary {
                name: m.name.clone(),
                description: m.description.clone(),
                is_derived: m.is_derived,
            })
            .collect()
    }

    #[must_use]
    pub fn dimension_summaries(&self) -> Vec<DimensionSummary> {
        self.dimensions
            .iter()
            .map(|d| DimensionSummary {
                name: d.name.clone(),
                column: d.column.clone(),
                grains: d.grains.clone(),
            })
            .collect()
    }

    /// Map every alias declared anywhere in the model to its table.
    ///
    /// Later declarations win: metrics first, then dimensions, then joins.
    #[must_use]
    pub fn alias_to_table(&self) -> BTreeMap<String, String> {
        let mut mapping = BTreeMap::new();
        for metric in &self.metrics {
            if let (Some(alias), Some(table)) = (&metric.alias, &metric.base_table) {
                mapping.insert(alias.clone(), table.clone());
            }
        }
        for dim in &self.dimensions {
            mapping.insert(dim.alias.clone(), dim.table.clone());
        }
        for join in &self.joins {
            mapping.insert(join.left_alias.clone(), join.left.clone());
            mapping.insert(join.right_alias.clone(), join.right.clone());
        }
        mapping
    }
}

fn check_metric(metric: &Metric, metric_index: &HashMap<String, usize>) -> Result<(), LoadError> {
    if metric.is_derived {
        if metric.components.is_empty() {
            return Err(LoadError::EmptyComponents(metric.name.clone()));
        }
        if let Some(component) = metric
            .components
            .iter()
            .find(|c| !metric_index.contains_key(c.as_str()))
        {
            return Err(LoadError::UnknownComponent {
                metric: metric.name.clone(),
                component: component.clone(),
            });
        }
        return Ok(());
    }

    let missing = |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());
    if missing(&metric.expression) {
        return Err(LoadError::MissingField {
            metric: metric.name.clone(),
            field: "expression",
        });
    }
    if missing(&metric.base_table) {
        return Err(LoadError::MissingField {
            metric: metric.name.clone(),
            field: "base_table",
        });
    }
    Ok(())
}

fn check_join(join: &JoinEdge) -> Result<(), LoadError> {
    let allowed: HashSet<&str> = [join.left_alias.as_str(), join.right_alias.as_str()].into();
    for caps in QUALIFIER.captures_iter(&join.on) {
        let qualifier = &caps[1];
        if !allowed.contains(qualifier) {
            return Err(LoadError::ForeignJoinQualifier {
                left: join.left.clone(),
                right: join.right.clone(),
                left_alias: join.left_alias.clone(),
                right_alias: join.right_alias.clone(),
                qualifier: qualifier.to_string(),
            });
        }
    }
    Ok(())
}
