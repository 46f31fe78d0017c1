use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::model::{SemanticModel, DATE_DIMENSION};

/// A structured business question: one metric, sliced and filtered.
///
/// This is a plain value. Validation and generation borrow it and never
/// modify it.
///
/// Filter values are OR-combined within a dimension and AND-combined across
/// dimensions. When deserialized, every filter must carry a non-empty list of
/// non-blank strings; anything else is rejected before it reaches the
/// validator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
#[serde(deny_unknown_fields)]
pub struct QuerySpec {
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_filters")]
    pub filters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub time_grain: Option<String>,
    #[serde(default)]
    pub time_range: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl QuerySpec {
    #[must_use]
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>) -> Self {
        self.dimensions.push(name.into());
        self
    }

    #[must_use]
    pub fn with_filter<I, S>(mut self, dimension: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(dimension.into(), values.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_time_grain(mut self, grain: impl Into<String>) -> Self {
        self.time_grain = Some(grain.into());
        self
    }

    #[must_use]
    pub fn with_time_range(mut self, range: impl Into<String>) -> Self {
        self.time_range = Some(range.into());
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse a spec from JSON, applying the filter-value checks.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn has_time_range(&self) -> bool {
        self.time_range.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    /// Tables other than `base_table` that this spec needs joined.
    ///
    /// Ordered by first use: requested dimensions, then filter keys, then the
    /// date dimension's table when a time range is requested without `date`
    /// among the dimensions. Unknown dimension names contribute nothing.
    #[must_use]
    pub fn required_tables<'m>(&self, model: &'m SemanticModel, base_table: &str) -> Vec<&'m str> {
        let date_for_range = (self.has_time_range()
            && !self.dimensions.iter().any(|d| d == DATE_DIMENSION))
        .then_some(DATE_DIMENSION);

        let mut tables: Vec<&str> = Vec::new();
        let names = self
            .dimensions
            .iter()
            .map(String::as_str)
            .chain(self.filters.keys().map(String::as_str))
            .chain(date_for_range);
        for name in names {
            if let Some(dim) = model.dimension(name) {
                let table = dim.table.as_str();
                if table != base_table && !tables.contains(&table) {
                    tables.push(table);
                }
            }
        }
        tables
    }
}

fn deserialize_filters<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let filters = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
    for (key, values) in &filters {
        if values.is_empty() {
            return Err(D::Error::custom(format!(
                "filter '{key}' has an empty value list"
            )));
        }
        if values.iter().any(|v| v.trim().is_empty()) {
            return Err(D::Error::custom(format!(
                "filter '{key}' contains a blank value"
            )));
        }
    }
    Ok(filters)
}
