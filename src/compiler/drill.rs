//! Drill filters: turn a result row back into filters on the source.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::time::{format_timestamp, parse_instant, parse_timezone};
use crate::model::{AtomicType, TimeUnit};

use super::CompiledQuery;

/// A grouping dimension of a compiled query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillDimension {
    /// Output column name.
    pub name: String,
    /// How the dimension is written in a filter, e.g. `dep_time.month`.
    pub expression: String,
    pub ty: AtomicType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<TimeUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl DrillDimension {
    /// Filter text matching `value`, or `None` when the value cannot be
    /// written as a literal.
    pub fn filter_for(&self, value: &Value) -> Option<String> {
        let literal = match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) if self.ty.is_temporal() => self.time_literal(s)?,
            Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Array(_) | Value::Object(_) => return None,
        };
        Some(format!("{} = {}", self.expression, literal))
    }

    fn time_literal(&self, text: &str) -> Option<String> {
        let instant = parse_instant(text)?;
        let unit = self.timeframe.unwrap_or(match self.ty {
            AtomicType::Date => TimeUnit::Day,
            _ => TimeUnit::Second,
        });
        match self.timezone.as_deref() {
            Some(name) if self.ty == AtomicType::Timestamp => {
                let tz = parse_timezone(name).ok()?;
                Some(format_timestamp(&instant, unit, &tz))
            }
            _ => Some(format_timestamp(&instant, unit, &chrono::Utc)),
        }
    }
}

/// Filters selecting the rows behind `row`: the source's own filters
/// followed by one equality per grouping dimension.
pub fn drill_filters(compiled: &CompiledQuery, row: &Map<String, Value>) -> Vec<String> {
    let mut out: Vec<String> = compiled
        .source_filters
        .iter()
        .filter(|f| !f.code.is_empty())
        .map(|f| f.code.clone())
        .collect();
    for dim in &compiled.drill {
        let value = row.get(&dim.name).unwrap_or(&Value::Null);
        if let Some(filter) = dim.filter_for(value) {
            out.push(filter);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dim(name: &str, expression: &str, ty: AtomicType, timeframe: Option<TimeUnit>) -> DrillDimension {
        DrillDimension {
            name: name.into(),
            expression: expression.into(),
            ty,
            timeframe,
            timezone: None,
        }
    }

    #[test]
    fn test_string_and_number() {
        let carrier = dim("carrier", "carrier", AtomicType::String, None);
        assert_eq!(
            carrier.filter_for(&json!("O'Hare")).as_deref(),
            Some("carrier = 'O\\'Hare'")
        );
        let distance = dim("distance", "distance", AtomicType::Number, None);
        assert_eq!(distance.filter_for(&json!(12)).as_deref(), Some("distance = 12"));
        assert_eq!(distance.filter_for(&Value::Null).as_deref(), Some("distance = null"));
    }

    #[test]
    fn test_truncated_time() {
        let month = dim("dep_month", "dep_time.month", AtomicType::Timestamp, Some(TimeUnit::Month));
        assert_eq!(
            month.filter_for(&json!("2003-01-01T00:00:00Z")).as_deref(),
            Some("dep_time.month = @2003-01")
        );
    }

    #[test]
    fn test_time_in_query_zone() {
        let mut hour = dim("h", "dep_time.hour", AtomicType::Timestamp, Some(TimeUnit::Hour));
        hour.timezone = Some("America/New_York".into());
        assert_eq!(
            hour.filter_for(&json!("2020-02-20 15:00:00")).as_deref(),
            Some("dep_time.hour = @2020-02-20 10")
        );
    }

    #[test]
    fn test_nested_values_are_skipped() {
        let d = dim("n", "n", AtomicType::Json, None);
        assert_eq!(d.filter_for(&json!([1, 2])), None);
    }
}
