//! Primitive model types: value types, expression kinds, time units and
//! join shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar value type of an atomic field or expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicType {
    String,
    Number,
    Boolean,
    Date,
    Timestamp,
    Json,
    /// A column type the model has no native representation for.
    SqlNative,
}

impl AtomicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtomicType::String => "string",
            AtomicType::Number => "number",
            AtomicType::Boolean => "boolean",
            AtomicType::Date => "date",
            AtomicType::Timestamp => "timestamp",
            AtomicType::Json => "json",
            AtomicType::SqlNative => "sql_native",
        }
    }

    /// Date or timestamp.
    pub fn is_temporal(&self) -> bool {
        matches!(self, AtomicType::Date | AtomicType::Timestamp)
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an expression may legally appear.
///
/// Aggregates never appear in `where`, `group_by` or `select`; analytics only
/// in `calculate`; scalars never in `aggregate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionType {
    #[default]
    Scalar,
    Aggregate,
    UngroupedAggregate,
    ScalarAnalytic,
    AggregateAnalytic,
}

impl ExpressionType {
    /// Combine the kinds of two subexpressions into the kind of their parent.
    pub fn combine(self, other: ExpressionType) -> ExpressionType {
        use ExpressionType::*;
        if self.is_analytic() || other.is_analytic() {
            if self.is_aggregate() || other.is_aggregate() {
                AggregateAnalytic
            } else {
                ScalarAnalytic
            }
        } else if self == UngroupedAggregate || other == UngroupedAggregate {
            UngroupedAggregate
        } else if self == Aggregate || other == Aggregate {
            Aggregate
        } else {
            Scalar
        }
    }

    /// Contains an aggregate computation.
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            ExpressionType::Aggregate
                | ExpressionType::UngroupedAggregate
                | ExpressionType::AggregateAnalytic
        )
    }

    pub fn is_analytic(&self) -> bool {
        matches!(
            self,
            ExpressionType::ScalarAnalytic | ExpressionType::AggregateAnalytic
        )
    }

    pub fn is_scalar(&self) -> bool {
        *self == ExpressionType::Scalar
    }
}

/// Calendar unit for truncation, offsets and differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Year => "year",
        }
    }

    /// Units that make sense for a date value (day and coarser).
    pub fn is_date_unit(&self) -> bool {
        *self >= TimeUnit::Day
    }

    /// Length of the unit in seconds, for fixed-length units.
    pub fn fixed_seconds(&self) -> Option<i64> {
        match self {
            TimeUnit::Second => Some(1),
            TimeUnit::Minute => Some(60),
            TimeUnit::Hour => Some(3600),
            TimeUnit::Day => Some(86_400),
            TimeUnit::Week => Some(604_800),
            TimeUnit::Month | TimeUnit::Quarter | TimeUnit::Year => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component extracted from a date or timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractUnit {
    Second,
    Minute,
    Hour,
    Day,
    /// 1 = Sunday .. 7 = Saturday.
    DayOfWeek,
    DayOfYear,
    Week,
    Month,
    Quarter,
    Year,
}

impl ExtractUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractUnit::Second => "second",
            ExtractUnit::Minute => "minute",
            ExtractUnit::Hour => "hour",
            ExtractUnit::Day => "day",
            ExtractUnit::DayOfWeek => "day_of_week",
            ExtractUnit::DayOfYear => "day_of_year",
            ExtractUnit::Week => "week",
            ExtractUnit::Month => "month",
            ExtractUnit::Quarter => "quarter",
            ExtractUnit::Year => "year",
        }
    }

    pub fn is_time_of_day(&self) -> bool {
        matches!(
            self,
            ExtractUnit::Second | ExtractUnit::Minute | ExtractUnit::Hour
        )
    }
}

/// Cardinality of a join relative to the struct that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRelationship {
    One,
    Many,
    Cross,
}

impl JoinRelationship {
    /// Joining can duplicate rows of the declaring struct.
    pub fn fans_out(&self) -> bool {
        matches!(self, JoinRelationship::Many | JoinRelationship::Cross)
    }
}

/// SQL join kind used when rendering a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Left,
    Inner,
    Right,
    Full,
}

/// Sort direction for `order_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_type_combine() {
        use ExpressionType::*;
        assert_eq!(Scalar.combine(Scalar), Scalar);
        assert_eq!(Scalar.combine(Aggregate), Aggregate);
        assert_eq!(Aggregate.combine(UngroupedAggregate), UngroupedAggregate);
        assert_eq!(Aggregate.combine(ScalarAnalytic), AggregateAnalytic);
        assert_eq!(Scalar.combine(ScalarAnalytic), ScalarAnalytic);
    }

    #[test]
    fn test_time_unit_ordering() {
        assert!(TimeUnit::Week.is_date_unit());
        assert!(!TimeUnit::Hour.is_date_unit());
        assert!(TimeUnit::Quarter > TimeUnit::Month);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ExtractUnit::DayOfWeek).unwrap();
        assert_eq!(json, "\"day_of_week\"");
        let ty: AtomicType = serde_json::from_str("\"sql_native\"").unwrap();
        assert_eq!(ty, AtomicType::SqlNative);
    }
}
