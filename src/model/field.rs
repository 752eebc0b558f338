//! Field definitions.

use serde::{Deserialize, Serialize};

use super::expr::Expr;
use super::query::PipeSegment;
use super::structdef::StructDef;
use super::types::{AtomicType, ExpressionType, TimeUnit};

/// A field of a struct: a scalar column or computed value, a nested struct
/// (join target, record or array), or a named view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldDef {
    Atomic(AtomicField),
    Struct(StructDef),
    Turtle(TurtleDef),
}

impl FieldDef {
    pub fn name(&self) -> &str {
        match self {
            FieldDef::Atomic(a) => &a.name,
            FieldDef::Struct(s) => &s.name,
            FieldDef::Turtle(t) => &t.name,
        }
    }

    pub fn as_atomic(&self) -> Option<&AtomicField> {
        match self {
            FieldDef::Atomic(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructDef> {
        match self {
            FieldDef::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldDef::Atomic(_) => "field",
            FieldDef::Struct(_) => "join",
            FieldDef::Turtle(_) => "view",
        }
    }

    /// Return a copy under a different name.
    pub fn renamed(&self, name: &str) -> FieldDef {
        let mut out = self.clone();
        match &mut out {
            FieldDef::Atomic(a) => a.name = name.to_string(),
            FieldDef::Struct(s) => s.name = name.to_string(),
            FieldDef::Turtle(t) => t.name = name.to_string(),
        }
        out
    }
}

/// A scalar-valued field.
///
/// A field with no `expr` is a physical column named `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AtomicType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<Expr>,
    #[serde(default)]
    pub expression_type: ExpressionType,
    /// Set when the value is a time truncated to this unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<TimeUnit>,
    /// Native column type name, for `sql_native` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_type: Option<String>,
}

impl AtomicField {
    /// A physical column.
    pub fn column(name: impl Into<String>, ty: AtomicType) -> Self {
        Self {
            name: name.into(),
            ty,
            expr: None,
            expression_type: ExpressionType::Scalar,
            timeframe: None,
            raw_type: None,
        }
    }

    /// A computed field.
    pub fn computed(
        name: impl Into<String>,
        ty: AtomicType,
        expr: Expr,
        expression_type: ExpressionType,
    ) -> Self {
        Self {
            name: name.into(),
            ty,
            expr: Some(expr),
            expression_type,
            timeframe: None,
            raw_type: None,
        }
    }

    pub fn is_measure(&self) -> bool {
        self.expression_type.is_aggregate()
    }
}

/// A named view: a reusable pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurtleDef {
    pub name: String,
    pub pipeline: Vec<PipeSegment>,
}
