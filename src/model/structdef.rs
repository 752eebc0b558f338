//! Struct definitions: sources, join targets, nested records and stage
//! outputs all share one shape.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::expr::Expr;
use super::field::{AtomicField, FieldDef};
use super::query::{FilterCondition, Query};
use super::shape::ShapeError;
use super::types::{AtomicType, JoinKind, JoinRelationship};

/// Name of the element field of an array of scalars.
pub const ARRAY_ELEMENT: &str = "each";

/// Where a struct's rows come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructKind {
    Table {
        table_path: String,
    },
    SqlSelect {
        select_sql: String,
    },
    QuerySource {
        query: Box<Query>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query_name: Option<String>,
    },
    /// Several sources with a common prefix of fields; the compiler picks the
    /// first one that covers the query.
    Composite {
        sources: Vec<StructDef>,
    },
    /// Nested record column, accessed in place.
    Record,
    /// Repeated column, unnested when joined.
    Array {
        #[serde(default)]
        scalar: bool,
    },
    /// Output of a pipeline stage.
    Result,
}

/// How a struct is joined to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub relationship: JoinRelationship,
    #[serde(default)]
    pub join_type: JoinKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub kind: StructKind,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    pub dialect: String,
    pub connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterCondition>,
    /// Name of the field that owns this struct, when nested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl StructDef {
    /// A table source.
    pub fn table(
        name: impl Into<String>,
        table_path: impl Into<String>,
        dialect: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            StructKind::Table {
                table_path: table_path.into(),
            },
            dialect,
            connection,
        )
    }

    pub fn with_kind(
        name: impl Into<String>,
        kind: StructKind,
        dialect: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            dialect: dialect.into(),
            connection: connection.into(),
            join: None,
            primary_key: None,
            filters: Vec::new(),
            parent: None,
            timezone: None,
        }
    }

    /// Builder: add a physical column.
    pub fn column(mut self, name: &str, ty: AtomicType) -> Self {
        self.fields
            .push(FieldDef::Atomic(AtomicField::column(name, ty)));
        self
    }

    /// Builder: add any field.
    pub fn field_def(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn primary_key(mut self, key: &str) -> Self {
        self.primary_key = Some(key.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Resolve a dotted path to a field, walking through nested structs.
    pub fn lookup(&self, path: &[String]) -> Option<&FieldDef> {
        let (first, rest) = path.split_first()?;
        let field = self.field(first)?;
        if rest.is_empty() {
            return Some(field);
        }
        match field {
            FieldDef::Struct(s) => s.lookup(rest),
            _ => None,
        }
    }

    /// The struct at a join path; the empty path is `self`.
    pub fn struct_at(&self, path: &[String]) -> Option<&StructDef> {
        match path.split_first() {
            None => Some(self),
            Some((first, rest)) => match self.field(first)? {
                FieldDef::Struct(s) => s.struct_at(rest),
                _ => None,
            },
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, StructKind::Array { .. })
    }

    pub fn is_scalar_array(&self) -> bool {
        matches!(self.kind, StructKind::Array { scalar: true })
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind, StructKind::Record)
    }

    /// Sources that render as their own table expression.
    pub fn is_table_like(&self) -> bool {
        matches!(
            self.kind,
            StructKind::Table { .. }
                | StructKind::SqlSelect { .. }
                | StructKind::QuerySource { .. }
                | StructKind::Composite { .. }
        )
    }

    /// Names of every atomic field, in declaration order.
    pub fn atomic_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter_map(|f| f.as_atomic().map(|a| a.name.as_str()))
    }

    /// Check that field names are unique at every level.
    pub fn validate(&self) -> Result<(), ShapeError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name()) {
                return Err(ShapeError::DuplicateField {
                    struct_name: self.name.clone(),
                    field: field.name().to_string(),
                });
            }
            if let FieldDef::Struct(s) = field {
                s.validate()?;
            }
        }
        if let StructKind::Composite { sources } = &self.kind {
            for s in sources {
                s.validate()?;
            }
        }
        Ok(())
    }
}
