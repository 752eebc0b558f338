//! Output shapes of pipeline segments.

use thiserror::Error;

use super::field::{AtomicField, FieldDef, TurtleDef};
use super::query::{PipeSegment, QueryField, QuerySegment};
use super::structdef::{JoinInfo, StructDef, StructKind};
use super::types::{AtomicType, JoinKind, JoinRelationship};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeError {
    #[error("'{field}' is defined more than once in '{struct_name}'")]
    DuplicateField { struct_name: String, field: String },

    #[error("'{0}' is not defined")]
    UnknownField(String),

    #[error("'{name}' is a {kind}, not a value")]
    NotAValue { name: String, kind: &'static str },

    #[error("view '{0}' has an empty pipeline")]
    EmptyPipeline(String),
}

/// Compute the struct a segment produces when applied to `input`.
pub fn segment_output(input: &StructDef, segment: &PipeSegment) -> Result<StructDef, ShapeError> {
    let mut out = StructDef::with_kind(
        input.name.clone(),
        StructKind::Result,
        input.dialect.clone(),
        input.connection.clone(),
    );
    out.timezone = input.timezone.clone();

    match segment {
        PipeSegment::Reduce(q) | PipeSegment::Project(q) => {
            for field in &q.fields {
                out.fields.push(output_field(input, q, field)?);
            }
        }
        PipeSegment::Index(_) => {
            for name in ["fieldName", "fieldPath", "fieldType", "fieldValue"] {
                out = out.column(name, AtomicType::String);
            }
            out = out.column("weight", AtomicType::Number);
        }
    }

    out.validate()?;
    Ok(out)
}

/// Output shape of a whole pipeline.
pub fn pipeline_output(input: &StructDef, pipeline: &[PipeSegment]) -> Result<StructDef, ShapeError> {
    let mut current = input.clone();
    for segment in pipeline {
        current = segment_output(&current, segment)?;
    }
    Ok(current)
}

fn output_field(
    input: &StructDef,
    segment: &QuerySegment,
    field: &QueryField,
) -> Result<FieldDef, ShapeError> {
    let name = field.output_name().to_string();
    let def = match field {
        QueryField::Def(def) => def.clone(),
        QueryField::Ref { path, .. } => {
            let local = match path.as_slice() {
                [single] => segment.extend.iter().find(|f| f.name() == single),
                _ => None,
            };
            local
                .or_else(|| input.lookup(path))
                .cloned()
                .ok_or_else(|| ShapeError::UnknownField(path.join(".")))?
        }
    };

    match def {
        FieldDef::Atomic(a) => {
            let mut column = AtomicField::column(name, a.ty);
            column.timeframe = a.timeframe;
            column.raw_type = a.raw_type;
            Ok(FieldDef::Atomic(column))
        }
        FieldDef::Turtle(turtle) => nested_output(input, &name, &turtle).map(FieldDef::Struct),
        FieldDef::Struct(s) => Err(ShapeError::NotAValue {
            name: s.name,
            kind: "join",
        }),
    }
}

/// A nested view becomes an array of records.
fn nested_output(input: &StructDef, name: &str, turtle: &TurtleDef) -> Result<StructDef, ShapeError> {
    if turtle.pipeline.is_empty() {
        return Err(ShapeError::EmptyPipeline(turtle.name.clone()));
    }
    let inner = pipeline_output(input, &turtle.pipeline)?;
    let mut nested = StructDef::with_kind(
        name,
        StructKind::Array { scalar: false },
        input.dialect.clone(),
        input.connection.clone(),
    );
    nested.fields = inner.fields;
    nested.join = Some(JoinInfo {
        relationship: JoinRelationship::Many,
        join_type: JoinKind::Left,
        on: None,
    });
    Ok(nested)
}
