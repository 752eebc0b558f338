//! Queries, pipelines and segment bodies.

use crate::diagnostics::Span;
use crate::model::time::parse_timezone;
use crate::model::{
    segment_output, AtomicField, AtomicType, ExpressionType, FieldDef, FilterCondition,
    IndexSegment, NamedObject, OrderBy, OrderKey, PipeSegment, Query, QueryField, QuerySegment,
    SourceLocation, SourceRef, StructDef, TurtleDef,
};

use super::ast::{
    ExprAst, FieldItem, NestItem, QueryExpr, SegmentAst, SegmentItem, SourceExpr, SourceProperty,
    Spanned,
};
use super::resolve::{Halt, Resolver};
use super::typecheck::{check, OutputInfo, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Reduce,
    Project,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    GroupBy,
    Aggregate,
    Select,
    Calculate,
}

/// A segment body being translated.
struct SegmentState {
    /// Input plus the segment's own `extend` fields.
    local: StructDef,
    segment: QuerySegment,
    kind: Option<Kind>,
    outputs: Vec<OutputInfo>,
    /// Names declared by `group_by`, for `all()` / `exclude()`.
    dimensions: Vec<String>,
    index: Option<IndexSegment>,
    orders: Vec<(OrderBy, Option<Span>)>,
}

fn output_name(item: &FieldItem) -> Option<String> {
    match (&item.name, &item.expr) {
        (Some(name), _) => Some(name.clone()),
        (None, ExprAst::Field { path }) => path.last().cloned(),
        (None, _) => None,
    }
}

impl Resolver<'_> {
    pub(super) fn translate_query(&mut self, expr: &QueryExpr, span: &Option<Span>) -> Result<Query, Halt> {
        let (mut query, input) = match &expr.source {
            SourceExpr::Named { name } => match self.lookup(name, span)? {
                // Read the named query by reference so its identity survives
                // into the model; the build graph levels on it.
                NamedObject::Query(_) => {
                    let query = Query::new(SourceRef::Named(name.clone()), Vec::new());
                    let input = self.query_input(&query, span)?;
                    (query, input)
                }
                NamedObject::Source(def) => (Query::new(SourceRef::Named(name.clone()), Vec::new()), def),
            },
            other => {
                let def = self.resolve_source(other, span)?;
                (
                    Query::new(SourceRef::Inline(Box::new(def.clone())), Vec::new()),
                    def,
                )
            }
        };
        let segments = self.translate_pipeline(&input, &expr.segments, span)?;
        query.pipeline.extend(segments);
        if query.pipeline.is_empty() {
            return Err(self.fail(span, "a query needs at least one stage"));
        }
        query.location = span.clone().map(|span| SourceLocation {
            url: self.url.clone(),
            span,
        });
        Ok(query)
    }

    pub(super) fn translate_pipeline(
        &mut self,
        input: &StructDef,
        segments: &[SegmentAst],
        span: &Option<Span>,
    ) -> Result<Vec<PipeSegment>, Halt> {
        let mut current = input.clone();
        let mut out = Vec::new();
        for segment in segments {
            let produced = match segment {
                SegmentAst::View { name } => match current.field(name) {
                    Some(FieldDef::Turtle(view)) => view.pipeline.clone(),
                    Some(other) => {
                        let message = format!("'{}' is a {}, not a view", name, other.kind_name());
                        return Err(self.fail(span, message));
                    }
                    None => return Err(self.fail(span, format!("'{}' is not defined", name))),
                },
                SegmentAst::Body { items } => vec![self.translate_segment(&current, items, span)?],
            };
            for p in produced {
                current = segment_output(&current, &p).map_err(|e| self.fail(span, e.to_string()))?;
                out.push(p);
            }
        }
        Ok(out)
    }

    fn translate_segment(
        &mut self,
        input: &StructDef,
        items: &[Spanned<SegmentItem>],
        span: &Option<Span>,
    ) -> Result<PipeSegment, Halt> {
        let mut st = SegmentState {
            local: input.clone(),
            segment: QuerySegment::default(),
            kind: None,
            outputs: Vec::new(),
            dimensions: Vec::new(),
            index: None,
            orders: Vec::new(),
        };
        let mut failed = false;

        // Extensions and group_by names are visible to every item.
        for item in items {
            match &item.node {
                SegmentItem::Extend { properties } => {
                    for property in properties {
                        match &property.node {
                            SourceProperty::Dimension { .. } | SourceProperty::Measure { .. } => {
                                match self.apply_property(&mut st.local, property) {
                                    Ok(()) => {
                                        if let Some(field) = st.local.fields.last() {
                                            st.segment.extend.push(field.clone());
                                        }
                                    }
                                    Err(_) => failed = true,
                                }
                            }
                            _ => {
                                self.error(
                                    &property.span,
                                    "only dimensions and measures can be declared in a query extend",
                                );
                                failed = true;
                            }
                        }
                    }
                }
                SegmentItem::GroupBy { fields } => {
                    st.dimensions.extend(fields.iter().filter_map(output_name));
                }
                _ => {}
            }
        }

        for item in items {
            if self.segment_item(&mut st, item).is_err() {
                failed = true;
            }
        }

        let orders = std::mem::take(&mut st.orders);
        for (order, order_span) in orders {
            match &order.field {
                OrderKey::Name(name) => match st.outputs.iter().find(|o| &o.name == name) {
                    None => {
                        self.error(&order_span, format!("'{}' is not in the output of this query", name));
                        failed = true;
                    }
                    Some(o) if o.is_nest => {
                        self.error(&order_span, format!("cannot order by nested view '{}'", name));
                        failed = true;
                    }
                    Some(_) => {}
                },
                OrderKey::Position(n) => {
                    if *n == 0 || *n > st.outputs.len() {
                        self.error(&order_span, format!("order_by position {} is out of range", n));
                        failed = true;
                    }
                }
            }
            st.segment.order_by.push(order);
        }

        if failed {
            return Err(Halt::Failed);
        }
        match st.kind {
            Some(Kind::Index) => {
                let mut index = st.index.unwrap_or_default();
                index.filters = st.segment.filters;
                index.limit = st.segment.limit;
                index.sample = st.segment.sample;
                Ok(PipeSegment::Index(index))
            }
            Some(Kind::Project) => Ok(PipeSegment::Project(st.segment)),
            Some(Kind::Reduce) | None => {
                if st.segment.fields.is_empty() {
                    return Err(self.fail(span, "a query stage needs at least one field"));
                }
                Ok(PipeSegment::Reduce(st.segment))
            }
        }
    }

    fn set_kind(&mut self, st: &mut SegmentState, want: Kind, span: &Option<Span>) -> Result<(), Halt> {
        match st.kind {
            None => {
                st.kind = Some(want);
                Ok(())
            }
            Some(k) if k == want => Ok(()),
            Some(k) if k == Kind::Index || want == Kind::Index => {
                Err(self.fail(span, "index cannot be combined with other query fields"))
            }
            Some(_) => Err(self.fail(span, "select cannot be mixed with group_by, aggregate or nest")),
        }
    }

    fn segment_item(&mut self, st: &mut SegmentState, item: &Spanned<SegmentItem>) -> Result<(), Halt> {
        let span = &item.span;
        match &item.node {
            SegmentItem::GroupBy { fields } => {
                self.set_kind(st, Kind::Reduce, span)?;
                self.output_fields(st, fields, Role::GroupBy, span)
            }
            SegmentItem::Aggregate { fields } => {
                self.set_kind(st, Kind::Reduce, span)?;
                self.output_fields(st, fields, Role::Aggregate, span)
            }
            SegmentItem::Select { fields } => {
                self.set_kind(st, Kind::Project, span)?;
                self.output_fields(st, fields, Role::Select, span)
            }
            SegmentItem::Calculate { fields } => {
                self.set_kind(st, Kind::Reduce, span)?;
                self.output_fields(st, fields, Role::Calculate, span)
            }
            SegmentItem::Nest { nests } => {
                self.set_kind(st, Kind::Reduce, span)?;
                let mut result = Ok(());
                for nest in nests {
                    if let Err(h) = self.nest_item(st, nest, span) {
                        result = Err(h);
                    }
                }
                result
            }
            SegmentItem::Where { filters } => {
                for filter in filters {
                    let t = check(filter, &Scope::source(&st.local)).map_err(|m| self.fail(span, m))?;
                    if t.ty != AtomicType::Boolean && !t.is_null {
                        return Err(self.fail(span, format!("where: needs a boolean, got {}", t.ty)));
                    }
                    if t.etype.is_analytic() {
                        return Err(self.fail(span, "analytic functions are only allowed in calculate"));
                    }
                    if t.etype.is_aggregate() {
                        return Err(self.fail(span, "aggregates are not allowed in where:; use having:"));
                    }
                    st.segment
                        .filters
                        .push(FilterCondition::scalar(t.expr, filter.to_string()));
                }
                Ok(())
            }
            SegmentItem::Having { filters } => {
                self.set_kind(st, Kind::Reduce, span)?;
                for filter in filters {
                    let scope = Scope {
                        input: &st.local,
                        outputs: &st.outputs,
                        dimensions: Some(st.dimensions.as_slice()),
                    };
                    let t = check(filter, &scope).map_err(|m| self.fail(span, m))?;
                    if t.ty != AtomicType::Boolean {
                        return Err(self.fail(span, format!("having: needs a boolean, got {}", t.ty)));
                    }
                    if t.etype.is_analytic() {
                        return Err(self.fail(span, "analytic functions are only allowed in calculate"));
                    }
                    st.segment.having.push(FilterCondition {
                        expr: t.expr,
                        expression_type: t.etype,
                        code: filter.to_string(),
                    });
                }
                Ok(())
            }
            SegmentItem::OrderBy { items } => {
                st.orders
                    .extend(items.iter().cloned().map(|o| (o, span.clone())));
                Ok(())
            }
            SegmentItem::Limit { limit } => {
                st.segment.limit = Some(*limit);
                Ok(())
            }
            SegmentItem::Sample { sample } => {
                st.segment.sample = Some(*sample);
                Ok(())
            }
            SegmentItem::Timezone { name } => {
                parse_timezone(name).map_err(|e| self.fail(span, e.to_string()))?;
                st.segment.timezone = Some(name.clone());
                Ok(())
            }
            SegmentItem::Index { fields, by } => {
                self.set_kind(st, Kind::Index, span)?;
                let mut paths = Vec::with_capacity(fields.len());
                for field in fields {
                    let path: Vec<String> = field.split('.').map(str::to_string).collect();
                    match st.local.lookup(&path) {
                        Some(FieldDef::Atomic(a)) if a.is_measure() => {
                            return Err(self.fail(span, format!("cannot index measure '{}'", field)));
                        }
                        Some(FieldDef::Atomic(_)) => paths.push(path),
                        Some(other) => {
                            let message = format!("'{}' is a {}, not a value", field, other.kind_name());
                            return Err(self.fail(span, message));
                        }
                        None => return Err(self.fail(span, format!("'{}' is not defined", field))),
                    }
                }
                if let Some(weight) = by {
                    match st.local.field(weight) {
                        Some(FieldDef::Atomic(a)) if a.is_measure() => {}
                        _ => {
                            return Err(self.fail(span, format!("index weight '{}' must be a measure", weight)));
                        }
                    }
                }
                st.index = Some(IndexSegment {
                    fields: paths,
                    weight_measure: by.clone(),
                    ..Default::default()
                });
                Ok(())
            }
            SegmentItem::Extend { .. } => Ok(()),
        }
    }

    fn output_fields(
        &mut self,
        st: &mut SegmentState,
        fields: &[FieldItem],
        role: Role,
        span: &Option<Span>,
    ) -> Result<(), Halt> {
        let mut result = Ok(());
        for field in fields {
            if let Err(h) = self.output_field(st, field, role, span) {
                result = Err(h);
            }
        }
        result
    }

    fn output_field(
        &mut self,
        st: &mut SegmentState,
        item: &FieldItem,
        role: Role,
        span: &Option<Span>,
    ) -> Result<(), Halt> {
        let visible: &[OutputInfo] = if role == Role::Calculate { &st.outputs } else { &[] };
        let scope = Scope {
            input: &st.local,
            outputs: visible,
            dimensions: Some(st.dimensions.as_slice()),
        };
        let t = check(&item.expr, &scope).map_err(|m| self.fail(span, m))?;
        let Some(name) = output_name(item) else {
            let message = format!("'{}' needs a name: write 'name is {}'", item.expr, item.expr);
            return Err(self.fail(span, message));
        };
        match role {
            Role::GroupBy | Role::Select => {
                if t.etype.is_analytic() {
                    return Err(self.fail(span, "analytic functions are only allowed in calculate"));
                }
                if t.etype.is_aggregate() {
                    let message = if role == Role::GroupBy {
                        format!("'{}' is an aggregate; use aggregate: instead", name)
                    } else {
                        format!("'{}' is an aggregate; aggregates are not allowed in select", name)
                    };
                    return Err(self.fail(span, message));
                }
            }
            Role::Aggregate => {
                if t.etype.is_analytic() {
                    return Err(self.fail(span, "analytic functions are only allowed in calculate"));
                }
                if !t.etype.is_aggregate() {
                    let message = format!("'{}' is not an aggregate; use group_by: instead", name);
                    return Err(self.fail(span, message));
                }
            }
            Role::Calculate => {
                if !t.etype.is_analytic() {
                    let message = format!("'{}' is not an analytic expression", name);
                    return Err(self.fail(span, message));
                }
            }
        }
        if st.outputs.iter().any(|o| o.name == name) {
            return Err(self.fail(span, format!("'{}' is already defined in this query", name)));
        }
        let field = match (&item.name, &item.expr) {
            (None, ExprAst::Field { path }) => QueryField::Ref {
                path: path.clone(),
                alias: None,
            },
            _ => {
                let mut atomic = AtomicField::computed(&name, t.ty, t.expr, t.etype);
                atomic.timeframe = t.timeframe;
                QueryField::Def(FieldDef::Atomic(atomic))
            }
        };
        st.outputs.push(OutputInfo {
            name,
            ty: t.ty,
            etype: t.etype,
            is_nest: false,
        });
        st.segment.fields.push(field);
        Ok(())
    }

    fn nest_item(&mut self, st: &mut SegmentState, nest: &NestItem, span: &Option<Span>) -> Result<(), Halt> {
        let (name, field) = match nest {
            NestItem::View { name } => {
                let pipeline = match st.local.field(name) {
                    Some(FieldDef::Turtle(view)) => view.pipeline.clone(),
                    Some(other) => {
                        let message = format!("'{}' is a {}, not a view", name, other.kind_name());
                        return Err(self.fail(span, message));
                    }
                    None => return Err(self.fail(span, format!("'{}' is not defined", name))),
                };
                self.check_nested(name, &pipeline, span)?;
                (
                    name.clone(),
                    QueryField::Ref {
                        path: vec![name.clone()],
                        alias: None,
                    },
                )
            }
            NestItem::Inline { name, pipeline } => {
                let local = st.local.clone();
                let pipeline = self.translate_pipeline(&local, pipeline, span)?;
                self.check_nested(name, &pipeline, span)?;
                (
                    name.clone(),
                    QueryField::Def(FieldDef::Turtle(TurtleDef {
                        name: name.clone(),
                        pipeline,
                    })),
                )
            }
        };
        if st.outputs.iter().any(|o| o.name == name) {
            return Err(self.fail(span, format!("'{}' is already defined in this query", name)));
        }
        st.outputs.push(OutputInfo {
            name,
            ty: AtomicType::Json,
            etype: ExpressionType::Scalar,
            is_nest: true,
        });
        st.segment.fields.push(field);
        Ok(())
    }

    fn check_nested(&mut self, name: &str, pipeline: &[PipeSegment], span: &Option<Span>) -> Result<(), Halt> {
        if pipeline.len() != 1 {
            let message = format!(
                "nested view '{}' has {} stages; nested pipelines may have only one stage",
                name,
                pipeline.len()
            );
            return Err(self.fail(span, message));
        }
        match &pipeline[0] {
            PipeSegment::Reduce(_) => Ok(()),
            PipeSegment::Project(_) => Err(self.fail(
                span,
                format!("nested view '{}' uses select; a project cannot be nested in a reduce", name),
            )),
            PipeSegment::Index(_) => Err(self.fail(span, format!("nested view '{}' cannot be an index", name))),
        }
    }
}
