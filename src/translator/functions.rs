//! Scalar function catalog used by type checking.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::model::AtomicType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Any,
    String,
    Number,
}

impl ArgKind {
    fn as_str(&self) -> &'static str {
        match self {
            ArgKind::Any => "any",
            ArgKind::String => "string",
            ArgKind::Number => "number",
        }
    }

    fn accepts(&self, ty: AtomicType) -> bool {
        match self {
            ArgKind::Any => true,
            ArgKind::String => ty == AtomicType::String,
            ArgKind::Number => ty == AtomicType::Number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    Fixed(AtomicType),
    /// Type of the first argument.
    FirstArg,
}

#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub name: &'static str,
    /// Argument kinds; the last one repeats for variadic functions.
    pub args: &'static [ArgKind],
    pub min_args: usize,
    pub variadic: bool,
    pub returns: Returns,
}

impl FunctionSig {
    const fn fixed(name: &'static str, args: &'static [ArgKind], returns: Returns) -> Self {
        Self {
            name,
            args,
            min_args: args.len(),
            variadic: false,
            returns,
        }
    }

    const fn optional(
        name: &'static str,
        args: &'static [ArgKind],
        min_args: usize,
        returns: Returns,
    ) -> Self {
        Self {
            name,
            args,
            min_args,
            variadic: false,
            returns,
        }
    }

    const fn variadic(name: &'static str, args: &'static [ArgKind], returns: Returns) -> Self {
        Self {
            name,
            args,
            min_args: 1,
            variadic: true,
            returns,
        }
    }

    fn arity_text(&self) -> String {
        match (self.variadic, self.min_args == self.args.len()) {
            (true, _) => format!("at least {} argument(s)", self.min_args),
            (false, true) => format!("{} argument(s)", self.min_args),
            (false, false) => format!("{} to {} arguments", self.min_args, self.args.len()),
        }
    }

    /// Check argument types and return the result type.
    pub fn check(&self, args: &[AtomicType]) -> Result<AtomicType, String> {
        let too_many = !self.variadic && args.len() > self.args.len();
        if args.len() < self.min_args || too_many {
            return Err(format!(
                "'{}' expects {}, got {}",
                self.name,
                self.arity_text(),
                args.len()
            ));
        }
        for (i, ty) in args.iter().enumerate() {
            let kind = self
                .args
                .get(i)
                .or_else(|| self.args.last())
                .copied()
                .unwrap_or(ArgKind::Any);
            if !kind.accepts(*ty) {
                return Err(format!(
                    "argument {} of '{}' must be {}, got {}",
                    i + 1,
                    self.name,
                    kind.as_str(),
                    ty
                ));
            }
        }
        Ok(match self.returns {
            Returns::Fixed(ty) => ty,
            Returns::FirstArg => args.first().copied().unwrap_or(AtomicType::Json),
        })
    }
}

use ArgKind::{Any, Number as Num, String as Str};
use Returns::{FirstArg, Fixed};

static CATALOG: &[FunctionSig] = &[
    FunctionSig::fixed("lower", &[Str], Fixed(AtomicType::String)),
    FunctionSig::fixed("upper", &[Str], Fixed(AtomicType::String)),
    FunctionSig::fixed("trim", &[Str], Fixed(AtomicType::String)),
    FunctionSig::fixed("ltrim", &[Str], Fixed(AtomicType::String)),
    FunctionSig::fixed("rtrim", &[Str], Fixed(AtomicType::String)),
    FunctionSig::fixed("length", &[Str], Fixed(AtomicType::Number)),
    FunctionSig::fixed("char_length", &[Str], Fixed(AtomicType::Number)),
    FunctionSig::optional("substr", &[Str, Num, Num], 2, Fixed(AtomicType::String)),
    FunctionSig::fixed("replace", &[Str, Str, Str], Fixed(AtomicType::String)),
    FunctionSig::fixed("strpos", &[Str, Str], Fixed(AtomicType::Number)),
    FunctionSig::fixed("starts_with", &[Str, Str], Fixed(AtomicType::Boolean)),
    FunctionSig::fixed("ends_with", &[Str, Str], Fixed(AtomicType::Boolean)),
    FunctionSig::fixed("regexp_extract", &[Str, Str], Fixed(AtomicType::String)),
    FunctionSig::variadic("concat", &[Any], Fixed(AtomicType::String)),
    FunctionSig::fixed("abs", &[Num], Fixed(AtomicType::Number)),
    FunctionSig::optional("round", &[Num, Num], 1, Fixed(AtomicType::Number)),
    FunctionSig::fixed("floor", &[Num], Fixed(AtomicType::Number)),
    FunctionSig::fixed("ceil", &[Num], Fixed(AtomicType::Number)),
    FunctionSig::fixed("sqrt", &[Num], Fixed(AtomicType::Number)),
    FunctionSig::fixed("power", &[Num, Num], Fixed(AtomicType::Number)),
    FunctionSig::fixed("div", &[Num, Num], Fixed(AtomicType::Number)),
    FunctionSig::variadic("greatest", &[Any], FirstArg),
    FunctionSig::variadic("least", &[Any], FirstArg),
    FunctionSig::variadic("coalesce", &[Any], FirstArg),
    FunctionSig::fixed("ifnull", &[Any, Any], FirstArg),
    FunctionSig::fixed("nullif", &[Any, Any], FirstArg),
];

static BY_NAME: Lazy<HashMap<&'static str, &'static FunctionSig>> =
    Lazy::new(|| CATALOG.iter().map(|f| (f.name, f)).collect());

pub fn lookup(name: &str) -> Option<&'static FunctionSig> {
    BY_NAME.get(name.to_ascii_lowercase().as_str()).copied()
}
