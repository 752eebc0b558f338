//! Diagnostics with source locations.
//!
//! Every problem the translator or compiler reports is a [`Diagnostic`]
//! anchored to the URL of the document it came from and, when known, a byte
//! range inside it. Diagnostics accumulate; compilation keeps going past the
//! first one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Byte range within a document.
pub type Span = std::ops::Range<usize>;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A diagnostic message with source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// URL of the document the diagnostic applies to.
    pub url: String,
    /// The span in the document, when the problem has a source location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
    /// The severity level.
    pub severity: Severity,
    /// The diagnostic message.
    pub message: String,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(url: impl Into<String>, span: Option<Span>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            span,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(url: impl Into<String>, span: Option<Span>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            span,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.span {
            Some(span) => write!(
                f,
                "{}: {} (at {}:{}..{})",
                level, self.message, self.url, span.start, span.end
            ),
            None => write!(f, "{}: {} (in {})", level, self.message, self.url),
        }
    }
}

impl std::error::Error for Diagnostic {}

/// Returns true if any diagnostic is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Render a diagnostic against the text of its document.
///
/// Diagnostics without a span fall back to the one-line [`fmt::Display`] form.
pub fn render(diagnostic: &Diagnostic, source: &str) -> String {
    use ariadne::{Config, Label, Report, ReportKind, Source};

    let Some(span) = diagnostic.span.clone() else {
        return diagnostic.to_string();
    };
    let end = span.end.min(source.len());
    let span = span.start.min(end)..end;

    let kind = match diagnostic.severity {
        Severity::Error => ReportKind::Error,
        Severity::Warning => ReportKind::Warning,
    };
    let id = diagnostic.url.clone();
    let mut out = Vec::new();
    let written = Report::build(kind, (id.clone(), span.clone()))
        .with_config(Config::default().with_color(false))
        .with_message(&diagnostic.message)
        .with_label(Label::new((id.clone(), span)).with_message(&diagnostic.message))
        .finish()
        .write((id, Source::from(source.to_string())), &mut out);

    match written {
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(_) => diagnostic.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_span() {
        let d = Diagnostic::error("file:///a.json", Some(3..7), "'x' is not defined");
        assert_eq!(
            d.to_string(),
            "error: 'x' is not defined (at file:///a.json:3..7)"
        );
    }

    #[test]
    fn test_has_errors() {
        let warn = Diagnostic::warning("u", None, "w");
        assert!(!has_errors(&[warn.clone()]));
        assert!(has_errors(&[warn, Diagnostic::error("u", None, "e")]));
    }

    #[test]
    fn test_render_includes_message() {
        let source = "{\"statements\": []}";
        let d = Diagnostic::error("doc", Some(2..12), "bad statement list");
        let rendered = render(&d, source);
        assert!(rendered.contains("bad statement list"));
    }
}
