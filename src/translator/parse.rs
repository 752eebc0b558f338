//! Document parsing seam.
//!
//! The grammar lives outside this crate. A [`DocumentParser`] turns the text
//! of one URL into a [`Document`]; the bundled [`JsonDocumentParser`] reads
//! the AST serialized as JSON.

use crate::diagnostics::Span;

use super::ast::Document;

/// A syntax error with its location in the document text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

pub trait DocumentParser: Send + Sync {
    fn parse(&self, url: &str, text: &str) -> Result<Document, ParseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDocumentParser;

/// Byte offset of a 1-based line and column.
fn offset_of(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len())
}

impl DocumentParser for JsonDocumentParser {
    fn parse(&self, _url: &str, text: &str) -> Result<Document, ParseError> {
        serde_json::from_str(text).map_err(|e| {
            let at = offset_of(text, e.line(), e.column());
            ParseError {
                message: e.to_string(),
                span: Some(at..at),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document() {
        let doc = JsonDocumentParser.parse("file:///a.json", "{}").unwrap();
        assert!(doc.statements.is_empty());
    }

    #[test]
    fn test_syntax_error_has_location() {
        let text = "{\n  \"statements\": [ oops ]\n}";
        let err = JsonDocumentParser.parse("file:///a.json", text).unwrap_err();
        let span = err.span.unwrap();
        let second_line = text.find('\n').unwrap()..text.rfind('\n').unwrap();
        assert!(second_line.contains(&span.start));
    }
}
