//! Parse-boundary wrapper around the ruff parser.
//!
//! The compiler consumes ruff AST nodes, never raw source; this module is
//! the only place source text is handed to the parser. It also builds the
//! byte-offset-to-line index the compiler uses to annotate instructions for
//! the line-number table.

use num_bigint::BigInt;
use ruff_python_ast as ast;
use ruff_python_parser::{parse_expression, parse_module};

use crate::bytecode::CompileError;

/// What kind of unit the source is compiled as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    /// A module: a sequence of statements (`exec` mode).
    Exec,
    /// An interactive statement: expression-statement values are printed
    /// and bound to `_` (`single` mode).
    Single,
    /// A single expression whose value is returned (`eval` mode).
    Eval,
}

/// The parsed program plus the line index for its source.
pub(crate) struct ParsedSource {
    pub ast: ParsedAst,
    pub lines: LineIndex,
}

pub(crate) enum ParsedAst {
    Module(ast::ModModule),
    Expression(ast::ModExpression),
}

/// Maps byte offsets to 1-based line numbers.
#[derive(Debug)]
pub(crate) struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    /// Returns the 1-based line containing a byte offset.
    pub(crate) fn line_of(&self, offset: usize) -> u32 {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        u32::try_from(line).expect("line count exceeds u32")
    }
}

/// Parses source text in the given mode.
pub(crate) fn parse_source(source: &str, mode: CompileMode) -> Result<ParsedSource, CompileError> {
    let lines = LineIndex::new(source);
    let ast = match mode {
        CompileMode::Exec | CompileMode::Single => match parse_module(source) {
            Ok(parsed) => ParsedAst::Module(parsed.into_syntax()),
            Err(err) => {
                return Err(CompileError::Syntax {
                    message: err.error.to_string(),
                    line: lines.line_of(err.location.start().to_usize()),
                });
            }
        },
        CompileMode::Eval => match parse_expression(source) {
            Ok(parsed) => ParsedAst::Expression(parsed.into_syntax()),
            Err(err) => {
                return Err(CompileError::Syntax {
                    message: err.error.to_string(),
                    line: lines.line_of(err.location.start().to_usize()),
                });
            }
        },
    };
    Ok(ParsedSource { ast, lines })
}

/// Parses an integer literal that did not fit `i64`, handling radix
/// prefixes and digit-group underscores.
pub(crate) fn parse_int_literal(text: &str) -> Option<BigInt> {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    let (digits, radix) = match cleaned.get(..2) {
        Some("0x" | "0X") => (&cleaned[2..], 16),
        Some("0o" | "0O") => (&cleaned[2..], 8),
        Some("0b" | "0B") => (&cleaned[2..], 2),
        _ => (cleaned.as_str(), 10),
    };
    BigInt::parse_bytes(digits.as_bytes(), radix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_maps_offsets() {
        let index = LineIndex::new("a\nbb\nccc");
        assert_eq!(index.line_of(0), 1);
        assert_eq!(index.line_of(1), 1);
        assert_eq!(index.line_of(2), 2);
        assert_eq!(index.line_of(5), 3);
        assert_eq!(index.line_of(7), 3);
    }

    #[test]
    fn parses_each_mode() {
        assert!(parse_source("x = 1", CompileMode::Exec).is_ok());
        assert!(parse_source("1 + 2", CompileMode::Eval).is_ok());
        assert!(parse_source("x = (", CompileMode::Exec).is_err());
        assert!(parse_source("x = 1", CompileMode::Eval).is_err());
    }

    #[test]
    fn big_int_literals() {
        assert_eq!(parse_int_literal("123"), Some(BigInt::from(123)));
        assert_eq!(parse_int_literal("0xff"), Some(BigInt::from(255)));
        assert_eq!(parse_int_literal("1_000"), Some(BigInt::from(1000)));
        assert_eq!(
            parse_int_literal("123456789012345678901234567890"),
            BigInt::parse_bytes(b"123456789012345678901234567890", 10)
        );
    }
}
