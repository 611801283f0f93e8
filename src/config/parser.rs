//! Recursive-descent parser over the lexer's token stream, plus the
//! `include` resolver (absolute path, path relative to the including
//! file, or the configurable default search path) with cycle detection.

use std::path::{Path, PathBuf};

use crate::error::CrateError;

use super::block::{ConfigBlock, Scalar, ScalarValue, Source};
use super::lexer::{self, Token, TokenKind};
use super::unit::Unit;

/// Largest fragment `parse_snippet` accepts (control-plane reconfiguration
/// payloads are deliberately tiny).
pub const SNIPPET_MAX_BYTES: usize = 256;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    path: String,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, tok: &Token, message: impl Into<String>) -> CrateError {
        CrateError::Config {
            key: String::new(),
            message: message.into(),
            path: self.path.clone(),
            line: tok.line,
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, CrateError> {
        if &self.peek().kind == kind {
            Ok(self.bump())
        } else {
            let tok = self.peek().clone();
            Err(self.err(&tok, format!("expected {kind:?}, found {:?}", tok.kind)))
        }
    }

    fn source(&self, tok: &Token) -> Source {
        Source {
            path: self.path.clone(),
            line: tok.line,
            col: tok.col,
        }
    }

    /// Parses one value, absorbing a trailing unit-suffix identifier if
    /// the value was numeric and the next token names a known unit.
    fn parse_value(&mut self) -> Result<Scalar, CrateError> {
        let tok = self.bump();
        let source = self.source(&tok);
        let (value, mut unit) = match tok.kind {
            TokenKind::Int(i) => (ScalarValue::Integer(i), Unit::None),
            TokenKind::Float(f) => (ScalarValue::Double(f), Unit::None),
            TokenKind::Range(a, b) => (ScalarValue::Range(a, b), Unit::None),
            TokenKind::Str(s) => (ScalarValue::String(s), Unit::None),
            TokenKind::Ident(s) => (ScalarValue::Keyword(s), Unit::None),
            ref other => return Err(self.err(&tok, format!("unexpected token in value position: {other:?}"))),
        };
        if matches!(value, ScalarValue::Integer(_) | ScalarValue::Double(_)) {
            if let TokenKind::Ident(name) = &self.peek().kind {
                if let Some(u) = Unit::from_suffix(&name.to_ascii_lowercase()) {
                    unit = u;
                    self.bump();
                }
            }
        }
        Ok(Scalar { value, unit, source })
    }

    fn parse_value_list(&mut self) -> Result<Vec<Scalar>, CrateError> {
        let mut out = vec![self.parse_value()?];
        while self.peek().kind == TokenKind::Comma {
            self.bump();
            out.push(self.parse_value()?);
        }
        Ok(out)
    }

    /// Parses statements until EOF or `}` into `block`. `includer` handles
    /// `include "path"` lines; it is `None` inside a snippet parse, where
    /// includes are rejected.
    fn parse_statements(
        &mut self,
        block: &mut ConfigBlock,
        includer: &mut Option<&mut dyn FnMut(&str, &mut ConfigBlock) -> Result<(), CrateError>>,
    ) -> Result<(), CrateError> {
        loop {
            match &self.peek().kind {
                TokenKind::RBrace | TokenKind::Eof => return Ok(()),
                TokenKind::Ident(name) if name == "include" => {
                    self.bump();
                    let tok = self.peek().clone();
                    let path = match self.bump().kind {
                        TokenKind::Str(s) => s,
                        other => return Err(self.err(&tok, format!("include expects a string path, found {other:?}"))),
                    };
                    match includer {
                        Some(f) => f(&path, block)?,
                        None => return Err(self.err(&tok, "include is not allowed inside a config snippet")),
                    }
                }
                TokenKind::Ident(name) => {
                    let name = name.clone();
                    let head = self.bump();
                    match &self.peek().kind {
                        TokenKind::Eq => {
                            self.bump();
                            let values = self.parse_value_list()?;
                            block.push_scalar(name, values);
                        }
                        TokenKind::LParen | TokenKind::LBrace => {
                            let params = if self.peek().kind == TokenKind::LParen {
                                self.bump();
                                let params = if self.peek().kind == TokenKind::RParen {
                                    Vec::new()
                                } else {
                                    self.parse_value_list()?
                                };
                                self.expect(&TokenKind::RParen)?;
                                params
                            } else {
                                Vec::new()
                            };
                            self.expect(&TokenKind::LBrace)?;
                            let mut child = ConfigBlock::new(name, self.source(&head));
                            child.params = params;
                            self.parse_statements(&mut child, includer)?;
                            self.expect(&TokenKind::RBrace)?;
                            block.push_block(child);
                        }
                        other => return Err(self.err(&head, format!("expected '=' or a block body, found {other:?}"))),
                    }
                }
                other => {
                    let tok = self.peek().clone();
                    return Err(self.err(&tok, format!("unexpected token at statement start: {other:?}")));
                }
            }
        }
    }
}

fn lex_err_to_crate_error(path: &str, e: lexer::LexError) -> CrateError {
    CrateError::Config {
        key: String::new(),
        message: e.message,
        path: path.to_string(),
        line: e.line,
    }
}

/// Parses an in-memory source string into a root block; does not resolve
/// `include`. Used directly by `parse_snippet` and internally by `load`.
fn parse_source(path: &str, src: &str) -> Result<ConfigBlock, CrateError> {
    let tokens = lexer::tokenize(src).map_err(|e| lex_err_to_crate_error(path, e))?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        path: path.to_string(),
    };
    let mut root = ConfigBlock::new(
        "",
        Source {
            path: path.to_string(),
            line: 1,
            col: 1,
        },
    );
    parser.parse_statements(&mut root, &mut None)?;
    Ok(root)
}

/// Loads a config file and recursively resolves every `include`,
/// tracking a stack of canonicalized paths to detect cycles.
///
/// `default_path` is consulted for bare (non-absolute, non-relative-to-
/// includer) include paths, mirroring a configurable default search path.
pub fn load(path: impl AsRef<Path>, default_path: Option<&Path>) -> Result<ConfigBlock, CrateError> {
    let mut root = ConfigBlock::new(
        "",
        Source {
            path: path.as_ref().display().to_string(),
            line: 1,
            col: 1,
        },
    );
    let mut stack = Vec::new();
    parse_file_into(path.as_ref(), default_path, &mut stack, &mut root)?;
    Ok(root)
}

fn resolve_include_path(raw: &str, including_file: &Path, default_path: Option<&Path>) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    if let Some(parent) = including_file.parent() {
        let relative = parent.join(candidate);
        if relative.exists() {
            return relative;
        }
    }
    if let Some(default_path) = default_path {
        let from_default = default_path.join(candidate);
        if from_default.exists() {
            return from_default;
        }
    }
    candidate.to_path_buf()
}

/// Parses `path` and appends its content directly into `into`, resolving
/// nested `include`s recursively as they're encountered. `stack` holds the
/// canonicalized paths of files currently being included, for cycle
/// detection.
fn parse_file_into(
    path: &Path,
    default_path: Option<&Path>,
    stack: &mut Vec<PathBuf>,
    into: &mut ConfigBlock,
) -> Result<(), CrateError> {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if stack.contains(&canonical) {
        let mut chain: Vec<String> = stack.iter().map(|p| p.display().to_string()).collect();
        chain.push(canonical.display().to_string());
        return Err(CrateError::IncludeCycle(chain.join(" -> ")));
    }
    let src = std::fs::read_to_string(path).map_err(|e| CrateError::Config {
        key: String::new(),
        message: format!("cannot read {}: {e}", path.display()),
        path: path.display().to_string(),
        line: 0,
    })?;
    let tokens = lexer::tokenize(&src).map_err(|e| lex_err_to_crate_error(&path.display().to_string(), e))?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        path: path.display().to_string(),
    };

    stack.push(canonical);
    let mut includer = |raw: &str, block: &mut ConfigBlock| -> Result<(), CrateError> {
        let resolved = resolve_include_path(raw, path, default_path);
        parse_file_into(&resolved, default_path, stack, block)
    };
    let result = parser.parse_statements(into, &mut Some(&mut includer));
    stack.pop();
    result
}

/// Parses a small, include-free, block-only fragment (control-plane
/// reconfiguration payloads). Rejects anything over [`SNIPPET_MAX_BYTES`].
pub fn parse_snippet(src: &str) -> Result<ConfigBlock, CrateError> {
    if src.len() > SNIPPET_MAX_BYTES {
        return Err(CrateError::Config {
            key: String::new(),
            message: format!("snippet exceeds {SNIPPET_MAX_BYTES} bytes"),
            path: "<snippet>".into(),
            line: 1,
        });
    }
    parse_source("<snippet>", src)
}
