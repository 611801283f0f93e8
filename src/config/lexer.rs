//! Tokenizer for the line-oriented configuration language (§6.1): bare
//! identifiers/keywords, signed integer and floating-point literals
//! (decimal or `0x`-prefixed hex), `a..b` range literals, quoted strings,
//! and the handful of structural punctuation marks.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Range(i64, i64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Eq,
    Comma,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_number(&mut self, line: u32, col: u32, neg: bool) -> Result<TokenKind, LexError> {
        let mut s = String::new();
        if self.peek() == Some('0') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some('x') | Some('X')) {
                self.bump();
                self.bump();
                let mut hex = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_hexdigit() {
                        hex.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                let v = i64::from_str_radix(&hex, 16).map_err(|e| LexError {
                    message: format!("bad hex literal: {e}"),
                    line,
                    col,
                })?;
                return Ok(TokenKind::Int(if neg { -v } else { v }));
            }
        }
        let mut is_float = false;
        let mut is_range = false;
        let mut first_int = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&'.') {
                first_int = s.clone();
                self.bump();
                self.bump();
                is_range = true;
                s.clear();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            } else {
                is_float = true;
                s.push('.');
                self.bump();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        if !is_range {
            if matches!(self.peek(), Some('e') | Some('E')) {
                is_float = true;
                s.push('e');
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    s.push(self.bump().unwrap());
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        if is_range {
            let lo: i64 = first_int.parse().map_err(|_| LexError {
                message: "bad range start".into(),
                line,
                col,
            })?;
            let hi: i64 = s.parse().map_err(|_| LexError {
                message: "bad range end".into(),
                line,
                col,
            })?;
            Ok(TokenKind::Range(if neg { -lo } else { lo }, hi))
        } else if is_float {
            let v: f64 = s.parse().map_err(|_| LexError {
                message: format!("bad float literal: {s}"),
                line,
                col,
            })?;
            Ok(TokenKind::Float(if neg { -v } else { v }))
        } else {
            let v: i64 = s.parse().map_err(|_| LexError {
                message: format!("bad integer literal: {s}"),
                line,
                col,
            })?;
            Ok(TokenKind::Int(if neg { -v } else { v }))
        }
    }

    fn lex_string(&mut self, line: u32, col: u32) -> Result<TokenKind, LexError> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(TokenKind::Str(s)),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(c) => s.push(c),
                    None => {
                        return Err(LexError {
                            message: "unterminated string escape".into(),
                            line,
                            col,
                        })
                    }
                },
                Some(c) => s.push(c),
                None => {
                    return Err(LexError {
                        message: "unterminated string literal".into(),
                        line,
                        col,
                    })
                }
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        let line = self.line;
        let col = self.col;
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                line,
                col,
            });
        };
        let kind = match c {
            '(' => {
                self.bump();
                TokenKind::LParen
            }
            ')' => {
                self.bump();
                TokenKind::RParen
            }
            '{' => {
                self.bump();
                TokenKind::LBrace
            }
            '}' => {
                self.bump();
                TokenKind::RBrace
            }
            '=' => {
                self.bump();
                TokenKind::Eq
            }
            ',' => {
                self.bump();
                TokenKind::Comma
            }
            '"' => self.lex_string(line, col)?,
            '-' => {
                let mut lookahead = self.chars.clone();
                lookahead.next();
                if matches!(lookahead.peek(), Some(c) if c.is_ascii_digit()) {
                    self.bump();
                    self.lex_number(line, col, true)?
                } else {
                    return Err(LexError {
                        message: "unexpected '-'".into(),
                        line,
                        col,
                    });
                }
            }
            c if c.is_ascii_digit() => self.lex_number(line, col, false)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(c) = self.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        s.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(s)
            }
            other => {
                return Err(LexError {
                    message: format!("unexpected character {other:?}"),
                    line,
                    col,
                })
            }
        };
        Ok(Token { kind, line, col })
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(src);
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next_token()?;
        let is_eof = tok.kind == TokenKind::Eof;
        tokens.push(tok);
        if is_eof {
            break;
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_key_assignment_with_unit_suffix() {
        assert_eq!(
            kinds("width = 2 us"),
            vec![
                TokenKind::Ident("width".into()),
                TokenKind::Eq,
                TokenKind::Int(2),
                TokenKind::Ident("us".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_negative_integer() {
        assert_eq!(
            kinds("offset = -25 ns"),
            vec![
                TokenKind::Ident("offset".into()),
                TokenKind::Eq,
                TokenKind::Int(-25),
                TokenKind::Ident("ns".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_hex_and_block_header() {
        assert_eq!(
            kinds("CAEN_V775(0x10000000){}"),
            vec![
                TokenKind::Ident("CAEN_V775".into()),
                TokenKind::LParen,
                TokenKind::Int(0x1000_0000),
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_range_literal() {
        assert_eq!(kinds("0..15"), vec![TokenKind::Range(0, 15), TokenKind::Eof]);
    }

    #[test]
    fn comment_runs_to_end_of_line() {
        assert_eq!(
            kinds("width = 2 # trailing comment\nheight = 3"),
            vec![
                TokenKind::Ident("width".into()),
                TokenKind::Eq,
                TokenKind::Int(2),
                TokenKind::Ident("height".into()),
                TokenKind::Eq,
                TokenKind::Int(3),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_quoted_string() {
        assert_eq!(
            kinds(r#"include "a/b.cfg""#),
            vec![
                TokenKind::Ident("include".into()),
                TokenKind::Str("a/b.cfg".into()),
                TokenKind::Eof,
            ]
        );
    }
}
