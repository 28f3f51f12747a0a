//! Tokenizer for sandbox code
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens so the parser never looks at whitespace. Newlines inside
//! brackets are insignificant, blank and comment-only lines are skipped.

use crate::error::{self, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string, escapes already processed
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

/// Longest first so `**=` wins over `**` and `*`
const OPERATORS: &[&str] = &[
    "**=", "//=", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->", "+",
    "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

const STRING_PREFIXES: &[&str] = &["r", "f", "b", "u", "rf", "fr", "br", "rb"];

pub fn tokenize(src: &str) -> Result<Vec<Token>> {
    Lexer::new(src).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok, line: usize) {
        self.tokens.push(Token { tok, line });
    }

    fn last_is_newline(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(mut self) -> Result<Vec<Token>> {
        while let Some(c) = self.peek() {
            if self.at_line_start && self.depth == 0 {
                self.indentation()?;
                continue;
            }
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        if !self.last_is_newline() {
                            self.push(Tok::Newline, self.line);
                        }
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                '#' => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\\' if self.peek_at(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '"' | '\'' => self.string(false, false)?,
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number()?,
                c if c.is_alphabetic() || c == '_' => self.name()?,
                _ => self.operator()?,
            }
        }

        if !self.last_is_newline() {
            self.push(Tok::Newline, self.line);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, self.line);
        }
        self.push(Tok::Eof, self.line);
        Ok(self.tokens)
    }

    /// Measure leading whitespace and emit Indent/Dedent
    fn indentation(&mut self) -> Result<()> {
        let mut col = 0;
        while let Some(c) = self.peek() {
            match c {
                ' ' => col += 1,
                '\t' => col = (col / 8 + 1) * 8,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }
        self.at_line_start = false;

        // Blank and comment-only lines do not affect indentation
        if matches!(self.peek(), None | Some('\n') | Some('#')) {
            return Ok(());
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if col > current {
            self.indents.push(col);
            self.push(Tok::Indent, self.line);
        } else {
            while self.indents.last().is_some_and(|&i| i > col) {
                self.indents.pop();
                self.push(Tok::Dedent, self.line);
            }
            if self.indents.last().copied().unwrap_or(0) != col {
                return Err(error::syntax(
                    "unindent does not match any outer indentation level",
                    self.line,
                ));
            }
        }
        Ok(())
    }

    fn name(&mut self) -> Result<()> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(), Some('"') | Some('\'')) {
            let lower = word.to_ascii_lowercase();
            if STRING_PREFIXES.contains(&lower.as_str()) {
                return self.string(lower.contains('r'), lower.contains('f'));
            }
        }
        self.push(Tok::Name(word), self.line);
        Ok(())
    }

    fn number(&mut self) -> Result<()> {
        let line = self.line;
        let start = self.pos;

        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits_start = self.pos;
                while self.peek().is_some_and(|c| c.is_digit(radix) || c == '_') {
                    self.pos += 1;
                }
                let digits: String = self.chars[digits_start..self.pos]
                    .iter()
                    .filter(|c| **c != '_')
                    .collect();
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| error::syntax("invalid integer literal", line))?;
                self.push(Tok::Int(value), line);
                return Ok(());
            }
        }

        let mut is_float = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
        if self.peek() == Some('.')
            && !matches!(self.peek_at(1), Some(c) if c.is_alphabetic() || c == '_')
        {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = matches!(self.peek_at(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += digit_at;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }

        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| error::syntax(format!("invalid float literal '{}'", text), line))?;
            self.push(Tok::Float(value), line);
        } else {
            let value = text.parse::<i64>().map_err(|_| {
                error::overflow(format!("integer literal {} is too large", text))
                    .with_context("line", line.to_string())
            })?;
            self.push(Tok::Int(value), line);
        }
        Ok(())
    }

    fn string(&mut self, raw: bool, fmt: bool) -> Result<()> {
        let line = self.line;
        let quote = self.peek().unwrap_or('"');
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => {
                    return Err(error::syntax("unterminated string literal", line));
                }
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(error::syntax("unterminated string literal", line));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = match self.peek_at(1) {
                    Some(n) => n,
                    None => return Err(error::syntax("unterminated string literal", line)),
                };
                self.pos += 2;
                if raw {
                    out.push('\\');
                    out.push(next);
                    if next == '\n' {
                        self.line += 1;
                    }
                    continue;
                }
                self.escape(next, &mut out, line)?;
                continue;
            }
            out.push(c);
            self.pos += 1;
        }

        let tok = if fmt { Tok::FStr(out) } else { Tok::Str(out) };
        self.push(tok, line);
        Ok(())
    }

    fn escape(&mut self, next: char, out: &mut String, line: usize) -> Result<()> {
        match next {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            '\n' => self.line += 1,
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = (0..width).filter_map(|i| self.peek_at(i)).collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == width)
                    .and_then(char::from_u32)
                    .ok_or_else(|| error::syntax("invalid escape sequence in string", line))?;
                self.pos += width;
                out.push(decoded);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn operator(&mut self) -> Result<()> {
        let line = self.line;
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek_at(i) == Some(c));
            if matches {
                self.pos += len;
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op), line);
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or(' ');
        Err(error::syntax(format!("invalid character '{}'", c), line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            toks("x = 2 + 3"),
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Op("+"),
                Tok::Int(3),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_indent_and_dedent() {
        let t = toks("if x:\n    y = 1\n\n    # note\nz = 2\n");
        assert_eq!(t.iter().filter(|t| **t == Tok::Indent).count(), 1);
        assert_eq!(t.iter().filter(|t| **t == Tok::Dedent).count(), 1);
        let indent = t.iter().position(|t| *t == Tok::Indent).unwrap();
        assert_eq!(t[indent - 1], Tok::Newline);
    }

    #[test]
    fn test_brackets_join_lines() {
        let t = toks("x = [1,\n     2]\n");
        assert_eq!(t.iter().filter(|t| **t == Tok::Newline).count(), 1);
        assert!(!t.contains(&Tok::Indent));
    }

    #[test]
    fn test_strings() {
        assert_eq!(toks("'a\\nb'")[0], Tok::Str("a\nb".into()));
        assert_eq!(toks("r'a\\nb'")[0], Tok::Str("a\\nb".into()));
        assert_eq!(toks("f\"{x}!\"")[0], Tok::FStr("{x}!".into()));
        assert_eq!(toks("\"\"\"one\ntwo\"\"\"")[0], Tok::Str("one\ntwo".into()));
        assert_eq!(toks("'\\x41'")[0], Tok::Str("A".into()));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(toks("1_000")[0], Tok::Int(1000));
        assert_eq!(toks("2.5")[0], Tok::Float(2.5));
        assert_eq!(toks("1e3")[0], Tok::Float(1000.0));
        assert_eq!(toks("0xff")[0], Tok::Int(255));
        assert_eq!(toks(".5")[0], Tok::Float(0.5));
    }

    #[test]
    fn test_line_numbers() {
        let tokens = tokenize("a = 1\nb = 2\n").unwrap();
        let b = tokens
            .iter()
            .find(|t| t.tok == Tok::Name("b".into()))
            .unwrap();
        assert_eq!(b.line, 2);
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("x = 'open").is_err());
        assert!(tokenize("if x:\n    a\n  b\n").is_err());
        assert!(tokenize("x = 1 $ 2").is_err());
    }
}
