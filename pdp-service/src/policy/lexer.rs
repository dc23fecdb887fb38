//! Lexer for the policy language
//!
//! The surface is Python-shaped: significant indentation (INDENT/DEDENT
//! tokens from a stack of indent widths), `#` comments, implicit line
//! joining inside brackets. Only spaces indent; tabs are rejected.

use std::fmt;

/// A token with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals and names
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords
    Def,
    Return,
    If,
    Elif,
    Else,
    For,
    In,
    Not,
    And,
    Or,
    Break,
    Continue,
    Pass,
    NoneLit,
    True,
    False,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,

    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "identifier {s:?}"),
            Self::Int(n) => write!(f, "int {n}"),
            Self::Float(x) => write!(f, "float {x}"),
            Self::Str(_) => write!(f, "string literal"),
            Self::Newline => write!(f, "newline"),
            Self::Indent => write!(f, "indent"),
            Self::Dedent => write!(f, "dedent"),
            Self::Eof => write!(f, "end of input"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Lexical or syntactic error with a source position
#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

/// Tokenize a full script
pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    indents: Vec<usize>,
    bracket_depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            indents: vec![0],
            bracket_depth: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        loop {
            if self.at_line_start && self.bracket_depth == 0 {
                self.handle_indentation()?;
                if self.pos >= self.chars.len() {
                    break;
                }
            }
            match self.peek() {
                None => break,
                Some(c) => self.scan_char(c)?,
            }
        }

        // Terminate a trailing logical line and close open blocks.
        if !matches!(
            self.tokens.last().map(|t| &t.kind),
            None | Some(TokenKind::Newline)
        ) {
            self.push(TokenKind::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent);
        }
        self.push(TokenKind::Eof);
        Ok(self.tokens)
    }

    /// Measure leading whitespace and emit INDENT/DEDENT as needed
    fn handle_indentation(&mut self) -> Result<(), SyntaxError> {
        loop {
            let mut width = 0;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => {
                        width += 1;
                        self.advance();
                    }
                    '\t' => {
                        return Err(SyntaxError::new("tabs cannot indent", self.line));
                    }
                    _ => break,
                }
            }
            match self.peek() {
                // Blank or comment-only lines do not affect indentation.
                Some('\n') => {
                    self.advance();
                    continue;
                }
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                None => return Ok(()),
                Some(_) => {
                    let current = *self.indents.last().unwrap();
                    if width > current {
                        self.indents.push(width);
                        self.push(TokenKind::Indent);
                    } else if width < current {
                        while *self.indents.last().unwrap() > width {
                            self.indents.pop();
                            self.push(TokenKind::Dedent);
                        }
                        if *self.indents.last().unwrap() != width {
                            return Err(SyntaxError::new(
                                "unindent does not match any outer level",
                                self.line,
                            ));
                        }
                    }
                    self.at_line_start = false;
                    return Ok(());
                }
            }
        }
    }

    fn scan_char(&mut self, c: char) -> Result<(), SyntaxError> {
        match c {
            ' ' => {
                self.advance();
            }
            '\t' => {
                return Err(SyntaxError::new("tabs are not allowed", self.line));
            }
            '#' => self.skip_comment(),
            '\n' => {
                self.advance();
                if self.bracket_depth == 0 {
                    if !matches!(
                        self.tokens.last().map(|t| &t.kind),
                        None | Some(TokenKind::Newline) | Some(TokenKind::Indent)
                    ) {
                        self.push_at(TokenKind::Newline, self.line - 1);
                    }
                    self.at_line_start = true;
                }
            }
            '"' | '\'' => self.scan_string(c)?,
            c if c.is_ascii_digit() => self.scan_number()?,
            c if c.is_alphabetic() || c == '_' => self.scan_ident(),
            _ => self.scan_operator(c)?,
        }
        Ok(())
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn scan_string(&mut self, quote: char) -> Result<(), SyntaxError> {
        let start_line = self.line;
        self.advance();
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(SyntaxError::new("unterminated string literal", start_line));
                }
                Some('\\') => {
                    self.advance();
                    let escaped = self
                        .peek()
                        .ok_or_else(|| SyntaxError::new("unterminated escape", start_line))?;
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        other => {
                            return Err(SyntaxError::new(
                                format!("unknown escape \\{other}"),
                                start_line,
                            ))
                        }
                    });
                    self.advance();
                }
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
        self.push(TokenKind::Str(value));
        Ok(())
    }

    fn scan_number(&mut self) -> Result<(), SyntaxError> {
        let start = self.pos;
        let line = self.line;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
        let mut is_float = false;
        if self.peek() == Some('.')
            && self
                .chars
                .get(self.pos + 1)
                .is_some_and(|c| c.is_ascii_digit())
        {
            is_float = true;
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if is_float {
            let x: f64 = text
                .parse()
                .map_err(|_| SyntaxError::new(format!("bad float literal {text}"), line))?;
            self.push(TokenKind::Float(x));
        } else {
            let n: i64 = text
                .parse()
                .map_err(|_| SyntaxError::new(format!("int literal {text} overflows"), line))?;
            self.push(TokenKind::Int(n));
        }
        Ok(())
    }

    fn scan_ident(&mut self) {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.advance();
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let kind = match text.as_str() {
            "def" => TokenKind::Def,
            "return" => TokenKind::Return,
            "if" => TokenKind::If,
            "elif" => TokenKind::Elif,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "not" => TokenKind::Not,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "break" => TokenKind::Break,
            "continue" => TokenKind::Continue,
            "pass" => TokenKind::Pass,
            "None" => TokenKind::NoneLit,
            "True" => TokenKind::True,
            "False" => TokenKind::False,
            _ => TokenKind::Ident(text),
        };
        self.push(kind);
    }

    fn scan_operator(&mut self, c: char) -> Result<(), SyntaxError> {
        let kind = match c {
            '(' => {
                self.bracket_depth += 1;
                TokenKind::LParen
            }
            ')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            '[' => {
                self.bracket_depth += 1;
                TokenKind::LBracket
            }
            ']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            '{' => {
                self.bracket_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '%' => TokenKind::Percent,
            '/' => {
                self.advance();
                if self.peek() == Some('/') {
                    self.advance();
                    self.push(TokenKind::SlashSlash);
                } else {
                    self.push(TokenKind::Slash);
                }
                return Ok(());
            }
            '=' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::Eq);
                } else {
                    self.push(TokenKind::Assign);
                }
                return Ok(());
            }
            '!' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::Ne);
                    return Ok(());
                }
                return Err(SyntaxError::new("unexpected character '!'", self.line));
            }
            '<' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::Le);
                } else {
                    self.push(TokenKind::Lt);
                }
                return Ok(());
            }
            '>' => {
                self.advance();
                if self.peek() == Some('=') {
                    self.advance();
                    self.push(TokenKind::Ge);
                } else {
                    self.push(TokenKind::Gt);
                }
                return Ok(());
            }
            other => {
                return Err(SyntaxError::new(
                    format!("unexpected character {other:?}"),
                    self.line,
                ));
            }
        };
        self.advance();
        self.push(kind);
        Ok(())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) {
        if let Some(&c) = self.chars.get(self.pos) {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }

    fn push(&mut self, kind: TokenKind) {
        self.push_at(kind, self.line);
    }

    fn push_at(&mut self, kind: TokenKind, line: u32) {
        self.tokens.push(Token {
            kind,
            line,
            col: self.col,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_function() {
        use TokenKind::*;
        let got = kinds("def authorize():\n    return True\n");
        assert_eq!(
            got,
            vec![
                Def,
                Ident("authorize".into()),
                LParen,
                RParen,
                Colon,
                Newline,
                Indent,
                Return,
                True,
                Newline,
                Dedent,
                Eof
            ]
        );
    }

    #[test]
    fn test_nested_dedents_close() {
        use TokenKind::*;
        let got = kinds("def f():\n    if x:\n        return 1\n    return 2\n");
        let dedents = got.iter().filter(|k| **k == Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn test_blank_and_comment_lines_ignored() {
        let got = kinds("x = 1\n\n# comment\n   # indented comment\ny = 2\n");
        let indents = got
            .iter()
            .filter(|k| matches!(k, TokenKind::Indent))
            .count();
        assert_eq!(indents, 0);
    }

    #[test]
    fn test_implicit_line_joining() {
        let got = kinds("x = [1,\n     2]\n");
        let newlines = got
            .iter()
            .filter(|k| matches!(k, TokenKind::Newline))
            .count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_operators_and_literals() {
        use TokenKind::*;
        let got = kinds("a == 3.5 != 'x' // 2\n");
        assert_eq!(
            got,
            vec![
                Ident("a".into()),
                Eq,
                Float(3.5),
                Ne,
                Str("x".into()),
                SlashSlash,
                Int(2),
                Newline,
                Eof
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let got = kinds("\"a\\n\\\"b\"\n");
        assert_eq!(got[0], TokenKind::Str("a\n\"b".into()));
    }

    #[test]
    fn test_bad_indent_is_error() {
        assert!(tokenize("if x:\n        a = 1\n    b = 2\n").is_err());
    }

    #[test]
    fn test_tab_rejected() {
        assert!(tokenize("\tx = 1\n").is_err());
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("x = 'oops\n").is_err());
    }
}
