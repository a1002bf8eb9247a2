//! Hand-rolled lexer: byte stream in, one [`Token`] out per call.
//!
//! A byte/line/col cursor with a clamped-bounds peek helper drives the
//! comment, identifier, numeric, character and string literal rules.

use crate::error::{Diagnostic, Error, IoContext};
use crate::token::{TokKind, Token};
use std::fs;
use std::path::Path;

pub struct Lexer {
    path: String,
    src: Vec<u8>,
    pos: usize,
    ch: u8,
    line: u32,
    col: u32,
}

type Result<T> = std::result::Result<T, Error>;

impl Lexer {
    pub fn from_path(path: &Path) -> Result<Lexer> {
        let bytes = fs::read(path)
            .map_err(|err| Error::Io(err, IoContext::ReadInput, path.to_owned()))?;
        Ok(Lexer::from_bytes(path.to_string_lossy().into_owned(), bytes))
    }

    pub fn from_bytes(path: String, src: Vec<u8>) -> Lexer {
        let ch = *src.first().unwrap_or(&0);
        Lexer {
            path,
            src,
            pos: 0,
            ch,
            line: 1,
            col: 1,
        }
    }

    fn step(&mut self) {
        if self.pos >= self.src.len() {
            return;
        }
        if self.ch == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        self.ch = *self.src.get(self.pos).unwrap_or(&0);
    }

    fn peek(&self, offset: isize) -> u8 {
        let idx = self.pos as isize + offset;
        if idx >= self.src.len() as isize {
            *self.src.last().unwrap_or(&0)
        } else if idx < 0 {
            *self.src.first().unwrap_or(&0)
        } else {
            self.src[idx as usize]
        }
    }

    fn fatal(&self, message: impl Into<String>) -> Error {
        Diagnostic::new(&self.path, self.line, self.col, message).into()
    }

    fn fatal_at(&self, line: u32, col: u32, message: impl Into<String>) -> Error {
        Diagnostic::new(&self.path, line, col, message).into()
    }

    fn step_with(&mut self, kind: TokKind, lexeme: &str) -> Token {
        let tok = Token::new(kind, lexeme.to_owned(), self.line, self.col);
        for _ in 0..lexeme.len() {
            self.step();
        }
        tok
    }

    pub fn next_token(&mut self) -> Result<Token> {
        while self.ch.is_ascii_whitespace() {
            self.step();
        }

        if self.ch == b'/' && self.peek(1) == b'*' {
            self.step();
            self.step();
            while self.ch != 0 && !(self.ch == b'*' && self.peek(1) == b'/') {
                self.step();
            }
            self.step();
            self.step();
            return self.next_token();
        } else if self.ch == b'/' && self.peek(1) == b'/' {
            while self.ch != 0 && self.ch != b'\n' {
                self.step();
            }
            self.step();
            return self.next_token();
        }

        if self.ch.is_ascii_alphabetic() || self.ch == b'_' {
            return Ok(self.lex_identifier());
        }

        if self.ch.is_ascii_digit() || (self.ch == b'-' && self.peek(1).is_ascii_digit()) {
            return Ok(self.lex_number());
        }

        if self.ch == b'\'' {
            return self.lex_char();
        }

        if self.ch == b'"' {
            return self.lex_string();
        }

        self.lex_punct()
    }

    fn lex_identifier(&mut self) -> Token {
        let line = self.line;
        let col = self.col;
        let mut lexeme = String::new();
        while self.ch.is_ascii_alphanumeric() || self.ch == b'_' {
            lexeme.push(self.ch as char);
            self.step();
        }
        Token::new(TokKind::Id, lexeme, line, col)
    }

    fn lex_number(&mut self) -> Token {
        let line = self.line;
        let col = self.col;
        let mut lexeme = String::new();
        let mut is_float = false;

        while self.ch.is_ascii_digit()
            || (self.ch == b'-' && lexeme.is_empty())
            || (self.ch == b'.' && !is_float && self.peek(1).is_ascii_digit())
        {
            if self.ch == b'.' {
                is_float = true;
            }
            lexeme.push(self.ch as char);
            self.step();
        }

        Token::new(
            if is_float { TokKind::Float } else { TokKind::Int },
            lexeme,
            line,
            col,
        )
    }

    fn lex_char(&mut self) -> Result<Token> {
        let line = self.line;
        let col = self.col;
        self.step();

        let value: i32 = if self.ch == b'\\' {
            self.step();
            match self.ch {
                b'n' => 10,
                b't' => 9,
                b'r' => 13,
                b'0' => 0,
                b'\'' | b'"' | b'\\' => self.ch as i32,
                other => {
                    return Err(self.fatal_at(
                        line,
                        col,
                        format!("unsupported escape sequence '\\{}'", other as char),
                    ))
                }
            }
        } else {
            self.ch as i32
        };

        self.step();

        if self.ch != b'\'' {
            return Err(self.fatal_at(line, col, "unclosed character constant"));
        }
        self.step();

        Ok(Token::new(TokKind::Int, value.to_string(), line, col))
    }

    fn lex_string(&mut self) -> Result<Token> {
        let line = self.line;
        let col = self.col;
        self.step();

        let mut lexeme = String::new();
        while self.ch != b'"' && self.ch != 0 && self.ch != b'\n' {
            lexeme.push(self.ch as char);
            self.step();
        }

        if self.ch != b'"' {
            return Err(self.fatal_at(line, col, "unclosed string literal"));
        } else if lexeme.is_empty() {
            return Err(self.fatal_at(line, col, "empty string literal"));
        }
        self.step();

        Ok(Token::new(TokKind::Str, lexeme, line, col))
    }

    fn lex_punct(&mut self) -> Result<Token> {
        use TokKind::*;
        let (kind, lexeme): (TokKind, &str) = match self.ch {
            b'(' => (LParen, "("),
            b')' => (RParen, ")"),
            b'{' => (LBrace, "{"),
            b'}' => (RBrace, "}"),
            b'[' => (LSquare, "["),
            b']' => (RSquare, "]"),
            b';' => (Semi, ";"),
            b',' => (Comma, ","),
            b'#' => (Hash, "#"),
            b'=' if self.peek(1) == b'=' => (EqEq, "=="),
            b'=' => (Equal, "="),
            b'+' if self.peek(1) == b'=' => (PlusEq, "+="),
            b'+' => (Plus, "+"),
            b'-' if self.peek(1) == b'=' => (MinusEq, "-="),
            b'-' => (Minus, "-"),
            b'*' if self.peek(1) == b'=' => (StarEq, "*="),
            b'*' => (Star, "*"),
            b'/' if self.peek(1) == b'=' => (SlashEq, "/="),
            b'/' => (Slash, "/"),
            b'%' if self.peek(1) == b'=' => (PercentEq, "%="),
            b'%' => (Percent, "%"),
            b'<' if self.peek(1) == b'=' => (Lte, "<="),
            b'<' => (Lt, "<"),
            b'>' if self.peek(1) == b'=' => (Gte, ">="),
            b'>' => (Gt, ">"),
            b'!' if self.peek(1) == b'=' => (NotEq, "!="),
            b'&' if self.peek(1) == b'&' => (And, "&&"),
            b'&' => (Amp, "&"),
            b'|' if self.peek(1) == b'|' => (Or, "||"),
            0 => return Ok(Token::new(TokKind::Eof, "<eof>".to_owned(), self.line, self.col)),
            other => {
                return Err(self.fatal(format!("unknown character '{}'", other as char)));
            }
        };
        Ok(self.step_with(kind, lexeme))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lex = Lexer::from_bytes("test.sc".to_owned(), src.as_bytes().to_vec());
        let mut out = Vec::new();
        loop {
            let tok = lex.next_token().unwrap();
            let done = tok.is(TokKind::Eof);
            out.push(tok);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn skips_comments_and_whitespace() {
        let toks = tokens("/* hi */ int  // trailing\n x;");
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![TokKind::Id, TokKind::Id, TokKind::Semi, TokKind::Eof]
        );
    }

    #[test]
    fn negative_int_only_fuses_without_space() {
        let toks = tokens("-5");
        assert_eq!(toks[0].kind, TokKind::Int);
        assert_eq!(toks[0].lexeme, "-5");

        let toks = tokens("x -5");
        assert_eq!(toks[0].kind, TokKind::Id);
        assert_eq!(toks[1].kind, TokKind::Int);
        assert_eq!(toks[1].lexeme, "-5");

        let toks = tokens("x - 5");
        assert_eq!(toks[1].kind, TokKind::Minus);
        assert_eq!(toks[2].kind, TokKind::Int);
        assert_eq!(toks[2].lexeme, "5");
    }

    #[test]
    fn float_requires_digit_after_dot() {
        let toks = tokens("3.14");
        assert_eq!(toks[0].kind, TokKind::Float);
        assert_eq!(toks[0].lexeme, "3.14");
    }

    #[test]
    fn char_literal_escapes() {
        assert_eq!(tokens("'\\n'")[0].lexeme, "10");
        assert_eq!(tokens("'a'")[0].lexeme, "97");
    }

    #[test]
    fn compound_assign_operators() {
        let toks = tokens("+= -= *= /= %=");
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokKind::PlusEq,
                TokKind::MinusEq,
                TokKind::StarEq,
                TokKind::SlashEq,
                TokKind::PercentEq,
                TokKind::Eof,
            ]
        );
    }

    #[test]
    fn unknown_character_is_fatal() {
        let mut lex = Lexer::from_bytes("t.sc".to_owned(), b"@".to_vec());
        let err = lex.next_token().unwrap_err();
        assert!(format!("{}", err).contains("unknown character"));
    }

    #[test]
    fn unterminated_string_is_fatal() {
        let mut lex = Lexer::from_bytes("t.sc".to_owned(), b"\"abc".to_vec());
        let err = lex.next_token().unwrap_err();
        assert!(format!("{}", err).contains("unclosed string literal"));
    }
}
