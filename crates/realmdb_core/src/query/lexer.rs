//! Tokenizer for the query language.
//!
//! Positions are byte offsets into the query text and end up in
//! [`CoreError::Parse`] for errors found by the parser and the binder.

use crate::error::{CoreError, CoreResult};
use crate::value::{ObjectId, Timestamp};
use base64::Engine;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    /// Identifier or keyword; `@`-prefixed names keep their `@`.
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Arg(usize),
    Oid(ObjectId),
    Uuid(Uuid),
    Timestamp(Timestamp),
    Binary(Vec<u8>),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    CaseInsensitive,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

impl Token {
    /// Whether this is the keyword `word`, compared case-insensitively.
    pub fn is_keyword(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(name) if name.eq_ignore_ascii_case(word))
    }
}

pub(crate) struct Lexer<'a> {
    text: &'a str,
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            src: text.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenizes the whole input; the last token is always [`TokenKind::Eof`].
    pub fn tokenize(text: &str) -> CoreResult<Vec<Token>> {
        let mut lexer = Lexer::new(text);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn error(&self, message: impl Into<String>, position: usize) -> CoreError {
        CoreError::parse(message, position)
    }

    fn next_token(&mut self) -> CoreResult<Token> {
        while self.peek_at(0).is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(ch) = self.peek_at(0) else {
            return Ok(Token {
                kind: TokenKind::Eof,
                position: start,
            });
        };
        let kind = match (ch, self.peek_at(1)) {
            (b'"' | b'\'', _) => self.string(ch)?,
            (b'0'..=b'9', _) => self.number()?,
            (b'$', Some(b'0'..=b'9')) => self.argument()?,
            (b'T', Some(b'0'..=b'9' | b'-')) if self.at_timestamp() => self.timestamp()?,
            (b'B', Some(b'6')) if self.text[self.pos..].starts_with("B64\"") => self.binary()?,
            (b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'@', _) => self.word()?,
            (b'(', _) => self.bump(1, TokenKind::LParen),
            (b')', _) => self.bump(1, TokenKind::RParen),
            (b'{', _) => self.bump(1, TokenKind::LBrace),
            (b'}', _) => self.bump(1, TokenKind::RBrace),
            (b',', _) => self.bump(1, TokenKind::Comma),
            (b'.', _) => self.bump(1, TokenKind::Dot),
            (b'-', _) => self.bump(1, TokenKind::Minus),
            (b'=', Some(b'=')) => self.bump(2, TokenKind::Eq),
            (b'=', Some(b'<')) => self.bump(2, TokenKind::Le),
            (b'=', Some(b'>')) => self.bump(2, TokenKind::Ge),
            (b'=', _) => self.bump(1, TokenKind::Eq),
            (b'!', Some(b'=')) => self.bump(2, TokenKind::Ne),
            (b'!', _) => self.bump(1, TokenKind::Not),
            (b'<', Some(b'>')) => self.bump(2, TokenKind::Ne),
            (b'<', Some(b'=')) => self.bump(2, TokenKind::Le),
            (b'<', _) => self.bump(1, TokenKind::Lt),
            (b'>', Some(b'=')) => self.bump(2, TokenKind::Ge),
            (b'>', _) => self.bump(1, TokenKind::Gt),
            (b'&', Some(b'&')) => self.bump(2, TokenKind::And),
            (b'|', Some(b'|')) => self.bump(2, TokenKind::Or),
            (b'[', _) => {
                if self.text[self.pos..].to_ascii_lowercase().starts_with("[c]") {
                    self.pos += 3;
                    TokenKind::CaseInsensitive
                } else {
                    return Err(self.error("expected '[c]'", start));
                }
            }
            _ => {
                let found = self.text[self.pos..].chars().next().unwrap_or('?');
                return Err(self.error(format!("unexpected character '{found}'"), start));
            }
        };
        Ok(Token {
            kind,
            position: start,
        })
    }

    fn bump(&mut self, width: usize, kind: TokenKind) -> TokenKind {
        self.pos += width;
        kind
    }

    fn string(&mut self, quote: u8) -> CoreResult<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.text[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                c if c as u32 == u32::from(quote) => {
                    self.pos += offset + 1;
                    return Ok(TokenKind::Str(out));
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, other)) => out.push(other),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(self.error("unterminated string", start))
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek_at(0).is_some_and(&pred) {
            self.pos += 1;
        }
        &self.text[start..self.pos]
    }

    fn number(&mut self) -> CoreResult<TokenKind> {
        let start = self.pos;
        self.take_while(|c| c.is_ascii_digit());
        let mut float = false;
        if self.peek_at(0) == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            float = true;
            self.pos += 1;
            self.take_while(|c| c.is_ascii_digit());
        }
        if matches!(self.peek_at(0), Some(b'e' | b'E')) {
            float = true;
            self.pos += 1;
            if matches!(self.peek_at(0), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            self.take_while(|c| c.is_ascii_digit());
        }
        let text = &self.text[start..self.pos];
        if float {
            text.parse()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("invalid number '{text}'"), start))
        } else {
            text.parse()
                .map(TokenKind::Int)
                .map_err(|_| self.error(format!("integer '{text}' out of range"), start))
        }
    }

    fn argument(&mut self) -> CoreResult<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let digits = self.take_while(|c| c.is_ascii_digit());
        digits
            .parse()
            .map(TokenKind::Arg)
            .map_err(|_| self.error("invalid argument index", start))
    }

    /// Whether the input continues with `T[-]<digits>:`. Anything else
    /// starting with `T` is a word, so properties like `T1` stay usable.
    fn at_timestamp(&self) -> bool {
        let mut offset = 1;
        if self.peek_at(offset) == Some(b'-') {
            offset += 1;
        }
        let digits_from = offset;
        while self.peek_at(offset).is_some_and(|c| c.is_ascii_digit()) {
            offset += 1;
        }
        offset > digits_from && self.peek_at(offset) == Some(b':')
    }

    /// `T<seconds>:<nanoseconds>`
    fn timestamp(&mut self) -> CoreResult<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let signed = |lexer: &mut Self| -> Option<i64> {
            let from = lexer.pos;
            if lexer.peek_at(0) == Some(b'-') {
                lexer.pos += 1;
            }
            lexer.take_while(|c| c.is_ascii_digit());
            lexer.text[from..lexer.pos].parse().ok()
        };
        let seconds = signed(self);
        if self.peek_at(0) != Some(b':') {
            return Err(self.error("timestamps are written T<seconds>:<nanoseconds>", start));
        }
        self.pos += 1;
        let nanos = signed(self).and_then(|n| i32::try_from(n).ok());
        match (seconds, nanos) {
            (Some(s), Some(n)) => Ok(TokenKind::Timestamp(Timestamp::new(s, n))),
            _ => Err(self.error("invalid timestamp", start)),
        }
    }

    fn binary(&mut self) -> CoreResult<TokenKind> {
        let start = self.pos;
        self.pos += 3;
        let TokenKind::Str(encoded) = self.string(b'"')? else {
            return Err(self.error("invalid binary literal", start));
        };
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(TokenKind::Binary)
            .map_err(|err| self.error(format!("invalid base64: {err}"), start))
    }

    fn word(&mut self) -> CoreResult<TokenKind> {
        let start = self.pos;
        if self.peek_at(0) == Some(b'@') {
            self.pos += 1;
        }
        let word = self.take_while(|c| c.is_ascii_alphanumeric() || c == b'_');
        let word = if self.src[start] == b'@' {
            format!("@{word}")
        } else {
            word.to_owned()
        };
        if word == "@" {
            return Err(self.error("expected a name after '@'", start));
        }
        if self.peek_at(0) == Some(b'(') && (word == "oid" || word == "uuid") {
            self.pos += 1;
            let inner = self.take_while(|c| c != b')').trim().to_owned();
            if self.peek_at(0) != Some(b')') {
                return Err(self.error(format!("unterminated {word}(...)"), start));
            }
            self.pos += 1;
            return if word == "oid" {
                ObjectId::from_hex(&inner)
                    .map(TokenKind::Oid)
                    .ok_or_else(|| self.error(format!("invalid object id '{inner}'"), start))
            } else {
                Uuid::parse_str(&inner)
                    .map(TokenKind::Uuid)
                    .map_err(|_| self.error(format!("invalid uuid '{inner}'"), start))
            };
        }
        Ok(TokenKind::Ident(word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        Lexer::tokenize(text)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn operators_and_literals() {
        assert_eq!(
            kinds("age >= 18 && name ==[c] 'ann'"),
            vec![
                TokenKind::Ident("age".into()),
                TokenKind::Ge,
                TokenKind::Int(18),
                TokenKind::And,
                TokenKind::Ident("name".into()),
                TokenKind::Eq,
                TokenKind::CaseInsensitive,
                TokenKind::Str("ann".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("items.@count > $1"),
            vec![
                TokenKind::Ident("items".into()),
                TokenKind::Dot,
                TokenKind::Ident("@count".into()),
                TokenKind::Gt,
                TokenKind::Arg(1),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn typed_literals() {
        let toks = kinds("T10:5 B64\"AQI=\" oid(0123456789abcdef01234567) 2.5");
        assert_eq!(toks[0], TokenKind::Timestamp(Timestamp::new(10, 5)));
        assert_eq!(toks[1], TokenKind::Binary(vec![1, 2]));
        assert!(matches!(toks[2], TokenKind::Oid(_)));
        assert_eq!(toks[3], TokenKind::Float(2.5));
    }

    #[test]
    fn t_followed_by_digits_is_a_word_unless_it_is_a_timestamp() {
        assert_eq!(
            kinds("T1 == T-3:0"),
            vec![
                TokenKind::Ident("T1".into()),
                TokenKind::Eq,
                TokenKind::Timestamp(Timestamp::new(-3, 0)),
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("T2x")[0], TokenKind::Ident("T2x".into()));
    }

    #[test]
    fn errors_carry_positions() {
        let err = Lexer::tokenize("name == \"open").unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 8, .. }));
        let err = Lexer::tokenize("a # b").unwrap_err();
        assert!(matches!(err, CoreError::Parse { position: 2, .. }));
    }
}
