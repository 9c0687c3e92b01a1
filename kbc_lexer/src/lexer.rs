//! Main lexer implementation.
//!
//! A single-pass, single-byte-lookahead scanner over `Source`'s NUL-padded
//! buffer. Whitespace and both comment forms (`-- ... EOL`, `/* ... */`) are
//! skipped before a token is returned. Malformed input always yields *some*
//! token plus a diagnostic, so the parser can keep going and the user sees
//! more than one error per run.

use crate::token::{keyword_kind, Token, TokenKind};
use kbc_common::source::InternedStr;
use kbc_common::{ErrorSink, Source, SrcLoc};
use log::trace;

pub struct Lexer<'a> {
    source: &'a mut Source,
    pos: u32,
    len: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a mut Source) -> Self {
        let len = source.len() as u32;
        Self { source, pos: 0, len }
    }

    fn byte(&self, ahead: u32) -> u8 {
        self.source.byte_at((self.pos + ahead) as usize)
    }

    fn advance(&mut self) -> u8 {
        let b = self.byte(0);
        self.pos += 1;
        b
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.byte(0) == b {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.len
    }

    /// Resolve a token's `View { start, end }` payload to text. Exposed so
    /// the parser, which only ever sees tokens (not the `Source`), can read
    /// identifier spellings without borrowing `Source` itself.
    pub fn text(&self, start: u32, end: u32) -> &str {
        std::str::from_utf8(&self.source.padded_bytes()[start as usize..end as usize])
            .expect("view bytes are valid utf8 text")
    }

    /// Intern a string on behalf of the parser (used for identifier
    /// spellings, which need to be keyed by `InternedStr` just like
    /// escape-processed string literals).
    pub fn intern(&mut self, s: &str) -> InternedStr {
        self.source.intern(s)
    }

    /// Scan and return the next token. Never returns `None`: at end of
    /// input it returns an `Eof` token forever.
    pub fn next_token(&mut self, errors: &mut ErrorSink) -> Token {
        loop {
            self.skip_whitespace_and_comments(errors);
            let sloc: SrcLoc = self.pos;

            if self.at_end() {
                return Token::new(TokenKind::Eof, sloc);
            }

            let c = self.byte(0);
            trace!("lex at {sloc}: {:?}", c as char);

            if c.is_ascii_digit() {
                return self.read_number(sloc, errors);
            }
            if c == b'"' {
                return self.read_string(sloc, errors);
            }
            if is_ident_start(c) {
                return self.read_identifier(sloc);
            }
            if let Some(tok) = self.read_punctuation(sloc) {
                return tok;
            }

            // open question: the original lexing loop silently
            // continues past an unrecognized character without a
            // diagnostic. Emit one and advance by one byte instead.
            errors.error(format!("unexpected character '{}'", c as char), sloc);
            self.pos += 1;
            return Token::new(TokenKind::Error, sloc);
        }
    }

    fn skip_whitespace_and_comments(&mut self, errors: &mut ErrorSink) {
        loop {
            match self.byte(0) {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'-' if self.byte(1) == b'-' => {
                    self.pos += 2;
                    while !self.at_end() && self.byte(0) != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.byte(1) == b'*' => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.at_end() {
                            errors.error("unterminated block comment", start);
                            break;
                        }
                        if self.byte(0) == b'*' && self.byte(1) == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn read_punctuation(&mut self, sloc: SrcLoc) -> Option<Token> {
        use TokenKind::*;
        let c = self.byte(0);
        let kind = match c {
            b'(' => LParen,
            b')' => RParen,
            b'[' => LBracket,
            b']' => RBracket,
            b'{' => LBrace,
            b'}' => RBrace,
            b',' => Comma,
            b';' => Semicolon,
            b'#' => Hash,
            b':' => Colon,
            b'.' => {
                self.pos += 1;
                if self.byte(0) == b'.' && self.byte(1) == b'.' {
                    self.pos += 2;
                    return Some(Token::new(Ellipsis, sloc));
                }
                return Some(Token::new(Dot, sloc));
            }
            b'+' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { PlusAssign } else { Plus }, sloc));
            }
            b'-' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { MinusAssign } else { Minus }, sloc));
            }
            b'*' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { StarAssign } else { Star }, sloc));
            }
            b'/' => {
                self.pos += 1;
                if self.eat(b'/') {
                    return Some(Token::new(if self.eat(b'=') { SlashSlashAssign } else { SlashSlash }, sloc));
                }
                return Some(Token::new(if self.eat(b'=') { SlashAssign } else { Slash }, sloc));
            }
            b'%' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { PercentAssign } else { Percent }, sloc));
            }
            b'~' => {
                self.pos += 1;
                if self.byte(0) == b'>' && self.byte(1) == b'>' {
                    self.pos += 2;
                    return Some(Token::new(if self.eat(b'=') { RShiftAssign } else { RShift }, sloc));
                }
                return Some(Token::new(if self.eat(b'=') { TildeAssign } else { Tilde }, sloc));
            }
            b'&' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { AmpAssign } else { Amp }, sloc));
            }
            b'|' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { PipeAssign } else { Pipe }, sloc));
            }
            b'^' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { CaretAssign } else { Caret }, sloc));
            }
            b'<' => {
                self.pos += 1;
                if self.eat(b'<') {
                    return Some(Token::new(if self.eat(b'=') { LShiftAssign } else { LShift }, sloc));
                }
                return Some(Token::new(if self.eat(b'=') { Le } else { Lt }, sloc));
            }
            b'>' => {
                self.pos += 1;
                if self.eat(b'>') {
                    return Some(Token::new(if self.eat(b'=') { AShiftAssign } else { AShift }, sloc));
                }
                return Some(Token::new(if self.eat(b'=') { Ge } else { Gt }, sloc));
            }
            b'=' => {
                self.pos += 1;
                return Some(Token::new(if self.eat(b'=') { Eq } else { Assign }, sloc));
            }
            b'!' => {
                self.pos += 1;
                if self.eat(b'=') {
                    return Some(Token::new(NotEq, sloc));
                }
                self.pos -= 1;
                return None;
            }
            _ => return None,
        };
        self.pos += 1;
        Some(Token::new(kind, sloc))
    }

    fn read_identifier(&mut self, sloc: SrcLoc) -> Token {
        let start = self.pos;
        while !self.at_end() && is_ident_continue(self.byte(0)) {
            self.pos += 1;
        }
        let end = self.pos;
        let spelling = std::str::from_utf8(&self.source.padded_bytes()[start as usize..end as usize])
            .expect("identifier bytes are ASCII");
        match keyword_kind(spelling) {
            Some(kind) => Token::new(kind, sloc),
            None => Token::with_view(TokenKind::Identifier, sloc, start, end),
        }
    }

    fn read_number(&mut self, sloc: SrcLoc, errors: &mut ErrorSink) -> Token {
        let start = self.pos;

        if self.byte(0) == b'0' && matches!(self.byte(1), b'b' | b'B' | b'o' | b'O' | b'x' | b'X') {
            return self.read_radix_number(sloc, errors);
        }

        while self.byte(0).is_ascii_digit() {
            self.pos += 1;
        }
        let int_end = self.pos;
        if int_end - start > 1 && self.source.byte_at(start as usize) == b'0' {
            errors.error("leading-zero decimal literals are not allowed", sloc);
        }
        let mut value = parse_uint(&self.source.padded_bytes()[start as usize..int_end as usize], 10);

        if self.byte(0) == b'.' && self.byte(1).is_ascii_digit() {
            self.pos += 1;
            let frac_start = self.pos;
            while self.byte(0).is_ascii_digit() {
                self.pos += 1;
            }
            value += fractional_value(&self.source.padded_bytes()[frac_start as usize..self.pos as usize], 10.0);
        }
        if matches!(self.byte(0), b'e' | b'E') {
            match self.read_exponent_digits() {
                Some(exp) => value *= 10f64.powi(exp),
                None => errors.error("missing exponent digits", sloc),
            }
        }
        Token::with_number(sloc, value)
    }

    fn read_radix_number(&mut self, sloc: SrcLoc, errors: &mut ErrorSink) -> Token {
        let radix_char = self.byte(1);
        self.pos += 2;
        let radix: u32 = match radix_char {
            b'b' | b'B' => 2,
            b'o' | b'O' => 8,
            _ => 16,
        };

        let digits_start = self.pos;
        while (self.byte(0) as char).is_digit(radix) {
            self.pos += 1;
        }
        if self.pos == digits_start {
            errors.error("expected digits after radix prefix", sloc);
        }
        let mut value = parse_uint(&self.source.padded_bytes()[digits_start as usize..self.pos as usize], radix);

        if radix == 16 && self.byte(0) == b'.' && (self.byte(1) as char).is_ascii_hexdigit() {
            self.pos += 1;
            let frac_start = self.pos;
            while self.byte(0).is_ascii_hexdigit() {
                self.pos += 1;
            }
            value += fractional_value(&self.source.padded_bytes()[frac_start as usize..self.pos as usize], 16.0);
        }
        if radix == 16 && matches!(self.byte(0), b'p' | b'P') {
            match self.read_exponent_digits() {
                Some(exp) => value *= 2f64.powi(exp),
                None => errors.error("missing exponent digits", sloc),
            }
        }
        Token::with_number(sloc, value)
    }

    /// Consume `[eEpP] [+-]? digit+` (the marker byte must already be the
    /// current byte) and return the signed exponent, or `None` if no digit
    /// followed the marker (the marker byte is still consumed either way).
    fn read_exponent_digits(&mut self) -> Option<i32> {
        self.pos += 1; // marker
        let negative = self.byte(0) == b'-';
        if matches!(self.byte(0), b'-' | b'+') {
            self.pos += 1;
        }
        let start = self.pos;
        while self.byte(0).is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        let digits = std::str::from_utf8(&self.source.padded_bytes()[start as usize..self.pos as usize]).unwrap();
        let magnitude: i32 = digits.parse().unwrap_or(0);
        Some(if negative { -magnitude } else { magnitude })
    }

    fn read_string(&mut self, sloc: SrcLoc, errors: &mut ErrorSink) -> Token {
        self.pos += 1; // opening quote
        let mut out = String::new();
        let mut has_escape = false;
        let start = self.pos;
        loop {
            if self.at_end() {
                errors.error("unterminated string literal", sloc);
                break;
            }
            let c = self.byte(0);
            if c == b'"' {
                self.pos += 1;
                break;
            }
            if c == b'\n' {
                errors.error("newline in string literal", self.pos);
                break;
            }
            if c == b'\\' {
                has_escape = true;
                self.pos += 1;
                self.read_escape(&mut out, errors);
                continue;
            }
            out.push(c as char);
            self.pos += 1;
        }
        if !has_escape {
            Token::with_view(TokenKind::String, sloc, start, self.pos.saturating_sub(1))
        } else {
            let id = self.source.intern(&out);
            Token::with_interned(TokenKind::String, sloc, id)
        }
    }

    fn read_escape(&mut self, out: &mut String, errors: &mut ErrorSink) {
        let esc_sloc = self.pos;
        if self.at_end() {
            errors.error("unterminated string literal", esc_sloc);
            return;
        }
        let c = self.advance();
        match c {
            b'"' => out.push('"'),
            b'\\' => out.push('\\'),
            b'/' => out.push('/'),
            b'b' => out.push('\u{8}'),
            b'f' => out.push('\u{C}'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b'x' => {
                let hi = self.advance();
                let lo = self.advance();
                match (hex_digit(hi), hex_digit(lo)) {
                    (Some(h), Some(l)) => out.push(((h << 4) | l) as u8 as char),
                    _ => errors.error("invalid \\x escape", esc_sloc),
                }
            }
            b'u' => {
                let cp = self.read_hex_codepoint(4);
                self.push_escaped_codepoint(out, cp, errors, esc_sloc);
            }
            b'U' => {
                if self.eat(b'+') {
                    let cp = self.read_hex_codepoint(6);
                    self.push_escaped_codepoint(out, cp, errors, esc_sloc);
                } else {
                    errors.error("invalid escape sequence", esc_sloc);
                }
            }
            _ => errors.error(format!("invalid escape sequence '\\{}'", c as char), esc_sloc),
        }
    }

    fn read_hex_codepoint(&mut self, digits: u32) -> Option<u32> {
        let mut cp: u32 = 0;
        for _ in 0..digits {
            cp = (cp << 4) | hex_digit(self.advance())?;
        }
        Some(cp)
    }

    fn push_escaped_codepoint(&mut self, out: &mut String, cp: Option<u32>, errors: &mut ErrorSink, esc_sloc: SrcLoc) {
        match cp.and_then(char::from_u32) {
            Some(ch) => out.push(ch),
            None => {
                errors.error("invalid unicode escape sequence", esc_sloc);
                out.push('\u{FFFD}');
            }
        }
    }
}

pub fn is_ident_start(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphabetic()
}

pub fn is_ident_continue(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphanumeric()
}

fn hex_digit(c: u8) -> Option<u32> {
    (c as char).to_digit(16)
}

fn parse_uint(digits: &[u8], radix: u32) -> f64 {
    let mut value: f64 = 0.0;
    for &b in digits {
        if let Some(d) = (b as char).to_digit(radix) {
            value = value * radix as f64 + d as f64;
        }
    }
    value
}

fn fractional_value(digits: &[u8], radix: f64) -> f64 {
    let mut value = 0.0;
    let mut scale = 1.0 / radix;
    for &b in digits {
        if let Some(d) = (b as char).to_digit(radix as u32) {
            value += d as f64 * scale;
            scale /= radix;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbc_common::Source;

    fn lex_all(text: &str) -> (Vec<Token>, ErrorSink) {
        let mut source = Source::new("t.kf", text);
        let mut lexer = Lexer::new(&mut source);
        let mut errors = ErrorSink::new();
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token(&mut errors);
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        (tokens, errors)
    }

    #[test]
    fn skips_whitespace_and_line_comments() {
        let (tokens, errors) = lex_all("  -- comment\n  var");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::Var);
        assert_eq!(tokens[1].kind, TokenKind::Eof);
    }

    #[test]
    fn longest_match_operators() {
        let (tokens, errors) = lex_all("<< <<= ~>> ~>>= // //=");
        assert!(errors.is_empty());
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LShift,
                TokenKind::LShiftAssign,
                TokenKind::RShift,
                TokenKind::RShiftAssign,
                TokenKind::SlashSlash,
                TokenKind::SlashSlashAssign,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keyword_vs_identifier() {
        let (tokens, _) = lex_all("def foo end");
        assert_eq!(tokens[0].kind, TokenKind::Def);
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[2].kind, TokenKind::End);
    }

    #[test]
    fn decimal_and_hex_numbers() {
        let (tokens, errors) = lex_all("10 0x1F 0b101 3.5 1e2");
        assert!(errors.is_empty());
        let values: Vec<f64> = tokens[..5]
            .iter()
            .map(|t| match t.payload {
                crate::token::TokenPayload::Number(n) => n,
                _ => panic!("expected number"),
            })
            .collect();
        assert_eq!(values, vec![10.0, 31.0, 5.0, 3.5, 100.0]);
    }

    #[test]
    fn string_without_escapes_is_a_view() {
        let (tokens, errors) = lex_all("\"hello\"");
        assert!(errors.is_empty());
        assert!(matches!(tokens[0].payload, crate::token::TokenPayload::View { .. }));
    }

    #[test]
    fn unterminated_string_reports_error() {
        let (_, errors) = lex_all("\"abc");
        assert!(errors.has_errors());
    }

    #[test]
    fn leading_zero_decimal_is_rejected() {
        let (_, errors) = lex_all("007");
        assert!(errors.has_errors());
    }

    #[test]
    fn unexpected_character_reports_error_and_advances() {
        let (tokens, errors) = lex_all("@ var");
        assert!(errors.has_errors());
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[1].kind, TokenKind::Var);
    }

    #[rstest::rstest]
    #[case("null", TokenKind::Null)]
    #[case("true", TokenKind::True)]
    #[case("false", TokenKind::False)]
    #[case("var", TokenKind::Var)]
    #[case("def", TokenKind::Def)]
    #[case("end", TokenKind::End)]
    #[case("if", TokenKind::If)]
    #[case("elif", TokenKind::Elif)]
    #[case("else", TokenKind::Else)]
    #[case("for", TokenKind::For)]
    #[case("in", TokenKind::In)]
    #[case("while", TokenKind::While)]
    #[case("repeat", TokenKind::Repeat)]
    #[case("until", TokenKind::Until)]
    #[case("break", TokenKind::Break)]
    #[case("continue", TokenKind::Continue)]
    #[case("return", TokenKind::Return)]
    #[case("throw", TokenKind::Throw)]
    #[case("and", TokenKind::And)]
    #[case("or", TokenKind::Or)]
    #[case("not", TokenKind::Not)]
    #[case("is", TokenKind::Is)]
    #[case("yield", TokenKind::Yield)]
    #[case("object", TokenKind::Object)]
    #[case("self", TokenKind::SelfKw)]
    #[case("super", TokenKind::Super)]
    fn every_keyword_lexes_to_its_own_kind(#[case] spelling: &str, #[case] expected: TokenKind) {
        let (tokens, errors) = lex_all(spelling);
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, expected);
    }

    #[rstest::rstest]
    #[case("0", 0.0)]
    #[case("10", 10.0)]
    #[case("0b101", 5.0)]
    #[case("0o17", 15.0)]
    #[case("0x1F", 31.0)]
    #[case("0x1.8p1", 3.0)]
    #[case("3.5", 3.5)]
    #[case("1e2", 100.0)]
    #[case("1e-2", 0.01)]
    fn numeric_literal_edge_cases_parse_to_the_expected_value(
        #[case] spelling: &str,
        #[case] expected: f64,
    ) {
        let (tokens, errors) = lex_all(spelling);
        assert!(errors.is_empty(), "{spelling}: {errors:?}");
        match tokens[0].payload {
            crate::token::TokenPayload::Number(n) => assert_eq!(n, expected, "{spelling}"),
            ref other => panic!("{spelling}: expected number, got {other:?}"),
        }
    }
}
