use crate::classifier::SqlMode;

/// One lexical token of a SQL statement. Slices borrow from the statement
/// text; keywords are surfaced as `Ident` and matched case-insensitively by
/// the statement walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Ident(&'a str),
    QuotedIdent(&'a str),
    StringLit(&'a str),
    Number(&'a str),
    UserVar(&'a str),
    SysVar(&'a str),
    Punct(char),
    /// Multi-character operator such as `:=`, `<=`, `<>`.
    Op(&'a str),
    Param,
}

impl<'a> Token<'a> {
    pub fn is_kw(&self, kw: &str) -> bool {
        matches!(self, Token::Ident(s) if s.eq_ignore_ascii_case(kw))
    }

    pub fn ident(&self) -> Option<&'a str> {
        match self {
            Token::Ident(s) | Token::QuotedIdent(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spanned<'a> {
    pub tok: Token<'a>,
    pub start: usize,
}

/// Hand-rolled SQL lexer. Comments are skipped (and flagged), strings and
/// quoted identifiers honour the active SQL mode: under the default mode a
/// double-quoted run is a string literal, under Oracle mode an identifier.
pub struct Tokenizer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    sql_mode: SqlMode,
    /// Input ended inside a string or block comment.
    pub truncated: bool,
    /// At least one comment was seen while lexing.
    pub saw_comment: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str, sql_mode: SqlMode) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            sql_mode,
            truncated: false,
            saw_comment: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek() {
            self.pos += 1;
            if b == b'\n' {
                break;
            }
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2; // consume "/*"
        loop {
            match self.peek() {
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    self.pos += 2;
                    return;
                }
                Some(_) => self.pos += 1,
                None => {
                    self.truncated = true;
                    return;
                }
            }
        }
    }

    /// Skip a quoted run, honouring doubled-quote and backslash escapes.
    /// Returns the contents (without the delimiters).
    fn quoted(&mut self, delim: u8) -> &'a str {
        self.pos += 1; // opening delimiter
        let start = self.pos;
        loop {
            match self.peek() {
                Some(b) if b == delim => {
                    if self.peek_at(1) == Some(delim) {
                        self.pos += 2;
                    } else {
                        let s = &self.src[start..self.pos];
                        self.pos += 1;
                        return s;
                    }
                }
                Some(b'\\') if delim != b'`' && self.sql_mode == SqlMode::Default => {
                    // backslash escapes are off in Oracle mode
                    self.pos += 2.min(self.bytes.len() - self.pos);
                }
                Some(_) => self.pos += 1,
                None => {
                    self.truncated = true;
                    return &self.src[start..self.pos];
                }
            }
        }
    }

    fn ident_run(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80 {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.src[start..self.pos]
    }

    fn number_run(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_hexdigit() || matches!(b, b'.' | b'x' | b'X' | b'e' | b'E' | b'+' | b'-')
            {
                // sign only directly after an exponent marker
                if matches!(b, b'+' | b'-')
                    && !matches!(self.bytes.get(self.pos - 1), Some(b'e') | Some(b'E'))
                {
                    break;
                }
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.src[start..self.pos]
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Spanned<'a>;

    fn next(&mut self) -> Option<Spanned<'a>> {
        loop {
            let b = self.peek()?;
            let start = self.pos;
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'#' => {
                    self.saw_comment = true;
                    self.skip_line();
                }
                b'-' if self.peek_at(1) == Some(b'-')
                    && matches!(
                        self.peek_at(2),
                        None | Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n')
                    ) =>
                {
                    self.saw_comment = true;
                    self.skip_line();
                }
                b'/' if self.peek_at(1) == Some(b'*') => {
                    self.saw_comment = true;
                    self.skip_block_comment();
                }
                b'\'' => {
                    let s = self.quoted(b'\'');
                    return Some(Spanned {
                        tok: Token::StringLit(s),
                        start,
                    });
                }
                b'"' => {
                    let s = self.quoted(b'"');
                    let tok = if self.sql_mode == SqlMode::Oracle {
                        Token::QuotedIdent(s)
                    } else {
                        Token::StringLit(s)
                    };
                    return Some(Spanned { tok, start });
                }
                b'`' => {
                    let s = self.quoted(b'`');
                    return Some(Spanned {
                        tok: Token::QuotedIdent(s),
                        start,
                    });
                }
                b'@' => {
                    if self.peek_at(1) == Some(b'@') {
                        self.pos += 2;
                        let name = self.ident_or_dotted();
                        return Some(Spanned {
                            tok: Token::SysVar(name),
                            start,
                        });
                    }
                    self.pos += 1;
                    // @`quoted` user variables
                    if self.peek() == Some(b'`') {
                        let s = self.quoted(b'`');
                        return Some(Spanned {
                            tok: Token::UserVar(s),
                            start,
                        });
                    }
                    let name = self.ident_run();
                    return Some(Spanned {
                        tok: Token::UserVar(name),
                        start,
                    });
                }
                b'?' => {
                    self.pos += 1;
                    return Some(Spanned {
                        tok: Token::Param,
                        start,
                    });
                }
                b':' if self.peek_at(1) == Some(b'=') => {
                    self.pos += 2;
                    return Some(Spanned {
                        tok: Token::Op(":="),
                        start,
                    });
                }
                b'<' | b'>' | b'!' => {
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'=') | Some(b'>')) {
                        self.pos += 1;
                        return Some(Spanned {
                            tok: Token::Op(&self.src[start..self.pos]),
                            start,
                        });
                    }
                    return Some(Spanned {
                        tok: Token::Punct(b as char),
                        start,
                    });
                }
                b'0'..=b'9' => {
                    let n = self.number_run();
                    return Some(Spanned {
                        tok: Token::Number(n),
                        start,
                    });
                }
                b'.' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => {
                    let n = self.number_run();
                    return Some(Spanned {
                        tok: Token::Number(n),
                        start,
                    });
                }
                _ if b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80 => {
                    let id = self.ident_run();
                    return Some(Spanned {
                        tok: Token::Ident(id),
                        start,
                    });
                }
                _ => {
                    self.bump();
                    return Some(Spanned {
                        tok: Token::Punct(b as char),
                        start,
                    });
                }
            }
        }
    }
}

impl<'a> Tokenizer<'a> {
    /// `@@name`, `@@session.name`, `@@global.name` — swallow the dotted form
    /// so the scope prefix stays attached to the variable token.
    fn ident_or_dotted(&mut self) -> &'a str {
        let start = self.pos;
        self.ident_run();
        if self.peek() == Some(b'.') {
            self.pos += 1;
            self.ident_run();
        }
        &self.src[start..self.pos]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(sql: &str) -> Vec<Token<'_>> {
        Tokenizer::new(sql, SqlMode::Default).map(|s| s.tok).collect()
    }

    #[test]
    fn lex_select() {
        let t = toks("SELECT a, t.b FROM t WHERE c = 'x'");
        assert_eq!(t[0], Token::Ident("SELECT"));
        assert_eq!(t[1], Token::Ident("a"));
        assert_eq!(t[2], Token::Punct(','));
        assert_eq!(t[3], Token::Ident("t"));
        assert_eq!(t[4], Token::Punct('.'));
        assert_eq!(t[5], Token::Ident("b"));
        assert!(t.contains(&Token::StringLit("x")));
    }

    #[test]
    fn lex_vars_and_assign() {
        let t = toks("SELECT @a := 1, @@session.sql_mode, @@server_id");
        assert!(t.contains(&Token::UserVar("a")));
        assert!(t.contains(&Token::Op(":=")));
        assert!(t.contains(&Token::SysVar("session.sql_mode")));
        assert!(t.contains(&Token::SysVar("server_id")));
    }

    #[test]
    fn comments_are_skipped_and_flagged() {
        let mut tz = Tokenizer::new("/* hello */ -- trailing\n# another\n", SqlMode::Default);
        assert!(tz.next().is_none());
        assert!(tz.saw_comment);
        assert!(!tz.truncated);
    }

    #[test]
    fn dash_dash_requires_whitespace() {
        let t = toks("SELECT 1--2");
        // "--" glued to an operand is double negation, not a comment
        assert!(t.len() > 2);
    }

    #[test]
    fn unterminated_string_marks_truncation() {
        let mut tz = Tokenizer::new("SELECT 'abc", SqlMode::Default);
        let collected: Vec<_> = tz.by_ref().collect();
        assert_eq!(collected.len(), 2);
        assert!(tz.truncated);
    }

    #[test]
    fn double_quote_mode_dependent() {
        let t = toks(r#"SELECT "x""#);
        assert_eq!(t[1], Token::StringLit("x"));
        let t: Vec<_> = Tokenizer::new(r#"SELECT "x""#, SqlMode::Oracle)
            .map(|s| s.tok)
            .collect();
        assert_eq!(t[1], Token::QuotedIdent("x"));
    }

    #[test]
    fn backtick_identifier() {
        let t = toks("SELECT `weird name` FROM `db`.`t`");
        assert_eq!(t[1], Token::QuotedIdent("weird name"));
        assert_eq!(t[3], Token::QuotedIdent("db"));
    }
}
