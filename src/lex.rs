//! Lexer for the line-oriented configuration file.
//!
//! Keywords are case-insensitive; `#` starts a comment; strings are
//! double-quoted with no escapes; a backslash immediately before a
//! newline continues the line. The lexer never fails; an unmatched
//! quote becomes an error token and the parser resynchronizes at the
//! next end of line.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Bps,
    Console,
    Dev,
    Keepalive,
    Log,
    Logfile,
    Loopback,
    Name,
    Off,
    On,
    Pidfile,
    Port,
    Rst,
    Server,
    Timestamp,
}

impl Keyword {
    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Bps => "BPS",
            Keyword::Console => "CONSOLE",
            Keyword::Dev => "DEV",
            Keyword::Keepalive => "KEEPALIVE",
            Keyword::Log => "LOG",
            Keyword::Logfile => "LOGFILE",
            Keyword::Loopback => "LOOPBACK",
            Keyword::Name => "NAME",
            Keyword::Off => "OFF",
            Keyword::On => "ON",
            Keyword::Pidfile => "PIDFILE",
            Keyword::Port => "PORT",
            Keyword::Rst => "RST",
            Keyword::Server => "SERVER",
            Keyword::Timestamp => "TIMESTAMP",
        }
    }

    fn lookup(word: &str) -> Option<Keyword> {
        const TABLE: &[Keyword] = &[
            Keyword::Bps,
            Keyword::Console,
            Keyword::Dev,
            Keyword::Keepalive,
            Keyword::Log,
            Keyword::Logfile,
            Keyword::Loopback,
            Keyword::Name,
            Keyword::Off,
            Keyword::On,
            Keyword::Pidfile,
            Keyword::Port,
            Keyword::Rst,
            Keyword::Server,
            Keyword::Timestamp,
        ];
        TABLE
            .iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(word))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Key(Keyword),
    Str(String),
    Int(i64),
    Eq,
    Eol,
    Eof,
    Err(&'static str),
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    tok_line: usize,
    prev: Tok,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            tok_line: 1,
            prev: Tok::Eol,
        }
    }

    /// Line number of the most recently returned token.
    pub fn line(&self) -> usize {
        self.tok_line
    }

    /// The most recently returned token; used by directive parsers to
    /// resynchronize without overshooting an already-consumed end of line.
    pub fn prev(&self) -> &Tok {
        &self.prev
    }

    pub fn next(&mut self) -> Tok {
        let tok = self.scan();
        self.prev = tok.clone();
        tok
    }

    fn scan(&mut self) -> Tok {
        self.skip_blank();
        self.tok_line = self.line;

        let Some(&byte) = self.src.get(self.pos) else {
            return Tok::Eof;
        };
        match byte {
            b'\n' => {
                self.pos += 1;
                self.line += 1;
                Tok::Eol
            }
            b'=' => {
                self.pos += 1;
                Tok::Eq
            }
            b'"' => self.quoted_string(),
            _ => self.word(),
        }
    }

    fn skip_blank(&mut self) {
        while let Some(&byte) = self.src.get(self.pos) {
            match byte {
                b' ' | b'\t' | b'\r' => self.pos += 1,
                b'\\' if self.src.get(self.pos + 1) == Some(&b'\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                b'#' => {
                    while let Some(&b) = self.src.get(self.pos) {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn quoted_string(&mut self) -> Tok {
        self.pos += 1;
        let start = self.pos;
        while let Some(&byte) = self.src.get(self.pos) {
            match byte {
                b'"' => {
                    let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                    self.pos += 1;
                    return Tok::Str(text);
                }
                b'\n' => return Tok::Err("unmatched quote"),
                _ => self.pos += 1,
            }
        }
        Tok::Err("unmatched quote")
    }

    fn word(&mut self) -> Tok {
        let start = self.pos;
        while let Some(&byte) = self.src.get(self.pos) {
            if byte.is_ascii_whitespace() || byte == b'=' || byte == b'#' || byte == b'"' {
                break;
            }
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        if let Ok(value) = text.parse::<i64>() {
            return Tok::Int(value);
        }
        match Keyword::lookup(&text) {
            Some(key) => Tok::Key(key),
            None => Tok::Str(text),
        }
    }
}
