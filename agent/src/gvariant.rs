//! Helpers for the GVariant text format printed by `gdbus`, `gsettings` and
//! `dconf`.
//!
//! Only what the watchers need: pulling string literals out of signal
//! arguments and inferring the type signature of a printed value.

/// Every string literal in `text`, in order, with escapes resolved.
pub fn quoted_strings(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            out.push(read_string(&mut chars, c));
        }
    }
    out
}

fn read_string(chars: &mut std::str::Chars<'_>, quote: char) -> String {
    let mut s = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => s.push('\n'),
                Some('t') => s.push('\t'),
                Some(other) => s.push(other),
                None => break,
            },
            c if c == quote => break,
            c => s.push(c),
        }
    }
    s
}

/// Best-effort type signature of a printed value, e.g. `uint32 5` → `u`,
/// `['a', 'b']` → `as`. Returns `None` for text that is not a value.
pub fn infer_signature(text: &str) -> Option<String> {
    let mut parser = Parser {
        chars: text.trim().chars().collect(),
        pos: 0,
    };
    let sig = parser.value()?;
    parser.skip_ws();
    (parser.pos == parser.chars.len()).then_some(sig)
}

/// Signature reported by `gsettings range`: `type s`, `enum`, `flags` or
/// `range i 0 10`.
pub fn range_signature(output: &str) -> Option<String> {
    let mut words = output.split_whitespace();
    match words.next()? {
        "type" | "range" => words.next().map(str::to_string),
        "enum" => Some("s".to_string()),
        "flags" => Some("as".to_string()),
        _ => None,
    }
}

const TYPE_KEYWORDS: &[(&str, &str)] = &[
    ("byte", "y"),
    ("int16", "n"),
    ("uint16", "q"),
    ("int32", "i"),
    ("uint32", "u"),
    ("int64", "x"),
    ("uint64", "t"),
    ("handle", "h"),
    ("double", "d"),
    ("objectpath", "o"),
    ("signature", "g"),
];

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn expect(&mut self, c: char) -> Option<()> {
        self.skip_ws();
        (self.peek() == Some(c)).then(|| self.pos += 1)
    }

    fn value(&mut self) -> Option<String> {
        self.skip_ws();
        match self.peek()? {
            '\'' | '"' => {
                let quote = self.peek()?;
                self.pos += 1;
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == '\\' {
                        self.pos += 1;
                    } else if c == quote {
                        return Some("s".to_string());
                    }
                }
                None
            }
            '@' => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| !c.is_whitespace()) {
                    self.pos += 1;
                }
                let sig: String = self.chars[start..self.pos].iter().collect();
                self.value()?;
                Some(sig)
            }
            '[' => self.array(),
            '(' => self.tuple(),
            '{' => self.dict(),
            '<' => {
                self.pos += 1;
                self.value()?;
                self.expect('>')?;
                Some("v".to_string())
            }
            _ => {
                let word = self.word();
                if let Some((_, sig)) = TYPE_KEYWORDS.iter().find(|(kw, _)| *kw == word) {
                    self.value()?;
                    return Some(sig.to_string());
                }
                match word.as_str() {
                    "true" | "false" => Some("b".to_string()),
                    "nothing" => Some("mv".to_string()),
                    "" => None,
                    w if w.parse::<i64>().is_ok() => Some("i".to_string()),
                    w if w.parse::<f64>().is_ok() => Some("d".to_string()),
                    _ => None,
                }
            }
        }
    }

    fn array(&mut self) -> Option<String> {
        self.pos += 1;
        self.skip_ws();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Some("as".to_string());
        }
        let first = self.value()?;
        loop {
            self.skip_ws();
            match self.peek()? {
                ',' => {
                    self.pos += 1;
                    self.value()?;
                }
                ']' => {
                    self.pos += 1;
                    return Some(format!("a{first}"));
                }
                _ => return None,
            }
        }
    }

    fn tuple(&mut self) -> Option<String> {
        self.pos += 1;
        let mut sig = String::from("(");
        loop {
            self.skip_ws();
            match self.peek()? {
                ')' => {
                    self.pos += 1;
                    sig.push(')');
                    return Some(sig);
                }
                ',' => self.pos += 1,
                _ => sig.push_str(&self.value()?),
            }
        }
    }

    fn dict(&mut self) -> Option<String> {
        self.pos += 1;
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Some("a{sv}".to_string());
        }
        let key = self.value()?;
        self.skip_ws();
        match self.peek()? {
            // Dictionary entry `{k, v}`.
            ',' => {
                self.pos += 1;
                let value = self.value()?;
                self.expect('}')?;
                Some(format!("{{{key}{value}}}"))
            }
            ':' => {
                self.pos += 1;
                let value = self.value()?;
                loop {
                    self.skip_ws();
                    match self.peek()? {
                        ',' => {
                            self.pos += 1;
                            self.value()?;
                            self.expect(':')?;
                            self.value()?;
                        }
                        '}' => {
                            self.pos += 1;
                            return Some(format!("a{{{key}{value}}}"));
                        }
                        _ => return None,
                    }
                }
            }
            _ => None,
        }
    }
}
