//! Telemetry payload normalisation.
//!
//! Telemetry reaches the bridge in whatever shape the radio stack produced:
//! an already-decoded object, JSON text, Python-style literal text
//! (`{'voltage': 4.1, 'ok': True}`), or something mangled in between.
//! Parsers are tried in a fixed order and the first mapping wins.

use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::error::DecodeError;

pub type Metrics = Map<String, Value>;

type Parser = fn(&Value) -> Option<Metrics>;

/// Tried in order; each reports success or failure explicitly.
const PARSERS: &[(&str, Parser)] = &[
    ("native", native),
    ("json", strict_json),
    ("literal", literal),
    ("normalized-json", normalized_json),
];

/// Decode `raw` into a key/value mapping. An absent or empty payload is an
/// empty mapping; anything else that fails every parser is a [`DecodeError`].
pub fn try_decode(raw: &Value) -> Result<Metrics, DecodeError> {
    if is_empty(raw) {
        return Ok(Metrics::new());
    }
    for (name, parse) in PARSERS {
        if let Some(map) = parse(raw) {
            debug!(parser = *name, keys = map.len(), "telemetry decoded");
            return Ok(map);
        }
    }
    Err(DecodeError {
        preview: preview(raw),
    })
}

/// Like [`try_decode`] but never fails: undecodable payloads are logged and
/// treated as empty.
pub fn decode(raw: &Value, node: &str) -> Metrics {
    match try_decode(raw) {
        Ok(map) => map,
        Err(e) => {
            warn!(node = %node, "{e}");
            Metrics::new()
        }
    }
}

fn is_empty(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

fn preview(raw: &Value) -> String {
    let text = match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut out: String = text.chars().take(80).collect();
    if text.chars().count() > 80 {
        out.push('…');
    }
    out
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn native(raw: &Value) -> Option<Metrics> {
    raw.as_object().cloned()
}

fn strict_json(raw: &Value) -> Option<Metrics> {
    let text = raw.as_str()?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn literal(raw: &Value) -> Option<Metrics> {
    match LiteralParser::new(raw.as_str()?).parse_document()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Last resort: flatten line breaks and swap single quotes for double quotes.
fn normalized_json(raw: &Value) -> Option<Metrics> {
    let text = raw.as_str()?.replace(['\r', '\n'], " ").replace('\'', "\"");
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Literal-syntax parser
// ---------------------------------------------------------------------------

/// Nesting deeper than this is rejected instead of recursing further.
const MAX_DEPTH: usize = 128;

/// Recursive-descent parser for Python literal structures: dicts, lists,
/// tuples, quoted strings, numbers, `True`/`False`/`None`.
struct LiteralParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl LiteralParser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
        }
    }

    fn parse_document(mut self) -> Option<Value> {
        let v = self.value()?;
        self.skip_ws();
        (self.pos == self.chars.len()).then_some(v)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            '{' => self.nested(Self::dict),
            '[' => self.nested(|p| p.sequence('[', ']')),
            '(' => self.nested(|p| p.sequence('(', ')')),
            '\'' | '"' => self.string().map(Value::String),
            c if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => self.number(),
            c if c.is_ascii_alphabetic() => self.keyword(),
            _ => None,
        }
    }

    fn nested(&mut self, parse: impl FnOnce(&mut Self) -> Option<Value>) -> Option<Value> {
        if self.depth >= MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let v = parse(self);
        self.depth -= 1;
        v
    }

    fn dict(&mut self) -> Option<Value> {
        self.bump();
        let mut map = Map::new();
        loop {
            if self.eat('}') {
                return Some(Value::Object(map));
            }
            let key = match self.value()? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => (if b { "True" } else { "False" }).to_string(),
                _ => return None,
            };
            if !self.eat(':') {
                return None;
            }
            let v = self.value()?;
            map.insert(key, v);
            if !self.eat(',') {
                return self.eat('}').then_some(Value::Object(map));
            }
        }
    }

    fn sequence(&mut self, open: char, close: char) -> Option<Value> {
        debug_assert_eq!(self.peek(), Some(open));
        self.bump();
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Some(Value::Array(items));
            }
            items.push(self.value()?);
            if !self.eat(',') {
                return self.eat(close).then_some(Value::Array(items));
            }
        }
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.bump()?;
        let mut out = String::new();
        loop {
            match self.bump()? {
                c if c == quote => return Some(out),
                // unterminated single-line literal
                '\n' | '\r' => return None,
                '\\' => match self.bump()? {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    'x' => out.push(self.hex_escape(2)?),
                    'u' => out.push(self.hex_escape(4)?),
                    '\n' => {}
                    other => out.push(other),
                },
                c => out.push(c),
            }
        }
    }

    fn hex_escape(&mut self, len: usize) -> Option<char> {
        let end = self.pos.checked_add(len)?;
        let digits: String = self.chars.get(self.pos..end)?.iter().collect();
        self.pos = end;
        char::from_u32(u32::from_str_radix(&digits, 16).ok()?)
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        if matches!(self.peek(), Some('-' | '+')) {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {}
                '.' => is_float = true,
                'e' | 'E' => {
                    is_float = true;
                    if matches!(self.chars.get(self.pos + 1), Some('-' | '+')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        let text = text.strip_prefix('+').unwrap_or(&text);
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Some(Value::Number(i.into()));
            }
        }
        let f: f64 = text.parse().ok()?;
        Number::from_f64(f).map(Value::Number)
    }

    fn keyword(&mut self) -> Option<Value> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" => Some(Value::Bool(true)),
            "False" => Some(Value::Bool(false)),
            "None" => Some(Value::Null),
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> Value {
        Value::String(s.to_string())
    }

    // -- parser order ---------------------------------------------------------

    #[test]
    fn native_mapping_passes_through() {
        let raw = json!({"deviceMetrics": {"batteryLevel": 87, "voltage": 4.1}});
        let map = try_decode(&raw).unwrap();
        assert_eq!(Value::Object(map), raw);
    }

    #[test]
    fn json_text_is_parsed() {
        let raw = text(r#"{"deviceMetrics": {"voltage": 3.95}}"#);
        let map = try_decode(&raw).unwrap();
        assert_eq!(map["deviceMetrics"]["voltage"], json!(3.95));
    }

    #[test]
    fn literal_text_is_parsed() {
        let raw = text("{'deviceMetrics': {'batteryLevel': 101, 'voltage': 4.2, 'charging': True, 'note': None}}");
        let map = try_decode(&raw).unwrap();
        let dm = &map["deviceMetrics"];
        assert_eq!(dm["batteryLevel"], json!(101));
        assert_eq!(dm["voltage"], json!(4.2));
        assert_eq!(dm["charging"], json!(true));
        assert_eq!(dm["note"], Value::Null);
    }

    #[test]
    fn literal_handles_tuples_negative_numbers_and_trailing_commas() {
        let raw = text("{'pos': (1, -2.5,), 'temp': -4, }");
        let map = try_decode(&raw).unwrap();
        assert_eq!(map["pos"], json!([1, -2.5]));
        assert_eq!(map["temp"], json!(-4));
    }

    #[test]
    fn mangled_text_falls_through_to_normalized_json() {
        // a raw line break inside a single-quoted string is not valid literal syntax
        let raw = text("{'voltage': 3.9,\n 'note': 'line\nbreak'}");
        let map = try_decode(&raw).unwrap();
        assert_eq!(map["voltage"], json!(3.9));
        assert_eq!(map["note"], json!("line break"));
    }

    // -- failure handling -----------------------------------------------------

    #[test]
    fn deep_nesting_is_rejected_without_overflow() {
        // tokio worker threads get 2 MiB stacks
        let worker = std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(|| {
                let deep = decode(&text(&"[".repeat(20_000)), "!n");
                let dict = decode(&text(&"{'a': ".repeat(20_000)), "!n");
                (deep.is_empty(), dict.is_empty())
            })
            .unwrap();
        assert_eq!(worker.join().unwrap(), (true, true));
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let nested = format!("{{'deviceMetrics': {}1{}}}", "[".repeat(50), "]".repeat(50));
        let map = try_decode(&text(&nested)).unwrap();
        assert!(map["deviceMetrics"].is_array());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = try_decode(&text("battery is fine, thanks")).unwrap_err();
        assert!(err.preview.contains("battery"));
    }

    #[test]
    fn bare_key_value_text_is_not_a_mapping() {
        assert!(try_decode(&text("voltage: 4.1")).is_err());
        assert!(try_decode(&text("voltage: 4.1, batteryLevel: 90")).is_err());
    }

    #[test]
    fn decode_never_fails_on_garbage() {
        assert!(decode(&text("{'unterminated"), "!abc").is_empty());
        assert!(decode(&text("[1, 2, 3]"), "!abc").is_empty());
        assert!(decode(&json!(42), "!abc").is_empty());
    }

    #[test]
    fn empty_payloads_decode_to_empty() {
        assert!(try_decode(&Value::Null).unwrap().is_empty());
        assert!(try_decode(&text("   ")).unwrap().is_empty());
        assert!(try_decode(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn non_mapping_documents_are_rejected() {
        assert!(try_decode(&text("[1, 2]")).is_err());
        assert!(try_decode(&text("'just a string'")).is_err());
    }

    #[test]
    fn long_previews_are_truncated() {
        let long = "x".repeat(200);
        let err = try_decode(&text(&long)).unwrap_err();
        assert_eq!(err.preview.chars().count(), 81);
    }
}
