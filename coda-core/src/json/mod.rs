//! Value codec module.
//!
//! Parses and serializes the JSON-like values carried inside TCF messages.
//! The codec only ever sees the text of a single value: the `\0` separators
//! between message fields are handled by the protocol layer.

use std::fmt;
use std::io::Write as _;
use thiserror::Error;

/// Nesting limit for objects and arrays.
const MAX_DEPTH: usize = 128;

/// Kind of a [`JsonValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonKind {
    /// Failed parse.
    #[default]
    Invalid,
    /// Quoted string.
    String,
    /// Number kept in its textual form.
    Number,
    /// `true` or `false`.
    Boolean,
    /// Members with keys, in input order.
    Object,
    /// `null`.
    NullObject,
    /// Ordered elements.
    Array,
}

/// Reason a value failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonParseError {
    #[error("empty input")]
    Empty,
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),
    #[error("unexpected byte 0x{byte:02x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),
    #[error("trailing data at offset {0}")]
    TrailingData(usize),
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// A parsed TCF value.
///
/// Scalars keep their raw (unescaped) payload in `data`; objects and arrays
/// keep their members in `children`, object members carrying their key in
/// `name`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonValue {
    kind: JsonKind,
    name: Option<String>,
    data: Vec<u8>,
    children: Vec<JsonValue>,
}

impl JsonValue {
    /// The invalid value returned by failed parses.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// String from raw bytes.
    pub fn string(data: impl Into<Vec<u8>>) -> Self {
        Self { kind: JsonKind::String, data: data.into(), ..Self::default() }
    }

    /// Number from its decimal rendering.
    pub fn number<T: fmt::Display>(value: T) -> Self {
        Self { kind: JsonKind::Number, data: value.to_string().into_bytes(), ..Self::default() }
    }

    /// `true` or `false`.
    pub fn boolean(value: bool) -> Self {
        let data = if value { b"true".to_vec() } else { b"false".to_vec() };
        Self { kind: JsonKind::Boolean, data, ..Self::default() }
    }

    /// The `null` value.
    pub fn null() -> Self {
        Self { kind: JsonKind::NullObject, ..Self::default() }
    }

    /// Array of `children`.
    pub fn array(children: Vec<JsonValue>) -> Self {
        Self { kind: JsonKind::Array, children, ..Self::default() }
    }

    /// Build an object from `(key, value)` pairs, preserving their order.
    pub fn object<S: Into<String>>(members: Vec<(S, JsonValue)>) -> Self {
        let children = members.into_iter().map(|(k, v)| v.with_name(k)).collect();
        Self { kind: JsonKind::Object, children, ..Self::default() }
    }

    /// Array of strings, the most common parameter shape.
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        Self::array(items.into_iter().map(Self::string).collect())
    }

    /// Attach an object-member key.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse a single value, returning [`JsonKind::Invalid`] on any error.
    pub fn parse(input: &[u8]) -> Self {
        match Self::try_parse(input) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Value parse error: {e}");
                Self::invalid()
            }
        }
    }

    /// Parse a single value, reporting why it failed.
    pub fn try_parse(input: &[u8]) -> Result<Self, JsonParseError> {
        let mut parser = Parser { input, pos: 0, depth: 0 };
        parser.skip_whitespace();
        if parser.peek().is_none() {
            return Err(JsonParseError::Empty);
        }
        let value = parser.parse_value()?;
        parser.skip_whitespace();
        if parser.pos < input.len() {
            return Err(JsonParseError::TrailingData(parser.pos));
        }
        Ok(value)
    }

    /// Kind of value.
    pub const fn kind(&self) -> JsonKind {
        self.kind
    }

    /// Member key inside an object.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Raw scalar payload, unescaped.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Array elements or object members.
    pub fn children(&self) -> &[JsonValue] {
        &self.children
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// False for failed parses.
    pub fn is_valid(&self) -> bool {
        self.kind != JsonKind::Invalid
    }

    /// Find an object member by key.
    pub fn find_child(&self, name: &str) -> Option<&JsonValue> {
        self.children.iter().find(|c| c.name() == Some(name))
    }

    /// Scalar payload as text (lossy for non-UTF-8 bytes).
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Numeric payload. Strings holding decimal or `0x` hex digits are accepted
    /// since some services encode addresses as strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self.kind {
            JsonKind::Number | JsonKind::String => {
                let text = std::str::from_utf8(&self.data).ok()?.trim();
                if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    u64::from_str_radix(hex, 16).ok()
                } else {
                    text.parse().ok()
                }
            }
            _ => None,
        }
    }

    /// Signed numeric payload.
    pub fn as_i64(&self) -> Option<i64> {
        match self.kind {
            JsonKind::Number | JsonKind::String => {
                std::str::from_utf8(&self.data).ok()?.trim().parse().ok()
            }
            _ => None,
        }
    }

    /// Boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match (self.kind, self.data.as_slice()) {
            (JsonKind::Boolean, b"true") => Some(true),
            (JsonKind::Boolean, b"false") => Some(false),
            _ => None,
        }
    }

    /// Children of an array rendered as strings.
    pub fn as_string_list(&self) -> Vec<String> {
        self.children.iter().map(Self::as_string).collect()
    }

    /// Compact single-line encoding.
    pub fn to_compact(&self) -> Vec<u8> {
        self.serialize(false, 0)
    }

    /// Encode the value. With `multiline`, members go on their own lines
    /// indented by two spaces per level starting at `indent`.
    pub fn serialize(&self, multiline: bool, indent: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 16);
        self.write_to(&mut out, multiline, indent);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>, multiline: bool, indent: usize) {
        match self.kind {
            JsonKind::Invalid => {}
            JsonKind::String => {
                out.push(b'"');
                write_escaped(out, &self.data);
                out.push(b'"');
            }
            JsonKind::Number | JsonKind::Boolean => out.extend_from_slice(&self.data),
            JsonKind::NullObject => out.extend_from_slice(b"null"),
            JsonKind::Object | JsonKind::Array => {
                let is_object = self.kind == JsonKind::Object;
                out.push(if is_object { b'{' } else { b'[' });
                for (i, child) in self.children.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    if multiline {
                        push_newline(out, indent + 1);
                    }
                    if is_object {
                        out.push(b'"');
                        write_escaped(out, child.name().unwrap_or_default().as_bytes());
                        out.extend_from_slice(if multiline { b"\": " } else { b"\":" });
                    }
                    child.write_to(out, multiline, indent + 1);
                }
                if multiline && !self.children.is_empty() {
                    push_newline(out, indent);
                }
                out.push(if is_object { b'}' } else { b']' });
            }
        }
    }
}

impl fmt::Display for JsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_compact()))
    }
}

impl From<&JsonValue> for serde_json::Value {
    fn from(value: &JsonValue) -> Self {
        match value.kind {
            JsonKind::Invalid | JsonKind::NullObject => Self::Null,
            JsonKind::String => Self::String(value.as_string()),
            JsonKind::Boolean => Self::Bool(value.as_bool().unwrap_or(false)),
            JsonKind::Number => {
                let text = value.as_string();
                if let Ok(n) = text.parse::<i64>() {
                    Self::from(n)
                } else if let Ok(n) = text.parse::<u64>() {
                    Self::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map_or(Self::String(text), Self::Number)
                }
            }
            JsonKind::Array => Self::Array(value.children.iter().map(Self::from).collect()),
            JsonKind::Object => Self::Object(
                value
                    .children
                    .iter()
                    .map(|c| (c.name().unwrap_or_default().to_string(), Self::from(c)))
                    .collect(),
            ),
        }
    }
}

fn push_newline(out: &mut Vec<u8>, indent: usize) {
    out.push(b'\n');
    out.extend(std::iter::repeat(b' ').take(indent * 2));
}

fn write_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        match b {
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            c if c < 0x20 => {
                let _ = write!(out, "\\u{c:04x}");
            }
            c => out.push(c),
        }
    }
}

const fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$'
}

const fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'$' | b'.' | b'-')
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn unexpected(&self) -> JsonParseError {
        match self.peek() {
            Some(byte) => JsonParseError::UnexpectedByte { byte, offset: self.pos },
            None => JsonParseError::UnexpectedEnd(self.pos),
        }
    }

    fn parse_value(&mut self) -> Result<JsonValue, JsonParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(b'"') => Ok(JsonValue::string(self.parse_string()?)),
            Some(b'{') => self.parse_container(JsonKind::Object),
            Some(b'[') => self.parse_container(JsonKind::Array),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(b) if is_word_start(b) => Ok(self.parse_word()),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_word(&mut self) -> JsonValue {
        let start = self.pos;
        while self.peek().is_some_and(is_word_byte) {
            self.pos += 1;
        }
        match &self.input[start..self.pos] {
            b"true" => JsonValue::boolean(true),
            b"false" => JsonValue::boolean(false),
            b"null" => JsonValue::null(),
            word => JsonValue::string(word),
        }
    }

    fn parse_number(&mut self) -> Result<JsonValue, JsonParseError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        self.expect_digits()?;
        if self.peek() == Some(b'.') {
            self.pos += 1;
            self.expect_digits()?;
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            self.expect_digits()?;
        }
        Ok(JsonValue {
            kind: JsonKind::Number,
            data: self.input[start..self.pos].to_vec(),
            ..JsonValue::default()
        })
    }

    fn expect_digits(&mut self) -> Result<(), JsonParseError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.unexpected());
        }
        Ok(())
    }

    /// Parse a quoted string at the cursor, returning the unescaped bytes.
    fn parse_string(&mut self) -> Result<Vec<u8>, JsonParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            let Some(b) = self.peek() else {
                return Err(JsonParseError::UnterminatedString(start));
            };
            self.pos += 1;
            match b {
                b'"' => return Ok(out),
                b'\\' => self.parse_escape(&mut out)?,
                other => out.push(other),
            }
        }
    }

    fn parse_escape(&mut self, out: &mut Vec<u8>) -> Result<(), JsonParseError> {
        let offset = self.pos - 1;
        let Some(b) = self.peek() else {
            return Err(JsonParseError::UnterminatedString(offset));
        };
        self.pos += 1;
        match b {
            b'"' | b'\\' | b'/' => out.push(b),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'u' => {
                let mut code = self.parse_hex4(offset)?;
                if (0xD800..0xDC00).contains(&code)
                    && self.input.get(self.pos..self.pos + 2) == Some(&b"\\u"[..])
                {
                    self.pos += 2;
                    let low = self.parse_hex4(offset)?;
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err(JsonParseError::InvalidEscape(offset));
                    }
                    code = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                }
                let ch = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            _ => return Err(JsonParseError::InvalidEscape(offset)),
        }
        Ok(())
    }

    fn parse_hex4(&mut self, offset: usize) -> Result<u32, JsonParseError> {
        let digits = self
            .input
            .get(self.pos..self.pos + 4)
            .ok_or(JsonParseError::InvalidEscape(offset))?;
        let text = std::str::from_utf8(digits).map_err(|_| JsonParseError::InvalidEscape(offset))?;
        let code = u32::from_str_radix(text, 16).map_err(|_| JsonParseError::InvalidEscape(offset))?;
        self.pos += 4;
        Ok(code)
    }

    fn parse_key(&mut self) -> Result<String, JsonParseError> {
        match self.peek() {
            Some(b'"') => Ok(String::from_utf8_lossy(&self.parse_string()?).into_owned()),
            Some(b) if is_word_start(b) => {
                let start = self.pos;
                while self.peek().is_some_and(is_word_byte) {
                    self.pos += 1;
                }
                Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
            }
            _ => Err(self.unexpected()),
        }
    }

    fn parse_container(&mut self, kind: JsonKind) -> Result<JsonValue, JsonParseError> {
        let close = if kind == JsonKind::Object { b'}' } else { b']' };
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(JsonParseError::TooDeep(MAX_DEPTH));
        }
        self.pos += 1;
        let mut children = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(close) {
            self.pos += 1;
        } else {
            loop {
                self.skip_whitespace();
                let child = if kind == JsonKind::Object {
                    let key = self.parse_key()?;
                    self.skip_whitespace();
                    if self.peek() != Some(b':') {
                        return Err(self.unexpected());
                    }
                    self.pos += 1;
                    self.parse_value()?.with_name(key)
                } else {
                    self.parse_value()?
                };
                children.push(child);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b) if b == close => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.unexpected()),
                }
            }
        }
        self.depth -= 1;
        Ok(JsonValue { kind, children, ..JsonValue::default() })
    }
}

/// Builder for a command's parameter block: every value is encoded compactly
/// and terminated by a `\0` separator.
#[derive(Debug, Clone, Default)]
pub struct ParamWriter {
    buffer: Vec<u8>,
}

impl ParamWriter {
    /// Empty parameter block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already built value.
    #[must_use]
    pub fn value(mut self, value: &JsonValue) -> Self {
        value.write_to(&mut self.buffer, false, 0);
        self.buffer.push(0);
        self
    }

    /// Append a string.
    #[must_use]
    pub fn string(self, data: impl Into<Vec<u8>>) -> Self {
        self.value(&JsonValue::string(data))
    }

    /// Append a number.
    #[must_use]
    pub fn number<T: fmt::Display>(self, value: T) -> Self {
        self.value(&JsonValue::number(value))
    }

    /// Append a boolean.
    #[must_use]
    pub fn boolean(self, value: bool) -> Self {
        self.value(&JsonValue::boolean(value))
    }

    /// Append an array of strings.
    #[must_use]
    pub fn string_list<I, S>(self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        self.value(&JsonValue::string_array(items))
    }

    /// The encoded block.
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}
