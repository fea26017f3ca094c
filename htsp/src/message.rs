//! ## MESSAGE
//! **Based on HTSP wire format**
//!
//! An HTSP [Message] is an ordered mapping from field name to [Value]. Every
//! request carries a `method`; once queued by the dispatcher it also carries
//! a `seq`. Replies carry the originating `seq` but not `method` — the
//! dispatcher restores `method` from its outstanding-request table before
//! fan-out (see [`crate::dispatcher`]).
//!
//! [Message]: Message
//! [Value]: Value

use std::fmt;

/// A single field's value. `Str` and `Bin` are kept distinct because they are
/// distinct wire types (3 and 4); a `string()` getter will also decode a
/// `Bin` value as UTF-8 and a `bin()` getter will return `Str` bytes raw,
/// matching the "coerce from the underlying byte-string/integer
/// representation" contract.
#[derive(Clone, PartialEq)]
pub enum Value {
    S64(i64),
    Str(Vec<u8>),
    Bin(Vec<u8>),
    List(Vec<Value>),
    Map(Message),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::S64(v) => write!(f, "S64({v})"),
            Value::Str(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "Str({s:?})"),
                Err(_) => write!(f, "Str(<{} invalid utf8 bytes>)", b.len()),
            },
            Value::Bin(b) => write!(f, "Bin({} bytes)", b.len()),
            Value::List(l) => write!(f, "List({l:?})"),
            Value::Map(m) => write!(f, "Map({m:?})"),
        }
    }
}

/// Ordered mapping from field name to [Value]. Order is preserved on the
/// wire exactly as inserted, matching HTSP's field-list framing.
#[derive(Clone, PartialEq, Default)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields.iter().map(|(k, v)| (k, v))).finish()
    }
}

impl Message {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Construct a request message with `method` already set — the common
    /// case for anything handed to the dispatcher.
    pub fn request(method: impl Into<String>) -> Self {
        let mut msg = Self::new();
        msg.set_string("method", method);
        msg
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set (or replace) a field. Replaces an existing field with the same
    /// name rather than appending a duplicate, keeping the mapping
    /// well-formed under repeated mutation prior to enqueue.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        let key = key.into();
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.fields.push((key, value));
        }
        self
    }

    pub fn set_long(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.set(key, Value::S64(value))
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(key, Value::Str(value.into().into_bytes()))
    }

    pub fn set_bin(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.set(key, Value::Bin(value))
    }

    pub fn set_list(&mut self, key: impl Into<String>, value: Vec<Value>) -> &mut Self {
        self.set(key, Value::List(value))
    }

    pub fn set_message(&mut self, key: impl Into<String>, value: Message) -> &mut Self {
        self.set(key, Value::Map(value))
    }

    pub fn integer(&self, key: &str, default: i32) -> i32 {
        match self.get(key) {
            Some(Value::S64(v)) => i32::try_from(*v).unwrap_or(default),
            _ => default,
        }
    }

    pub fn long(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(Value::S64(v)) => *v,
            _ => default,
        }
    }

    /// Present only for fields actually carrying `seq`; distinct from
    /// `long()` so callers don't need to invent a sentinel default.
    pub fn long_opt(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::S64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(Value::Str(b)) | Some(Value::Bin(b)) => {
                std::str::from_utf8(b).map(|s| s.to_string()).unwrap_or_else(|_| default.to_string())
            }
            _ => default.to_string(),
        }
    }

    pub fn string_opt(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::Str(b)) | Some(Value::Bin(b)) => std::str::from_utf8(b).ok().map(str::to_string),
            _ => None,
        }
    }

    pub fn bin(&self, key: &str) -> Vec<u8> {
        match self.get(key) {
            Some(Value::Bin(b)) | Some(Value::Str(b)) => b.clone(),
            _ => Vec::new(),
        }
    }

    pub fn list(&self, key: &str) -> &[Value] {
        match self.get(key) {
            Some(Value::List(l)) => l,
            _ => &[],
        }
    }

    pub fn message(&self, key: &str) -> Option<&Message> {
        match self.get(key) {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<String> {
        self.string_opt("method")
    }

    pub fn seq(&self) -> Option<i64> {
        self.long_opt("seq")
    }
}
