use bytes::Bytes;
use std::collections::BTreeMap;

/// A bencode value.
///
/// KRPC messages are nested dictionaries of these, and BEP-44 stores arbitrary
/// values of this type under DHT keys.
///
/// # Examples
///
/// ```
/// use rdht::bencode::Value;
///
/// let int: Value = 42i64.into();
/// let string: Value = "hello".into();
///
/// assert_eq!(int.as_integer(), Some(42));
/// assert_eq!(string.as_str(), Some("hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A signed 64-bit integer.
    Integer(i64),
    /// A byte string (may or may not be valid UTF-8).
    Bytes(Bytes),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A dictionary with byte string keys, kept sorted.
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a byte string value by copying `b`.
    pub fn bytes(b: &[u8]) -> Self {
        Value::Bytes(Bytes::copy_from_slice(b))
    }

    /// Starts building a dictionary.
    pub fn dict() -> DictBuilder {
        DictBuilder::default()
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value as a UTF-8 string.
    ///
    /// `None` if the value is not a byte string or is not valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Consumes the value and returns the dictionary, if it is one.
    pub fn into_dict(self) -> Option<BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in this value if it is a dictionary.
    ///
    /// ```
    /// use rdht::bencode::decode;
    ///
    /// let value = decode(b"d3:foo3:bare").unwrap();
    /// assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("bar"));
    /// assert_eq!(value.get(b"missing"), None);
    /// ```
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&Bytes> {
        self.get(key).and_then(Value::as_bytes)
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_integer(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(Value::as_integer)
    }
}

/// Incremental dictionary construction.
///
/// `insert_opt` skips `None`, which keeps optional KRPC fields out of the
/// encoded message instead of emitting empty placeholders.
#[derive(Debug, Default)]
pub struct DictBuilder {
    entries: BTreeMap<Bytes, Value>,
}

impl DictBuilder {
    pub fn insert(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.entries
            .insert(Bytes::from_static(key.as_bytes()), value.into());
        self
    }

    pub fn insert_opt(self, key: &'static str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.insert(key, value),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.entries)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<Bytes, Value>> for Value {
    fn from(d: BTreeMap<Bytes, Value>) -> Self {
        Value::Dict(d)
    }
}
