//! Record keys, key ranges and key-path evaluation.
//!
//! Keys are totally ordered: numbers sort before strings, strings before
//! binary keys, binary keys before arrays. Arrays compare element-wise.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbError, Result};

/// Primary key of a record within an object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Key {
    /// Numeric key (never NaN)
    Number(f64),
    /// String key
    String(String),
    /// Binary key, hex-encoded when serialized
    Binary(#[serde(with = "hex_bytes")] Vec<u8>),
    /// Compound key
    Array(Vec<Key>),
}

impl Key {
    /// Creates a numeric key, rejecting NaN. `-0.0` becomes `0.0`.
    pub fn number(n: f64) -> Result<Self> {
        if n.is_nan() {
            return Err(DbError::Data("NaN is not a valid key".to_string()));
        }
        Ok(Key::Number(n + 0.0))
    }

    /// Converts a JSON value into a key.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| DbError::Data(format!("number {} is not a valid key", n)))?;
                Key::number(n)
            }
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Result<Vec<_>>>()
                .map(Key::Array),
            other => Err(DbError::Data(format!("{} is not a valid key", other))),
        }
    }

    /// Converts the key back into a JSON value.
    ///
    /// Binary keys become hex strings.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(bytes) => Value::String(hex::encode(bytes)),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    /// Size of the key's storage encoding in bytes.
    pub fn encoded_len(&self) -> u64 {
        match self {
            Key::Number(_) => 1 + 8,
            Key::String(s) => 1 + 4 + s.len() as u64,
            Key::Binary(b) => 1 + 4 + b.len() as u64,
            Key::Array(items) => 1 + 4 + items.iter().map(Key::encoded_len).sum::<u64>(),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Binary(_) => 2,
            Key::Array(_) => 3,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            // Adding 0.0 folds -0.0 into 0.0
            (Key::Number(a), Key::Number(b)) => (a + 0.0).total_cmp(&(b + 0.0)),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{}", n),
            Key::String(s) => write!(f, "{:?}", s),
            Key::Binary(b) => write!(f, "0x{}", hex::encode(b)),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Binary(bytes)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Contiguous interval of keys.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    /// Lower endpoint
    pub lower: Bound<Key>,
    /// Upper endpoint
    pub upper: Bound<Key>,
}

impl KeyRange {
    /// Range covering every key.
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// Range containing exactly one key.
    pub fn only(key: Key) -> Self {
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Keys at or above (`open`: strictly above) `key`.
    pub fn lower_bound(key: Key, open: bool) -> Self {
        Self {
            lower: if open {
                Bound::Excluded(key)
            } else {
                Bound::Included(key)
            },
            upper: Bound::Unbounded,
        }
    }

    /// Keys at or below (`open`: strictly below) `key`.
    pub fn upper_bound(key: Key, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: if open {
                Bound::Excluded(key)
            } else {
                Bound::Included(key)
            },
        }
    }

    /// Keys between `lower` and `upper`.
    ///
    /// Fails with `Data` when `lower > upper`, or when both are equal and
    /// either end is open.
    pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Result<Self> {
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(DbError::Data(format!(
                    "lower bound {} is greater than upper bound {}",
                    lower, upper
                )))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(DbError::Data(format!(
                    "range with equal bounds {} cannot be open",
                    lower
                )))
            }
            _ => {}
        }
        Ok(Self {
            lower: if lower_open {
                Bound::Excluded(lower)
            } else {
                Bound::Included(lower)
            },
            upper: if upper_open {
                Bound::Excluded(upper)
            } else {
                Bound::Included(upper)
            },
        })
    }

    /// Returns `true` if `key` lies within the range.
    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// Returns `true` if no key can satisfy the range.
    ///
    /// `BTreeMap::range` panics on such ranges, so callers check first.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    /// Borrowed bounds suitable for `BTreeMap::range`.
    pub fn as_bounds(&self) -> (Bound<&Key>, Bound<&Key>) {
        (self.lower.as_ref(), self.upper.as_ref())
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

impl From<&str> for KeyRange {
    fn from(s: &str) -> Self {
        KeyRange::only(Key::from(s))
    }
}

/// Evaluates a dotted key path against a value.
///
/// Returns `Ok(None)` when the path does not resolve, and a `Data` error
/// when it resolves to something that is not a valid key.
pub fn evaluate_key_path(value: &Value, key_path: &str) -> Result<Option<Key>> {
    let mut current = value;
    if !key_path.is_empty() {
        for segment in key_path.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
    }
    Key::from_value(current).map(Some)
}

/// Writes a generated key into `value` at `key_path`, creating
/// intermediate objects as needed.
pub fn inject_key(value: &mut Value, key_path: &str, key: &Key) -> Result<()> {
    let mut current = value;
    let mut segments = key_path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            DbError::Data(format!(
                "cannot inject key at '{}': segment '{}' is not an object",
                key_path, segment
            ))
        })?;
        if segments.peek().is_none() {
            object.insert(segment.to_string(), key.to_value());
            return Ok(());
        }
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use serde_json::json;

    #[timeout(1000)]
    #[test]
    fn test_key_type_ordering() {
        let number = Key::from(5i64);
        let string = Key::from("a");
        let binary = Key::from(vec![0u8]);
        let array = Key::Array(vec![]);
        assert!(number < string);
        assert!(string < binary);
        assert!(binary < array);
        assert!(Key::from(-1i64) < Key::from(2i64));
        assert!(Key::Array(vec![Key::from(1i64)]) < Key::Array(vec![Key::from(1i64), Key::from(0i64)]));
    }

    #[timeout(1000)]
    #[test]
    fn test_negative_zero_is_zero() {
        let negative = Key::from_value(&json!(-0.0)).unwrap();
        assert!(matches!(negative, Key::Number(n) if n.is_sign_positive()));
        assert!(matches!(Key::number(-0.0).unwrap(), Key::Number(n) if n.is_sign_positive()));
        assert_eq!(Key::Number(-0.0), Key::Number(0.0));
        assert_eq!(Key::Number(-0.0).cmp(&Key::Number(0.0)), Ordering::Equal);

        let mut records = std::collections::BTreeMap::new();
        records.insert(Key::Number(-0.0), "v");
        assert_eq!(records.get(&Key::from(0i64)), Some(&"v"));
    }

    #[timeout(1000)]
    #[test]
    fn test_key_from_value() {
        assert_eq!(Key::from_value(&json!("one")).unwrap(), Key::from("one"));
        assert_eq!(Key::from_value(&json!(3)).unwrap(), Key::from(3i64));
        assert_eq!(
            Key::from_value(&json!([1, "x"])).unwrap(),
            Key::Array(vec![Key::from(1i64), Key::from("x")])
        );
        assert!(Key::from_value(&json!({"a": 1})).is_err());
        assert!(Key::from_value(&json!(null)).is_err());
        assert!(Key::number(f64::NAN).is_err());
    }

    #[timeout(1000)]
    #[test]
    fn test_key_path_evaluation() {
        let value = json!({"isbn": "one", "meta": {"id": 7}});
        assert_eq!(
            evaluate_key_path(&value, "isbn").unwrap(),
            Some(Key::from("one"))
        );
        assert_eq!(
            evaluate_key_path(&value, "meta.id").unwrap(),
            Some(Key::from(7i64))
        );
        assert_eq!(evaluate_key_path(&value, "missing").unwrap(), None);
        assert!(evaluate_key_path(&value, "meta").is_err());
    }

    #[timeout(1000)]
    #[test]
    fn test_inject_key() {
        let mut value = json!({"title": "t"});
        inject_key(&mut value, "meta.id", &Key::from(3i64)).unwrap();
        assert_eq!(value, json!({"title": "t", "meta": {"id": 3}}));

        let mut scalar = json!(5);
        assert!(inject_key(&mut scalar, "id", &Key::from(1i64)).is_err());
    }

    #[timeout(1000)]
    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::bound(Key::from(1i64), Key::from(5i64), false, true).unwrap();
        assert!(range.contains(&Key::from(1i64)));
        assert!(range.contains(&Key::from(4i64)));
        assert!(!range.contains(&Key::from(5i64)));
        assert!(KeyRange::all().contains(&Key::from("z")));
        assert!(KeyRange::bound(Key::from(5i64), Key::from(1i64), false, false).is_err());
        assert!(KeyRange::bound(Key::from(1i64), Key::from(1i64), true, false).is_err());
    }

    #[timeout(1000)]
    #[test]
    fn test_key_serde_binary_as_hex() {
        let key = Key::from(vec![0xde, 0xad]);
        let encoded = serde_json::to_string(&key).unwrap();
        assert_eq!(encoded, r#"{"type":"binary","value":"dead"}"#);
        let decoded: Key = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, key);
    }
}
