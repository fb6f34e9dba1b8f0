//! Query keys: normalized identity tuples for cacheable requests.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Error raised while building a query key.
///
/// Key construction only fails on malformed input, which is a bug in the
/// calling code rather than a runtime condition. It is never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
  #[error("query key kind must not be empty")]
  EmptyKind,

  #[error("parameter '{0}' must not be blank")]
  BlankParameter(String),

  #[error("parameter '{name}' cannot be used in a query key: {reason}")]
  Unserializable { name: String, reason: String },
}

/// A single element of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<KeyPart>),
}

impl KeyPart {
  /// Convert a JSON value into a key part.
  ///
  /// Objects become a list of `[field, value]` pairs sorted by field name, so
  /// two objects with the same fields always agree.
  fn from_json(name: &str, value: Value) -> Result<Self, KeyError> {
    match value {
      Value::Null => Ok(KeyPart::Null),
      Value::Bool(b) => Ok(KeyPart::Bool(b)),
      Value::String(s) => Ok(KeyPart::Str(s)),
      Value::Number(n) => n
        .as_i64()
        .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
        .map(KeyPart::Int)
        .ok_or_else(|| KeyError::Unserializable {
          name: name.to_string(),
          reason: format!("{} is not an integer", n),
        }),
      Value::Array(items) => items
        .into_iter()
        .map(|item| KeyPart::from_json(name, item))
        .collect::<Result<Vec<_>, _>>()
        .map(KeyPart::List),
      Value::Object(map) => {
        let mut fields: Vec<(String, Value)> = map.into_iter().collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        fields
          .into_iter()
          .map(|(field, item)| {
            Ok(KeyPart::List(vec![
              KeyPart::Str(field),
              KeyPart::from_json(name, item)?,
            ]))
          })
          .collect::<Result<Vec<_>, _>>()
          .map(KeyPart::List)
      }
    }
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Null => write!(f, "null"),
      KeyPart::Bool(b) => write!(f, "{}", b),
      KeyPart::Int(i) => write!(f, "{}", i),
      KeyPart::Str(s) => write!(f, "{:?}", s),
      KeyPart::List(items) => {
        write!(f, "[")?;
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}", item)?;
        }
        write!(f, "]")
      }
    }
  }
}

impl From<&str> for KeyPart {
  fn from(value: &str) -> Self {
    KeyPart::Str(value.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(value: String) -> Self {
    KeyPart::Str(value)
  }
}

impl From<&String> for KeyPart {
  fn from(value: &String) -> Self {
    KeyPart::Str(value.clone())
  }
}

impl From<bool> for KeyPart {
  fn from(value: bool) -> Self {
    KeyPart::Bool(value)
  }
}

impl From<i64> for KeyPart {
  fn from(value: i64) -> Self {
    KeyPart::Int(value)
  }
}

impl From<u32> for KeyPart {
  fn from(value: u32) -> Self {
    KeyPart::Int(i64::from(value))
  }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(KeyPart::Null)
  }
}

/// Identity of a cached request: the resource kind followed by its parameters.
///
/// Two keys are equal iff every part compares equal in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  /// Start building a key for the given resource kind.
  pub fn builder(kind: impl Into<String>) -> QueryKeyBuilder {
    QueryKeyBuilder {
      kind: kind.into(),
      parts: Vec::new(),
      error: None,
    }
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// The resource kind this key was built for.
  pub fn kind(&self) -> &str {
    match self.0.first() {
      Some(KeyPart::Str(kind)) => kind,
      _ => "",
    }
  }

  /// Derive the key of one page from a paginated session's base key.
  pub fn with_page(&self, page: u32) -> QueryKey {
    let mut parts = self.0.clone();
    parts.push(KeyPart::List(vec![
      KeyPart::Str("page".to_string()),
      KeyPart::from(page),
    ]));
    QueryKey(parts)
  }

  /// Stable SHA-256 digest of the key, used as the persistent storage id.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", KeyPart::List(self.0.clone()))
  }
}

/// Builder for [`QueryKey`].
///
/// Errors from `push_json` are remembered and reported by `build`, so calls
/// can be chained without intermediate `?`.
#[derive(Debug, Clone)]
pub struct QueryKeyBuilder {
  kind: String,
  parts: Vec<KeyPart>,
  error: Option<KeyError>,
}

impl QueryKeyBuilder {
  /// Append a positional value.
  pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
    self.parts.push(part.into());
    self
  }

  /// Append an optional value; `None` becomes null.
  pub fn push_opt<P: Into<KeyPart>>(self, part: Option<P>) -> Self {
    self.push(part)
  }

  /// Append an identifier that must not be blank.
  pub fn push_id(mut self, name: &str, id: &str) -> Self {
    if id.trim().is_empty() {
      self.error.get_or_insert(KeyError::BlankParameter(name.to_string()));
      return self;
    }
    self.parts.push(KeyPart::Str(id.to_string()));
    self
  }

  /// Append an unordered collection. Values are sorted and de-duplicated.
  pub fn push_set<I, S>(mut self, values: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let set: BTreeSet<String> = values.into_iter().map(Into::into).collect();
    self
      .parts
      .push(KeyPart::List(set.into_iter().map(KeyPart::Str).collect()));
    self
  }

  /// Append an arbitrary serializable value, normalized through JSON.
  pub fn push_json<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Self {
    if self.error.is_some() {
      return self;
    }
    let part = serde_json::to_value(value)
      .map_err(|e| KeyError::Unserializable {
        name: name.to_string(),
        reason: e.to_string(),
      })
      .and_then(|v| KeyPart::from_json(name, v));
    match part {
      Ok(part) => self.parts.push(part),
      Err(e) => self.error = Some(e),
    }
    self
  }

  pub fn build(self) -> Result<QueryKey, KeyError> {
    if let Some(e) = self.error {
      return Err(e);
    }
    if self.kind.trim().is_empty() {
      return Err(KeyError::EmptyKind);
    }
    let mut parts = Vec::with_capacity(self.parts.len() + 1);
    parts.push(KeyPart::Str(self.kind));
    parts.extend(self.parts);
    Ok(QueryKey(parts))
  }
}
