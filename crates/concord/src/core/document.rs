use serde::{Deserialize, Serialize};

/// A value inside a context [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocValue {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Ordered list.
    List(Vec<DocValue>),
    /// Nested document.
    Map(Document),
}

impl From<bool> for DocValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for DocValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for DocValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for DocValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for DocValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for DocValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Document> for DocValue {
    fn from(v: Document) -> Self {
        Self::Map(v)
    }
}

/// Ordered key/value document attached to contacts, groups and appendices.
///
/// Keys keep insertion order so snapshots encode deterministically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    entries: Vec<(String, DocValue)>,
}

impl Document {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<DocValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&DocValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Inserts or replaces a key in place, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DocValue>) -> Option<DocValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) -> Option<DocValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// Overlays `other` onto `self`: keys present in `other` win, nested
    /// documents merge recursively.
    pub fn merge(&mut self, other: &Document) {
        for (key, value) in &other.entries {
            match (self.entries.iter_mut().find(|(k, _)| k == key), value) {
                (Some((_, DocValue::Map(mine))), DocValue::Map(theirs)) => mine.merge(theirs),
                (Some((_, slot)), _) => *slot = value.clone(),
                (None, _) => self.entries.push((key.clone(), value.clone())),
            }
        }
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the document has no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DocValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
