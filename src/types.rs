//! Core data types shared by the buffering layer and storage drivers
//!
//! # Key Types
//!
//! - **`Values`**: Nested map of metric fields, e.g. `{hits: 3, status: {ok: 2, err: 1}}`
//! - **`Value`**: A leaf number or a nested `Values` map
//! - **`Operation`**: Write semantics, additive (`Inc`) or overwrite (`Set`)
//!
//! # Example
//!
//! ```rust
//! use kuba_tally::types::Values;
//!
//! let mut total = Values::new().with("hits", 1).with("bytes", 512.0);
//! total
//!     .merge_add(&Values::new().with("hits", 2))
//!     .unwrap();
//!
//! assert_eq!(total.number("hits"), Some(3.0));
//! assert_eq!(total.number("bytes"), Some(512.0));
//! ```

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A leaf number or a nested map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Numeric leaf
    Number(f64),
    /// Nested map
    Tree(Values),
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<Values> for Value {
    fn from(tree: Values) -> Self {
        Value::Tree(tree)
    }
}

/// Nested map of metric fields
///
/// Keys are kept sorted so flattening and serialization are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(BTreeMap<String, Value>);

impl Values {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a field
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a top-level field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a top-level numeric field
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(Value::Number(n)) => Some(*n),
            _ => None,
        }
    }

    /// Follow a path of keys through nested maps
    pub fn path(&self, path: &[&str]) -> Option<&Value> {
        let (last, parents) = path.split_last()?;
        let mut tree = self;
        for key in parents {
            match tree.0.get(*key) {
                Some(Value::Tree(child)) => tree = child,
                _ => return None,
            }
        }
        tree.0.get(*last)
    }

    /// Number of top-level fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate top-level fields in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Reject NaN and infinite leaves
    pub fn ensure_finite(&self) -> Result<(), StorageError> {
        self.walk_leaves("", &mut |path, n| {
            if n.is_finite() {
                Ok(())
            } else {
                Err(invalid(path, format!("{} is not a finite number", n)))
            }
        })
    }

    /// Recursively add `incoming` into `self`
    ///
    /// Missing branches are created. A leaf on one side meeting a map on the
    /// other is an error, and `self` is left untouched when that happens.
    pub fn merge_add(&mut self, incoming: &Values) -> Result<(), StorageError> {
        self.check_add(incoming)?;
        self.apply_add(incoming);
        Ok(())
    }

    /// Whether [`merge_add`](Self::merge_add) would accept `incoming`
    pub fn check_add(&self, incoming: &Values) -> Result<(), StorageError> {
        self.check_addable(incoming, "")
    }

    /// Overwrite every leaf named in `incoming`, keeping all others
    pub fn replace_leaves(&mut self, incoming: &Values) {
        for (key, value) in &incoming.0 {
            match (self.0.get_mut(key), value) {
                (Some(Value::Tree(existing)), Value::Tree(tree)) => existing.replace_leaves(tree),
                _ => {
                    self.0.insert(key.clone(), value.clone());
                },
            }
        }
    }

    /// Flatten into `(joined path, number)` pairs
    pub fn flatten(&self, separator: &str) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        self.flatten_into(None, separator, &mut out);
        out
    }

    /// Rebuild a nested map from flattened pairs
    pub fn unflatten<I, K>(pairs: I, separator: &str) -> Result<Values, StorageError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut root = Values::new();
        for (path, number) in pairs {
            let path = path.as_ref();
            let segments: Vec<&str> = path.split(separator).collect();
            let (leaf, parents) = segments
                .split_last()
                .ok_or_else(|| invalid(path, "empty field path".to_string()))?;

            let mut tree = &mut root;
            for segment in parents {
                let entry = tree
                    .0
                    .entry((*segment).to_string())
                    .or_insert_with(|| Value::Tree(Values::new()));
                tree = match entry {
                    Value::Tree(child) => child,
                    Value::Number(_) => {
                        return Err(invalid(path, "field is both a number and a map".to_string()))
                    },
                };
            }

            if let Some(Value::Tree(_)) = tree.0.get(*leaf) {
                return Err(invalid(path, "field is both a number and a map".to_string()));
            }
            tree.0.insert((*leaf).to_string(), Value::Number(number));
        }
        Ok(root)
    }

    fn check_addable(&self, incoming: &Values, prefix: &str) -> Result<(), StorageError> {
        for (key, value) in &incoming.0 {
            let path = join_path(prefix, key);
            match (self.0.get(key), value) {
                (_, Value::Number(n)) if !n.is_finite() => {
                    return Err(invalid(&path, format!("{} is not a finite number", n)));
                },
                (None, Value::Tree(tree)) => Values::new().check_addable(tree, &path)?,
                (None, Value::Number(_)) | (Some(Value::Number(_)), Value::Number(_)) => {},
                (Some(Value::Tree(existing)), Value::Tree(tree)) => {
                    existing.check_addable(tree, &path)?
                },
                (Some(Value::Tree(_)), Value::Number(_)) => {
                    return Err(invalid(&path, "cannot add a number to a map".to_string()));
                },
                (Some(Value::Number(_)), Value::Tree(_)) => {
                    return Err(invalid(&path, "cannot add a map to a number".to_string()));
                },
            }
        }
        Ok(())
    }

    fn apply_add(&mut self, incoming: &Values) {
        for (key, value) in &incoming.0 {
            match (self.0.get_mut(key), value) {
                (Some(Value::Number(existing)), Value::Number(n)) => *existing += n,
                (Some(Value::Tree(existing)), Value::Tree(tree)) => existing.apply_add(tree),
                _ => {
                    self.0.insert(key.clone(), value.clone());
                },
            }
        }
    }

    fn walk_leaves<F>(&self, prefix: &str, f: &mut F) -> Result<(), StorageError>
    where
        F: FnMut(&str, f64) -> Result<(), StorageError>,
    {
        for (key, value) in &self.0 {
            let path = join_path(prefix, key);
            match value {
                Value::Number(n) => f(&path, *n)?,
                Value::Tree(tree) => tree.walk_leaves(&path, f)?,
            }
        }
        Ok(())
    }

    fn flatten_into(&self, prefix: Option<&str>, separator: &str, out: &mut Vec<(String, f64)>) {
        for (key, value) in &self.0 {
            let path = match prefix {
                Some(p) => format!("{}{}{}", p, separator, key),
                None => key.clone(),
            };
            match value {
                Value::Number(n) => out.push((path, *n)),
                Value::Tree(tree) => tree.flatten_into(Some(&path), separator, out),
            }
        }
    }
}

impl FromIterator<(String, Value)> for Values {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn invalid(path: &str, reason: String) -> StorageError {
    StorageError::InvalidValue {
        path: path.to_string(),
        reason,
    }
}

/// Write semantics of a pending action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Add to whatever is stored
    Inc,
    /// Overwrite whatever is stored
    Set,
}

impl Operation {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Inc => "inc",
            Operation::Set => "set",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
