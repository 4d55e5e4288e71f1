//! Scoped, path-addressable access to workflow data
//!
//! A `DataCursor` is a cheap handle over one shared JSON blob. Paths are
//! dot-separated (`plan.steps.0.title`); numeric segments index into arrays.
//! Cursors derived with [`DataCursor::scope`] resolve every path relative to
//! their prefix but read and write the same backing store, so a write through
//! any handle is immediately visible through every other one.
//!
//! The store takes a lock per call, never across an `.await`. Pipelines run
//! one step at a time, so the lock is uncontended in normal use; sharing one
//! blob between pipelines running in parallel needs external coordination.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Clone)]
pub struct DataCursor {
    root: Arc<RwLock<Value>>,
    prefix: Vec<String>,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|segment| !segment.is_empty())
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Child slot for `segment`, created when missing
///
/// Arrays only take an existing index or the next one (append); any other
/// segment under an array yields `None` and leaves the array untouched.
fn child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Array(items) => {
            let index = segment.parse::<usize>().ok()?;
            if index == items.len() {
                items.push(Value::Null);
            }
            items.get_mut(index)
        }
        other => Some(
            ensure_object(other)
                .entry(segment.to_string())
                .or_insert(Value::Null),
        ),
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

impl DataCursor {
    /// Cursor over a fresh empty object
    pub fn new() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }

    pub fn from_value(value: Value) -> Self {
        Self {
            root: Arc::new(RwLock::new(value)),
            prefix: Vec::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Value> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Value> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn full_path<'a>(&'a self, path: &'a str) -> Vec<&'a str> {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain(segments(path))
            .collect()
    }

    /// Dotted prefix this cursor is scoped to ("" at the root)
    pub fn prefix(&self) -> String {
        self.prefix.join(".")
    }

    /// Value at `path`, or `None` when any segment is missing
    pub fn get(&self, path: &str) -> Option<Value> {
        let full = self.full_path(path);
        let root = self.read();
        lookup(&root, &full).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        let full = self.full_path(path);
        let root = self.read();
        lookup(&root, &full).is_some()
    }

    /// Write `value` at `path`, creating intermediate objects as needed
    ///
    /// A scalar met along the way is replaced by an object. Arrays are never
    /// replaced: a segment that is neither an existing index nor the next one
    /// leaves the store unchanged and returns `false`.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> bool {
        let full = self.full_path(path);
        let mut root = self.write();

        let mut slot = &mut *root;
        for segment in &full {
            slot = match child_mut(slot, segment) {
                Some(child) => child,
                None => {
                    tracing::warn!(
                        path = full.join(".").as_str(),
                        segment = *segment,
                        "Refusing to write through an array with a non-index segment"
                    );
                    return false;
                }
            };
        }
        *slot = value.into();
        true
    }

    /// Remove and return the value at `path`
    pub fn remove(&self, path: &str) -> Option<Value> {
        let full = self.full_path(path);
        let (last, parents) = full.split_last()?;
        let mut root = self.write();

        let mut current = &mut *root;
        for segment in parents {
            current = match current {
                Value::Object(map) => map.get_mut(*segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        match current {
            Value::Object(map) => map.remove(*last),
            _ => None,
        }
    }

    /// Cursor whose paths are relative to `prefix` on the same store
    pub fn scope(&self, prefix: &str) -> DataCursor {
        let mut scoped = self.prefix.clone();
        scoped.extend(segments(prefix).map(str::to_string));
        DataCursor {
            root: Arc::clone(&self.root),
            prefix: scoped,
        }
    }

    /// Deep copy of the value under this cursor (`Null` when absent)
    pub fn to_value(&self) -> Value {
        self.get("").unwrap_or(Value::Null)
    }

    /// Replace the whole backing blob, regardless of scope
    pub(crate) fn replace_root(&self, value: Value) {
        *self.write() = value;
    }

    /// Whether two cursors share one backing store
    pub fn shares_store_with(&self, other: &DataCursor) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }
}

impl Default for DataCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCursor")
            .field("prefix", &self.prefix())
            .field("value", &self.to_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_creates_intermediate_objects() {
        let cursor = DataCursor::new();
        cursor.set("plan.summary.title", "ship it");

        assert_eq!(cursor.get("plan.summary.title"), Some(json!("ship it")));
        assert_eq!(cursor.to_value(), json!({ "plan": { "summary": { "title": "ship it" } } }));
    }

    #[test]
    fn test_set_replaces_scalars_on_the_way() {
        let cursor = DataCursor::from_value(json!({ "plan": 3 }));
        cursor.set("plan.title", "draft");
        assert_eq!(cursor.get("plan"), Some(json!({ "title": "draft" })));
    }

    #[test]
    fn test_array_segments() {
        let cursor = DataCursor::from_value(json!({ "items": [1, 2, 3] }));
        assert_eq!(cursor.get("items.1"), Some(json!(2)));
        assert_eq!(cursor.get("items.7"), None);

        assert!(cursor.set("items.2", 30));
        assert_eq!(cursor.get("items"), Some(json!([1, 2, 30])));
    }

    #[test]
    fn test_array_append_and_nested_write() {
        let cursor = DataCursor::from_value(json!({ "items": [1] }));
        assert!(cursor.set("items.1.name", "second"));
        assert_eq!(cursor.get("items"), Some(json!([1, { "name": "second" }])));
    }

    #[test]
    fn test_remove() {
        let cursor = DataCursor::from_value(json!({ "a": { "b": 1, "c": 2 } }));
        assert_eq!(cursor.remove("a.b"), Some(json!(1)));
        assert_eq!(cursor.remove("a.missing"), None);
        assert_eq!(cursor.to_value(), json!({ "a": { "c": 2 } }));
    }

    #[test]
    fn test_empty_path_addresses_scope_root() {
        let cursor = DataCursor::new();
        let scoped = cursor.scope("build");
        scoped.set("", json!({ "ok": true }));

        assert_eq!(cursor.get("build.ok"), Some(json!(true)));
        assert_eq!(scoped.prefix(), "build");
    }
}
