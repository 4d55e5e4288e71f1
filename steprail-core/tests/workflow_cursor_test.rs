//! Shared run data through cursors

use serde_json::json;
use steprail_core::workflow::cursor::DataCursor;

#[test]
fn test_set_then_get_same_path() {
    let cursor = DataCursor::new();
    cursor.set("plan.tasks", json!(["a", "b"]));
    assert_eq!(cursor.get("plan.tasks"), Some(json!(["a", "b"])));
}

#[test]
fn test_set_then_get_through_scope() {
    let cursor = DataCursor::new();
    let scoped = cursor.scope("create_plan");

    scoped.set("summary", "ship it");
    assert_eq!(scoped.get("summary"), Some(json!("ship it")));
    assert_eq!(cursor.get("create_plan.summary"), Some(json!("ship it")));
}

#[test]
fn test_missing_path_is_absent_not_error() {
    let cursor = DataCursor::from_value(json!({ "a": 1 }));
    assert_eq!(cursor.get("a.b.c"), None);
    assert_eq!(cursor.get("nope"), None);
    assert!(!cursor.contains("nope"));
}

#[test]
fn test_writes_visible_to_every_holder() {
    let cursor = DataCursor::new();
    let clone = cursor.clone();
    let nested = cursor.scope("outer").scope("inner");

    nested.set("value", 7);
    assert_eq!(clone.get("outer.inner.value"), Some(json!(7)));
    assert!(clone.shares_store_with(&nested));
    assert_eq!(nested.prefix(), "outer.inner");
}

#[test]
fn test_overwrite_replaces_prior_value() {
    let cursor = DataCursor::new();
    cursor.set("count", 1);
    cursor.set("count", 2);
    assert_eq!(cursor.get("count"), Some(json!(2)));
}

#[test]
fn test_separate_cursors_do_not_alias() {
    let first = DataCursor::new();
    let second = DataCursor::new();
    first.set("x", true);

    assert_eq!(second.get("x"), None);
    assert!(!first.shares_store_with(&second));
}

#[test]
fn test_set_at_array_end_appends() {
    let cursor = DataCursor::from_value(json!({ "items": [1, 2, 3] }));

    assert!(cursor.set("items.3", 4));
    assert_eq!(cursor.get("items"), Some(json!([1, 2, 3, 4])));
}

#[test]
fn test_out_of_range_or_named_segment_keeps_array() {
    let cursor = DataCursor::from_value(json!({ "items": [1, 2, 3] }));

    assert!(!cursor.set("items.9", 4));
    assert!(!cursor.set("items.name", "x"));
    assert!(!cursor.scope("items").set("name.deep", "x"));
    assert_eq!(cursor.to_value(), json!({ "items": [1, 2, 3] }));
}
