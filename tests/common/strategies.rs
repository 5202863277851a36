use proptest::prelude::*;
use serde_json::{json, Map, Value};

/// Request ids that are safe as directory names
pub fn request_id_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9][a-zA-Z0-9_-]{0,40}"
}

/// Arbitrary JSON content, objects and scalars mixed
pub fn json_content_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 .,:{}\\[\\]\"]{0,24}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-zA-Z_]{1,8}", inner, 0..6).prop_map(|entries| {
                Value::Object(entries.into_iter().collect::<Map<String, Value>>())
            }),
        ]
    })
}

/// Object content only, which is what stage payloads carry
pub fn json_object_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-zA-Z_]{1,8}", json_content_strategy(), 0..6)
        .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<String, Value>>()))
}

/// Dot-separated routing key of 1 to 4 words
pub fn routing_key_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 1..5).prop_map(|words| words.join("."))
}

/// Selector list sizes for a map request: years, months, days, hours, types, levels
pub fn selector_counts_strategy() -> impl Strategy<Value = (usize, usize, usize, usize, usize, usize)> {
    (1usize..3, 1usize..3, 1usize..4, 1usize..5, 1usize..3, 1usize..3)
}
