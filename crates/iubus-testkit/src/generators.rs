//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

use iubus_core::{LinkDelta, LinkMap, PayloadDelta};

/// Generate a payload key.
pub fn key() -> impl Strategy<Value = String> {
    "[a-z]{1,6}".prop_map(String::from)
}

/// Generate a link type such as `grin` or `sll`.
pub fn link_type() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("grin".to_string()),
        Just("sll".to_string()),
        Just("same_level".to_string()),
        "[a-z]{3,8}".prop_map(String::from),
    ]
}

/// Generate a link target uid.
pub fn target() -> impl Strategy<Value = String> {
    "[0-9a-f]{8}".prop_map(String::from)
}

/// Generate a JSON value up to two levels deep.
pub fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,12}".prop_map(Value::from),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map(key(), inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Generate a set of payload items.
pub fn payload_items(max: usize) -> impl Strategy<Value = BTreeMap<String, Value>> {
    prop::collection::btree_map(key(), json_value(), 0..=max)
}

/// Generate a link map with non-empty target sets.
pub fn link_map() -> impl Strategy<Value = LinkMap> {
    prop::collection::btree_map(link_type(), prop::collection::vec(target(), 1..4), 0..4)
        .prop_map(LinkMap::from_pairs)
}

/// Generate a payload delta, either incremental or a full replace.
pub fn payload_delta() -> impl Strategy<Value = PayloadDelta> {
    (
        any::<bool>(),
        payload_items(6),
        prop::collection::vec(key(), 0..4),
    )
        .prop_map(|(is_delta, new_items, keys_to_remove)| {
            if is_delta {
                PayloadDelta {
                    is_delta: true,
                    new_items,
                    keys_to_remove,
                }
            } else {
                PayloadDelta::replace(new_items)
            }
        })
}

/// Generate an incremental link delta.
pub fn link_delta() -> impl Strategy<Value = LinkDelta> {
    (link_map(), link_map()).prop_map(|(add, remove)| LinkDelta::modify(add, remove))
}

/// What a payload should contain after `delta` is applied to `before`.
pub fn expected_payload(
    before: &BTreeMap<String, Value>,
    delta: &PayloadDelta,
) -> BTreeMap<String, Value> {
    if !delta.is_delta {
        return delta.new_items.clone();
    }
    let mut after = before.clone();
    for key in &delta.keys_to_remove {
        after.remove(key);
    }
    for (key, value) in &delta.new_items {
        after.insert(key.clone(), value.clone());
    }
    after
}
