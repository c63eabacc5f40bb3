use serde_json::{Number, Value};

use crate::schema::node::SchemaNode;

/// Convert an existing value into the shape of `target`.
///
/// Used when a `replace` patch swaps a node's schema: every stored value of
/// the old shape is re-derived instead of being reset. The scalar rules are
/// exhaustive over the closed node union:
///
/// - string -> number: `""` -> 0, numeric strings parse, anything else -> 0
/// - number -> string: decimal rendering
/// - string -> boolean: `"true"` -> true, anything else -> false
/// - boolean -> string: `"true"` / `"false"`
/// - number -> boolean: 0 -> false, anything else -> true
/// - boolean -> number: true -> 1, false -> 0
/// - scalar -> array: wrap the converted scalar as a single element
/// - array -> scalar: convert the first element, or the target default when
///   the array is empty
pub fn coerce_value(value: &Value, target: &SchemaNode) -> Value {
    match target {
        SchemaNode::Object(properties) => match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (name, node) in properties {
                    match map.get(name) {
                        Some(existing) => {
                            out.insert(name.clone(), coerce_value(existing, node));
                        }
                        None => {
                            out.insert(name.clone(), node.default_value());
                        }
                    }
                }
                Value::Object(out)
            }
            _ => target.default_value(),
        },
        SchemaNode::Array(items) => match value {
            Value::Array(entries) => Value::Array(
                entries
                    .iter()
                    .map(|entry| coerce_value(entry, items))
                    .collect(),
            ),
            other => Value::Array(vec![coerce_value(other, items)]),
        },
        SchemaNode::String(node) => match value {
            Value::String(s) => Value::String(s.clone()),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(if *b { "true" } else { "false" }.to_string()),
            Value::Array(entries) => match entries.first() {
                Some(first) => coerce_value(first, target),
                None => Value::String(node.default.clone()),
            },
            _ => Value::String(node.default.clone()),
        },
        SchemaNode::Number(node) => match value {
            Value::Number(n) => Value::Number(n.clone()),
            Value::String(s) => Value::Number(parse_number(s)),
            Value::Bool(b) => Value::Number(Number::from(if *b { 1 } else { 0 })),
            Value::Array(entries) => match entries.first() {
                Some(first) => coerce_value(first, target),
                None => Value::Number(node.default.clone()),
            },
            _ => Value::Number(node.default.clone()),
        },
        SchemaNode::Boolean(node) => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => Value::Bool(s == "true"),
            Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            Value::Array(entries) => match entries.first() {
                Some(first) => coerce_value(first, target),
                None => Value::Bool(node.default),
            },
            _ => Value::Bool(node.default),
        },
    }
}

fn parse_number(raw: &str) -> Number {
    if let Ok(int) = raw.parse::<i64>() {
        return Number::from(int);
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .unwrap_or_else(|| Number::from(0))
}
