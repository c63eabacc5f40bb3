use std::collections::BTreeMap;

use serde_json::{json, Map, Number, Value};

use crate::error::{EngineError, EngineResult};
use crate::model::{is_valid_ident, Id};

/// A node of a table schema.
///
/// The node kinds are closed and known at design time, so the tree is a
/// tagged union with exhaustive matching rather than an open class
/// hierarchy. Leaves carry a type-correct default; string leaves may be
/// annotated as foreign keys, references, publish-date or file fields.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaNode {
    Object(BTreeMap<String, SchemaNode>),
    Array(Box<SchemaNode>),
    String(StringNode),
    Number(NumberNode),
    Boolean(BooleanNode),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringNode {
    pub default: String,
    /// Strong pointer to a row id of the named table; blocks removals.
    pub foreign_key: Option<Id>,
    /// Soft pointer to a row id of the named table.
    pub reference: Option<Id>,
    /// Publish-date leaf; feeds `RowVersion::published_at`.
    pub published_at: bool,
    /// File-reference leaf; routed through the file plugin on writes.
    pub file: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberNode {
    pub default: Number,
}

impl Default for NumberNode {
    fn default() -> Self {
        Self {
            default: Number::from(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BooleanNode {
    pub default: bool,
}

impl SchemaNode {
    pub fn object(properties: BTreeMap<String, SchemaNode>) -> Self {
        SchemaNode::Object(properties)
    }

    pub fn array(items: SchemaNode) -> Self {
        SchemaNode::Array(Box::new(items))
    }

    pub fn string() -> Self {
        SchemaNode::String(StringNode::default())
    }

    pub fn number() -> Self {
        SchemaNode::Number(NumberNode::default())
    }

    pub fn boolean() -> Self {
        SchemaNode::Boolean(BooleanNode::default())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SchemaNode::Object(_) => "object",
            SchemaNode::Array(_) => "array",
            SchemaNode::String(_) => "string",
            SchemaNode::Number(_) => "number",
            SchemaNode::Boolean(_) => "boolean",
        }
    }

    /// The value a fresh row gets for this node.
    pub fn default_value(&self) -> Value {
        match self {
            SchemaNode::Object(properties) => {
                let mut map = Map::new();
                for (name, node) in properties {
                    map.insert(name.clone(), node.default_value());
                }
                Value::Object(map)
            }
            SchemaNode::Array(_) => Value::Array(Vec::new()),
            SchemaNode::String(node) => Value::String(node.default.clone()),
            SchemaNode::Number(node) => Value::Number(node.default.clone()),
            SchemaNode::Boolean(node) => Value::Bool(node.default),
        }
    }

    /// Canonical JSON Schema encoding of the tree.
    pub fn to_value(&self) -> Value {
        match self {
            SchemaNode::Object(properties) => {
                let mut props = Map::new();
                for (name, node) in properties {
                    props.insert(name.clone(), node.to_value());
                }
                let required: Vec<Value> = properties
                    .keys()
                    .map(|name| Value::String(name.clone()))
                    .collect();
                json!({
                    "type": "object",
                    "properties": Value::Object(props),
                    "required": required,
                    "additionalProperties": false,
                })
            }
            SchemaNode::Array(items) => json!({
                "type": "array",
                "items": items.to_value(),
            }),
            SchemaNode::String(node) => {
                let mut map = Map::new();
                map.insert("type".into(), json!("string"));
                map.insert("default".into(), json!(node.default));
                if let Some(table_id) = &node.foreign_key {
                    map.insert("foreignKey".into(), json!(table_id));
                }
                if let Some(table_id) = &node.reference {
                    map.insert("reference".into(), json!(table_id));
                }
                if node.published_at {
                    map.insert("publishedAt".into(), json!(true));
                }
                if node.file {
                    map.insert("file".into(), json!(true));
                }
                Value::Object(map)
            }
            SchemaNode::Number(node) => json!({
                "type": "number",
                "default": node.default,
            }),
            SchemaNode::Boolean(node) => json!({
                "type": "boolean",
                "default": node.default,
            }),
        }
    }

    /// Parse and meta-validate a JSON Schema document into the tree.
    ///
    /// The accepted dialect is strict: objects carry `properties`, a
    /// `required` list naming every property and
    /// `additionalProperties: false`; arrays carry `items`; leaves carry a
    /// type-correct `default`. Unknown keywords fail with the offending
    /// pointer.
    pub fn from_value(value: &Value) -> EngineResult<Self> {
        Self::parse(value, "")
    }

    fn parse(value: &Value, pointer: &str) -> EngineResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| EngineError::invalid_at("schema node must be an object", pointer))?;
        let node_type = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_at("schema node needs a string `type`", pointer))?;

        match node_type {
            "object" => Self::parse_object(map, pointer),
            "array" => Self::parse_array(map, pointer),
            "string" => Self::parse_string(map, pointer),
            "number" | "integer" => Self::parse_number(map, pointer),
            "boolean" => Self::parse_boolean(map, pointer),
            other => Err(EngineError::invalid_at(
                format!("unsupported schema type `{other}`"),
                pointer,
            )),
        }
    }

    fn parse_object(map: &Map<String, Value>, pointer: &str) -> EngineResult<Self> {
        reject_unknown_keys(
            map,
            &["type", "properties", "required", "additionalProperties"],
            pointer,
        )?;

        let props_value = map
            .get("properties")
            .ok_or_else(|| EngineError::invalid_at("object schema needs `properties`", pointer))?;
        let props_map = props_value.as_object().ok_or_else(|| {
            EngineError::invalid_at("`properties` must be an object", format!("{pointer}/properties"))
        })?;

        let mut properties = BTreeMap::new();
        for (name, child) in props_map {
            let child_pointer = format!("{pointer}/properties/{name}");
            if !is_valid_ident(name) {
                return Err(EngineError::invalid_at(
                    format!("illegal property name `{name}`"),
                    child_pointer,
                ));
            }
            properties.insert(name.clone(), Self::parse(child, &child_pointer)?);
        }

        if let Some(required) = map.get("required") {
            let listed = required
                .as_array()
                .ok_or_else(|| {
                    EngineError::invalid_at("`required` must be an array", format!("{pointer}/required"))
                })?
                .iter()
                .map(|entry| entry.as_str().map(str::to_string))
                .collect::<Option<std::collections::BTreeSet<String>>>()
                .ok_or_else(|| {
                    EngineError::invalid_at(
                        "`required` entries must be strings",
                        format!("{pointer}/required"),
                    )
                })?;
            let declared: std::collections::BTreeSet<String> =
                properties.keys().cloned().collect();
            if listed != declared {
                return Err(EngineError::invalid_at(
                    "`required` must name exactly the declared properties",
                    format!("{pointer}/required"),
                ));
            }
        }

        if let Some(additional) = map.get("additionalProperties") {
            if additional != &Value::Bool(false) {
                return Err(EngineError::invalid_at(
                    "`additionalProperties` must be false",
                    format!("{pointer}/additionalProperties"),
                ));
            }
        }

        Ok(SchemaNode::Object(properties))
    }

    fn parse_array(map: &Map<String, Value>, pointer: &str) -> EngineResult<Self> {
        reject_unknown_keys(map, &["type", "items"], pointer)?;
        let items = map
            .get("items")
            .ok_or_else(|| EngineError::invalid_at("array schema needs `items`", pointer))?;
        let items = Self::parse(items, &format!("{pointer}/items"))?;
        Ok(SchemaNode::Array(Box::new(items)))
    }

    fn parse_string(map: &Map<String, Value>, pointer: &str) -> EngineResult<Self> {
        reject_unknown_keys(
            map,
            &["type", "default", "foreignKey", "reference", "publishedAt", "file"],
            pointer,
        )?;
        let default = match map.get("default") {
            None => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(EngineError::invalid_at(
                    "string `default` must be a string",
                    format!("{pointer}/default"),
                ))
            }
        };
        let foreign_key = parse_table_pointer(map, "foreignKey", pointer)?;
        let reference = parse_table_pointer(map, "reference", pointer)?;
        if foreign_key.is_some() && reference.is_some() {
            return Err(EngineError::invalid_at(
                "a field cannot be both a foreign key and a reference",
                pointer,
            ));
        }
        let published_at = parse_flag(map, "publishedAt", pointer)?;
        let file = parse_flag(map, "file", pointer)?;
        Ok(SchemaNode::String(StringNode {
            default,
            foreign_key,
            reference,
            published_at,
            file,
        }))
    }

    fn parse_number(map: &Map<String, Value>, pointer: &str) -> EngineResult<Self> {
        reject_unknown_keys(map, &["type", "default"], pointer)?;
        let default = match map.get("default") {
            None => Number::from(0),
            Some(Value::Number(n)) => n.clone(),
            Some(_) => {
                return Err(EngineError::invalid_at(
                    "number `default` must be a number",
                    format!("{pointer}/default"),
                ))
            }
        };
        Ok(SchemaNode::Number(NumberNode { default }))
    }

    fn parse_boolean(map: &Map<String, Value>, pointer: &str) -> EngineResult<Self> {
        reject_unknown_keys(map, &["type", "default"], pointer)?;
        let default = match map.get("default") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(EngineError::invalid_at(
                    "boolean `default` must be a boolean",
                    format!("{pointer}/default"),
                ))
            }
        };
        Ok(SchemaNode::Boolean(BooleanNode { default }))
    }

    /// Validate `value` against this node, collecting one issue per
    /// offending JSON pointer.
    pub fn validate_value(&self, value: &Value, pointer: &str, issues: &mut Vec<ValidationIssue>) {
        match self {
            SchemaNode::Object(properties) => {
                let Some(map) = value.as_object() else {
                    issues.push(ValidationIssue::new(pointer, "expected object"));
                    return;
                };
                for (name, node) in properties {
                    match map.get(name) {
                        Some(child) => {
                            node.validate_value(child, &format!("{pointer}/{name}"), issues)
                        }
                        None => issues.push(ValidationIssue::new(
                            format!("{pointer}/{name}"),
                            "missing required property",
                        )),
                    }
                }
                for name in map.keys() {
                    if !properties.contains_key(name) {
                        issues.push(ValidationIssue::new(
                            format!("{pointer}/{name}"),
                            "unknown property",
                        ));
                    }
                }
            }
            SchemaNode::Array(items) => {
                let Some(entries) = value.as_array() else {
                    issues.push(ValidationIssue::new(pointer, "expected array"));
                    return;
                };
                for (index, entry) in entries.iter().enumerate() {
                    items.validate_value(entry, &format!("{pointer}/{index}"), issues);
                }
            }
            SchemaNode::String(_) => {
                if !value.is_string() {
                    issues.push(ValidationIssue::new(pointer, "expected string"));
                }
            }
            SchemaNode::Number(_) => {
                if !value.is_number() {
                    issues.push(ValidationIssue::new(pointer, "expected number"));
                }
            }
            SchemaNode::Boolean(_) => {
                if !value.is_boolean() {
                    issues.push(ValidationIssue::new(pointer, "expected boolean"));
                }
            }
        }
    }
}

/// A single data-validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationIssue {
    pub pointer: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            message: message.into(),
        }
    }
}

fn reject_unknown_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    pointer: &str,
) -> EngineResult<()> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(EngineError::invalid_at(
                format!("unknown schema keyword `{key}`"),
                format!("{pointer}/{key}"),
            ));
        }
    }
    Ok(())
}

fn parse_table_pointer(
    map: &Map<String, Value>,
    keyword: &str,
    pointer: &str,
) -> EngineResult<Option<Id>> {
    match map.get(keyword) {
        None => Ok(None),
        Some(Value::String(table_id)) if is_valid_ident(table_id) => Ok(Some(table_id.clone())),
        Some(_) => Err(EngineError::invalid_at(
            format!("`{keyword}` must name a table"),
            format!("{pointer}/{keyword}"),
        )),
    }
}

fn parse_flag(map: &Map<String, Value>, keyword: &str, pointer: &str) -> EngineResult<bool> {
    match map.get(keyword) {
        None => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(EngineError::invalid_at(
            format!("`{keyword}` must be a boolean"),
            format!("{pointer}/{keyword}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "default": ""}
            },
            "required": ["name"],
            "additionalProperties": false
        })
    }

    #[test]
    fn parse_round_trips_canonically() {
        let parsed = SchemaNode::from_value(&name_schema()).unwrap();
        assert_eq!(parsed.to_value(), name_schema());
    }

    #[test]
    fn required_must_match_properties() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": []
        });
        let err = SchemaNode::from_value(&schema).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));
    }

    #[test]
    fn unknown_keyword_is_rejected_with_pointer() {
        let schema = json!({"type": "string", "minLength": 3});
        match SchemaNode::from_value(&schema).unwrap_err() {
            EngineError::InvalidInput { pointer, .. } => {
                assert_eq!(pointer.as_deref(), Some("/minLength"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn foreign_key_and_reference_are_mutually_exclusive() {
        let schema = json!({"type": "string", "foreignKey": "a", "reference": "b"});
        assert!(SchemaNode::from_value(&schema).is_err());
    }

    #[test]
    fn nested_arrays_parse() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["tags"],
            "additionalProperties": false
        });
        let node = SchemaNode::from_value(&schema).unwrap();
        assert_eq!(node.default_value(), json!({"tags": []}));
    }

    #[test]
    fn validation_reports_json_pointers() {
        let node = SchemaNode::from_value(&name_schema()).unwrap();
        let mut issues = Vec::new();
        node.validate_value(&json!({"name": 5}), "", &mut issues);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].pointer, "/name");
    }

    #[test]
    fn validation_flags_unknown_and_missing_properties() {
        let node = SchemaNode::from_value(&name_schema()).unwrap();
        let mut issues = Vec::new();
        node.validate_value(&json!({"other": "x"}), "", &mut issues);
        let pointers: Vec<&str> = issues.iter().map(|i| i.pointer.as_str()).collect();
        assert!(pointers.contains(&"/name"));
        assert!(pointers.contains(&"/other"));
    }

    #[test]
    fn default_value_fills_nested_objects() {
        let schema = json!({
            "type": "object",
            "properties": {
                "price": {"type": "number", "default": 9},
                "active": {"type": "boolean", "default": true}
            },
            "required": ["active", "price"],
            "additionalProperties": false
        });
        let node = SchemaNode::from_value(&schema).unwrap();
        assert_eq!(node.default_value(), json!({"price": 9, "active": true}));
    }
}
