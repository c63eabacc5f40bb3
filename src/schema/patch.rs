use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::schema::coerce::coerce_value;
use crate::schema::node::SchemaNode;
use crate::schema::path::{DataStep, SchemaPath, SchemaStep};

/// A structural change to a table schema, JSON-Patch shaped.
///
/// `value` fields carry schema documents in the same dialect `SchemaNode`
/// parses; paths address the schema document (`/properties/<field>`,
/// `/items`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SchemaPatch {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
}

impl SchemaPatch {
    /// Apply the patch to `schema`, returning the matching data migration to
    /// run over every existing row of the table.
    pub fn apply(&self, schema: &mut SchemaNode) -> EngineResult<DataMigration> {
        match self {
            SchemaPatch::Add { path, value } => {
                let path = SchemaPath::parse(path)?;
                let node = SchemaNode::from_value(value)?;
                let (parent_path, name) = object_slot(&path)?;
                let parent = node_at_mut(schema, &parent_path)?;
                let SchemaNode::Object(properties) = parent else {
                    return Err(EngineError::invalid(format!(
                        "`add` target parent at `{parent_path}` is not an object"
                    )));
                };
                if properties.contains_key(name) {
                    return Err(EngineError::Conflict(format!(
                        "field `{name}` already exists at `{parent_path}`"
                    )));
                }
                let default = node.default_value();
                properties.insert(name.to_string(), node);
                Ok(DataMigration::Insert {
                    parent: parent_path,
                    field: name.to_string(),
                    value: default,
                })
            }
            SchemaPatch::Remove { path } => {
                let path = SchemaPath::parse(path)?;
                let (parent_path, name) = object_slot(&path)?;
                let parent = node_at_mut(schema, &parent_path)?;
                let SchemaNode::Object(properties) = parent else {
                    return Err(EngineError::invalid(format!(
                        "`remove` target parent at `{parent_path}` is not an object"
                    )));
                };
                if properties.remove(name).is_none() {
                    return Err(EngineError::not_found("schema field", path.to_string()));
                }
                Ok(DataMigration::Delete {
                    parent: parent_path,
                    field: name.to_string(),
                })
            }
            SchemaPatch::Replace { path, value } => {
                let path = SchemaPath::parse(path)?;
                let node = SchemaNode::from_value(value)?;
                let slot = node_at_mut(schema, &path)?;
                *slot = node.clone();
                Ok(DataMigration::Coerce { path, target: node })
            }
            SchemaPatch::Move { from, path } => {
                let from = SchemaPath::parse(from)?;
                let to = SchemaPath::parse(path)?;
                if from == to {
                    return Err(EngineError::invalid("`move` with identical from/path"));
                }
                if from.is_root() || to.is_root() {
                    return Err(EngineError::invalid("`move` cannot involve the root node"));
                }
                apply_move(schema, &from, &to)
            }
        }
    }
}

/// The row-data counterpart of one applied schema patch.
#[derive(Debug, Clone, PartialEq)]
pub enum DataMigration {
    /// New field: every parent object gains `field = value`.
    Insert {
        parent: SchemaPath,
        field: String,
        value: Value,
    },
    /// Removed field: every parent object drops `field`.
    Delete { parent: SchemaPath, field: String },
    /// Replaced node: every value at `path` is re-derived for the new shape.
    Coerce { path: SchemaPath, target: SchemaNode },
    /// Relocated node: the value leaves `from` and lands at `to`, coerced to
    /// the moved node when the relocation is ambiguous (array fan-out).
    Relocate {
        from: SchemaPath,
        to: SchemaPath,
        node: SchemaNode,
    },
}

impl DataMigration {
    /// Rewrite one row's `data` in place.
    pub fn migrate(&self, data: &mut Value) {
        match self {
            DataMigration::Insert {
                parent,
                field,
                value,
            } => {
                for_each_value_mut(data, &parent.data_path().steps, &mut |target| {
                    if let Value::Object(map) = target {
                        map.insert(field.clone(), value.clone());
                    }
                });
            }
            DataMigration::Delete { parent, field } => {
                for_each_value_mut(data, &parent.data_path().steps, &mut |target| {
                    if let Value::Object(map) = target {
                        map.remove(field);
                    }
                });
            }
            DataMigration::Coerce { path, target } => {
                for_each_value_mut(data, &path.data_path().steps, &mut |value| {
                    *value = coerce_value(value, target);
                });
            }
            DataMigration::Relocate { from, to, node } => {
                let from_data = from.data_path();
                let to_data = to.data_path();
                let detached = if from_data.contains_arrays() {
                    // Fan-out source: drop the field everywhere, nothing to
                    // carry across.
                    if let Some((parent, SchemaStep::Property(field))) = from.split_last() {
                        let field = field.clone();
                        for_each_value_mut(data, &parent.data_path().steps, &mut |target| {
                            if let Value::Object(map) = target {
                                map.remove(&field);
                            }
                        });
                    }
                    None
                } else {
                    take_value(data, &from_data.steps)
                };
                // Existing destination slots are re-derived for the moved
                // node's shape.
                for_each_value_mut(data, &to_data.steps, &mut |value| {
                    *value = coerce_value(value, node);
                });
                // A single carried value lands on single-slot destinations,
                // replacing any collision.
                if !to_data.contains_arrays() {
                    if let Some((parent, SchemaStep::Property(field))) = to.split_last() {
                        let field = field.clone();
                        let fill = coerce_value(&detached.unwrap_or_else(|| node.default_value()), node);
                        for_each_value_mut(data, &parent.data_path().steps, &mut |target| {
                            if let Value::Object(map) = target {
                                map.insert(field.clone(), fill.clone());
                            }
                        });
                    }
                }
            }
        }
    }
}

/// Apply a patch sequence, collecting the per-patch data migrations.
pub fn apply_patches(
    schema: &mut SchemaNode,
    patches: &[SchemaPatch],
) -> EngineResult<Vec<DataMigration>> {
    let mut migrations = Vec::with_capacity(patches.len());
    for patch in patches {
        migrations.push(patch.apply(schema)?);
    }
    Ok(migrations)
}

fn apply_move(
    schema: &mut SchemaNode,
    from: &SchemaPath,
    to: &SchemaPath,
) -> EngineResult<DataMigration> {
    // Detach first so renames within one object cannot alias.
    let (from_parent, from_step) = from
        .split_last()
        .ok_or_else(|| EngineError::invalid("`move` from-path must have a parent"))?;
    let from_step = from_step.clone();
    let detached = match (node_at_mut(schema, &from_parent)?, &from_step) {
        (SchemaNode::Object(properties), SchemaStep::Property(name)) => properties
            .remove(name)
            .ok_or_else(|| EngineError::not_found("schema field", from.to_string()))?,
        (SchemaNode::Array(items), SchemaStep::Items) => {
            // Detaching an array's item type leaves a string placeholder.
            std::mem::replace(items.as_mut(), SchemaNode::string())
        }
        _ => {
            return Err(EngineError::invalid(format!(
                "`move` from-path `{from}` does not match the schema shape"
            )))
        }
    };

    let (to_parent, to_step) = to
        .split_last()
        .ok_or_else(|| EngineError::invalid("`move` path must have a parent"))?;
    let to_step = to_step.clone();
    match (node_at_mut(schema, &to_parent)?, &to_step) {
        (SchemaNode::Object(properties), SchemaStep::Property(name)) => {
            // Destination collisions are replaced.
            properties.insert(name.clone(), detached.clone());
        }
        (SchemaNode::Array(items), SchemaStep::Items) => {
            *items.as_mut() = detached.clone();
        }
        _ => {
            return Err(EngineError::invalid(format!(
                "`move` path `{to}` does not match the schema shape"
            )))
        }
    }

    Ok(DataMigration::Relocate {
        from: from.clone(),
        to: to.clone(),
        node: detached,
    })
}

fn object_slot(path: &SchemaPath) -> EngineResult<(SchemaPath, &str)> {
    match path.split_last() {
        Some((parent, SchemaStep::Property(name))) => Ok((parent, name)),
        _ => Err(EngineError::invalid(format!(
            "path `{path}` must address an object property"
        ))),
    }
}

fn node_at_mut<'a>(root: &'a mut SchemaNode, path: &SchemaPath) -> EngineResult<&'a mut SchemaNode> {
    let mut current = root;
    for step in &path.steps {
        current = match (current, step) {
            (SchemaNode::Object(properties), SchemaStep::Property(name)) => properties
                .get_mut(name)
                .ok_or_else(|| EngineError::not_found("schema field", path.to_string()))?,
            (SchemaNode::Array(items), SchemaStep::Items) => items.as_mut(),
            _ => {
                return Err(EngineError::invalid(format!(
                    "schema path `{path}` does not match the schema shape"
                )))
            }
        };
    }
    Ok(current)
}

fn for_each_value_mut(value: &mut Value, steps: &[DataStep], apply: &mut dyn FnMut(&mut Value)) {
    let Some((step, rest)) = steps.split_first() else {
        apply(value);
        return;
    };
    match step {
        DataStep::Field(name) => {
            if let Some(child) = value.get_mut(name) {
                for_each_value_mut(child, rest, apply);
            }
        }
        DataStep::AnyItem => {
            if let Some(items) = value.as_array_mut() {
                for item in items {
                    for_each_value_mut(item, rest, apply);
                }
            }
        }
    }
}

fn take_value(value: &mut Value, steps: &[DataStep]) -> Option<Value> {
    let (step, rest) = steps.split_first()?;
    match step {
        DataStep::Field(name) => {
            if rest.is_empty() {
                value.as_object_mut()?.remove(name)
            } else {
                take_value(value.get_mut(name)?, rest)
            }
        }
        DataStep::AnyItem => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_schema() -> SchemaNode {
        SchemaNode::from_value(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "price": {"type": "string", "default": ""}
            },
            "required": ["name", "price"],
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn add_inserts_field_and_defaults_rows() {
        let mut schema = base_schema();
        let patch = SchemaPatch::Add {
            path: "/properties/stock".into(),
            value: json!({"type": "number", "default": 5}),
        };
        let migration = patch.apply(&mut schema).unwrap();
        let mut data = json!({"name": "x", "price": "1"});
        migration.migrate(&mut data);
        assert_eq!(data, json!({"name": "x", "price": "1", "stock": 5}));
    }

    #[test]
    fn add_existing_field_conflicts() {
        let mut schema = base_schema();
        let patch = SchemaPatch::Add {
            path: "/properties/name".into(),
            value: json!({"type": "string"}),
        };
        assert!(matches!(
            patch.apply(&mut schema).unwrap_err(),
            EngineError::Conflict(_)
        ));
    }

    #[test]
    fn remove_drops_field_from_rows() {
        let mut schema = base_schema();
        let patch = SchemaPatch::Remove {
            path: "/properties/price".into(),
        };
        let migration = patch.apply(&mut schema).unwrap();
        let mut data = json!({"name": "x", "price": "1"});
        migration.migrate(&mut data);
        assert_eq!(data, json!({"name": "x"}));
    }

    #[test]
    fn remove_missing_field_is_not_found() {
        let mut schema = base_schema();
        let patch = SchemaPatch::Remove {
            path: "/properties/ghost".into(),
        };
        assert!(matches!(
            patch.apply(&mut schema).unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }

    #[test]
    fn replace_coerces_existing_values() {
        let mut schema = base_schema();
        let patch = SchemaPatch::Replace {
            path: "/properties/price".into(),
            value: json!({"type": "number"}),
        };
        let migration = patch.apply(&mut schema).unwrap();

        for (input, expected) in [(json!(""), json!(0)), (json!("3"), json!(3)), (json!("abc"), json!(0))]
        {
            let mut data = json!({"name": "x", "price": input});
            migration.migrate(&mut data);
            assert_eq!(data["price"], expected, "replace coercion");
        }
    }

    #[test]
    fn replace_inside_array_items() {
        let mut schema = SchemaNode::from_value(&json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["tags"],
            "additionalProperties": false
        }))
        .unwrap();
        let patch = SchemaPatch::Replace {
            path: "/properties/tags/items".into(),
            value: json!({"type": "number"}),
        };
        let migration = patch.apply(&mut schema).unwrap();
        let mut data = json!({"tags": ["1", "2", "x"]});
        migration.migrate(&mut data);
        assert_eq!(data, json!({"tags": [1, 2, 0]}));
    }

    #[test]
    fn move_renames_within_object() {
        let mut schema = base_schema();
        let patch = SchemaPatch::Move {
            from: "/properties/price".into(),
            path: "/properties/cost".into(),
        };
        let migration = patch.apply(&mut schema).unwrap();
        match &schema {
            SchemaNode::Object(props) => {
                assert!(props.contains_key("cost"));
                assert!(!props.contains_key("price"));
            }
            _ => unreachable!(),
        }
        let mut data = json!({"name": "x", "price": "9"});
        migration.migrate(&mut data);
        assert_eq!(data, json!({"name": "x", "cost": "9"}));
    }

    #[test]
    fn move_into_array_items_replaces_item_type() {
        let mut schema = SchemaNode::from_value(&json!({
            "type": "object",
            "properties": {
                "price": {"type": "number", "default": 1},
                "list": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["list", "price"],
            "additionalProperties": false
        }))
        .unwrap();
        let patch = SchemaPatch::Move {
            from: "/properties/price".into(),
            path: "/properties/list/items".into(),
        };
        let migration = patch.apply(&mut schema).unwrap();
        let mut data = json!({"price": 7, "list": ["a", "8"]});
        migration.migrate(&mut data);
        // Existing elements are re-derived for the moved number node.
        assert_eq!(data, json!({"list": [0, 8]}));
    }

    #[test]
    fn patch_sequence_round_trip() {
        let mut schema = base_schema();
        apply_patches(
            &mut schema,
            &[
                SchemaPatch::Add {
                    path: "/properties/stock".into(),
                    value: json!({"type": "number"}),
                },
                SchemaPatch::Remove {
                    path: "/properties/price".into(),
                },
            ],
        )
        .unwrap();
        let expected = SchemaNode::from_value(&json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "stock": {"type": "number"}
            },
            "required": ["name", "stock"],
            "additionalProperties": false
        }))
        .unwrap();
        assert_eq!(schema, expected);
    }
}
