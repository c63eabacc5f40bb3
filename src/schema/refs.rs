use crate::model::Id;
use crate::schema::node::SchemaNode;
use crate::schema::path::{DataPath, SchemaPath, SchemaStep};

/// Which leaf annotation a scan is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    ForeignKey,
    Reference,
}

/// Collect the data paths of every string leaf annotated as a
/// `kind`-pointer at the named table.
pub fn collect_pointer_paths(
    schema: &SchemaNode,
    kind: PointerKind,
    target_table: &str,
) -> Vec<DataPath> {
    let mut found = Vec::new();
    walk(schema, &mut SchemaPath::root(), &mut |path, node| {
        if let SchemaNode::String(leaf) = node {
            let target = match kind {
                PointerKind::ForeignKey => leaf.foreign_key.as_deref(),
                PointerKind::Reference => leaf.reference.as_deref(),
            };
            if target == Some(target_table) {
                found.push(path.data_path());
            }
        }
    });
    found
}

/// Whether any leaf of `schema` points (either kind) at the named table.
pub fn declares_pointer_to(schema: &SchemaNode, target_table: &str) -> bool {
    !collect_pointer_paths(schema, PointerKind::ForeignKey, target_table).is_empty()
        || !collect_pointer_paths(schema, PointerKind::Reference, target_table).is_empty()
}

/// Data paths of every publish-date leaf, in schema order.
pub fn collect_publish_paths(schema: &SchemaNode) -> Vec<DataPath> {
    let mut found = Vec::new();
    walk(schema, &mut SchemaPath::root(), &mut |path, node| {
        if matches!(node, SchemaNode::String(leaf) if leaf.published_at) {
            found.push(path.data_path());
        }
    });
    found
}

/// Data paths of every file-reference leaf.
pub fn collect_file_paths(schema: &SchemaNode) -> Vec<DataPath> {
    let mut found = Vec::new();
    walk(schema, &mut SchemaPath::root(), &mut |path, node| {
        if matches!(node, SchemaNode::String(leaf) if leaf.file) {
            found.push(path.data_path());
        }
    });
    found
}

/// Retarget every foreign-key/reference annotation from `old_id` to
/// `new_id`. Returns whether anything changed; used when a table rename
/// cascades through stored schemas.
pub fn rewrite_table_pointers(schema: &mut SchemaNode, old_id: &Id, new_id: &Id) -> bool {
    match schema {
        SchemaNode::Object(properties) => {
            let mut changed = false;
            for node in properties.values_mut() {
                changed |= rewrite_table_pointers(node, old_id, new_id);
            }
            changed
        }
        SchemaNode::Array(items) => rewrite_table_pointers(items, old_id, new_id),
        SchemaNode::String(leaf) => {
            let mut changed = false;
            if leaf.foreign_key.as_ref() == Some(old_id) {
                leaf.foreign_key = Some(new_id.clone());
                changed = true;
            }
            if leaf.reference.as_ref() == Some(old_id) {
                leaf.reference = Some(new_id.clone());
                changed = true;
            }
            changed
        }
        SchemaNode::Number(_) | SchemaNode::Boolean(_) => false,
    }
}

fn walk(node: &SchemaNode, path: &mut SchemaPath, visit: &mut dyn FnMut(&SchemaPath, &SchemaNode)) {
    visit(path, node);
    match node {
        SchemaNode::Object(properties) => {
            for (name, child) in properties {
                path.steps.push(SchemaStep::Property(name.clone()));
                walk(child, path, visit);
                path.steps.pop();
            }
        }
        SchemaNode::Array(items) => {
            path.steps.push(SchemaStep::Items);
            walk(items, path, visit);
            path.steps.pop();
        }
        SchemaNode::String(_) | SchemaNode::Number(_) | SchemaNode::Boolean(_) => {}
    }
}
