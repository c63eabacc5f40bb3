use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::model::is_valid_ident;

/// One step through a schema document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SchemaStep {
    /// Descend into `properties/<name>` of an object node.
    Property(String),
    /// Descend into `items` of an array node.
    Items,
}

/// A slash path over the schema document, e.g.
/// `/properties/author/items/properties/name`. The empty path addresses the
/// root node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SchemaPath {
    pub steps: Vec<SchemaStep>,
}

impl SchemaPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        let trimmed = raw.trim_start_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut steps = Vec::new();
        let mut segments = trimmed.split('/');
        while let Some(segment) = segments.next() {
            match segment {
                "properties" => {
                    let name = segments.next().ok_or_else(|| {
                        EngineError::invalid(format!("schema path `{raw}` ends at `properties`"))
                    })?;
                    if !is_valid_ident(name) {
                        return Err(EngineError::invalid(format!(
                            "schema path `{raw}` has illegal property name `{name}`"
                        )));
                    }
                    steps.push(SchemaStep::Property(name.to_string()));
                }
                "items" => steps.push(SchemaStep::Items),
                other => {
                    return Err(EngineError::invalid(format!(
                        "schema path `{raw}` has unexpected segment `{other}`"
                    )))
                }
            }
        }
        Ok(Self { steps })
    }

    /// The path without its last step, plus that step. `None` at the root.
    pub fn split_last(&self) -> Option<(SchemaPath, &SchemaStep)> {
        let (last, parent) = self.steps.split_last()?;
        Some((
            SchemaPath {
                steps: parent.to_vec(),
            },
            last,
        ))
    }

    /// Where this schema node's value lives inside row data.
    pub fn data_path(&self) -> DataPath {
        DataPath {
            steps: self
                .steps
                .iter()
                .map(|step| match step {
                    SchemaStep::Property(name) => DataStep::Field(name.clone()),
                    SchemaStep::Items => DataStep::AnyItem,
                })
                .collect(),
        }
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "/");
        }
        for step in &self.steps {
            match step {
                SchemaStep::Property(name) => write!(f, "/properties/{name}")?,
                SchemaStep::Items => write!(f, "/items")?,
            }
        }
        Ok(())
    }
}

/// One step through row data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataStep {
    Field(String),
    /// Every element of an array.
    AnyItem,
}

/// A path through row data, derived from a schema path. Field segments are
/// identifier-validated at parse time, which is what makes these paths safe
/// to hand to the storage layer as query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DataPath {
    pub steps: Vec<DataStep>,
}

impl DataPath {
    pub fn contains_arrays(&self) -> bool {
        self.steps.iter().any(|step| matches!(step, DataStep::AnyItem))
    }

    /// Collect every value reachable through this path.
    pub fn collect<'v>(&self, value: &'v serde_json::Value, out: &mut Vec<&'v serde_json::Value>) {
        Self::walk(&self.steps, value, out);
    }

    fn walk<'v>(
        steps: &[DataStep],
        value: &'v serde_json::Value,
        out: &mut Vec<&'v serde_json::Value>,
    ) {
        let Some((step, rest)) = steps.split_first() else {
            out.push(value);
            return;
        };
        match step {
            DataStep::Field(name) => {
                if let Some(child) = value.get(name) {
                    Self::walk(rest, child, out);
                }
            }
            DataStep::AnyItem => {
                if let Some(items) = value.as_array() {
                    for item in items {
                        Self::walk(rest, item, out);
                    }
                }
            }
        }
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for step in &self.steps {
            match step {
                DataStep::Field(name) => write!(f, ".{name}")?,
                DataStep::AnyItem => write!(f, "[*]")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_and_display_round_trip() {
        let raw = "/properties/author/items/properties/name";
        let path = SchemaPath::parse(raw).unwrap();
        assert_eq!(path.to_string(), raw);
        assert_eq!(path.steps.len(), 3);
    }

    #[test]
    fn root_paths() {
        assert!(SchemaPath::parse("/").unwrap().is_root());
        assert!(SchemaPath::parse("").unwrap().is_root());
    }

    #[test]
    fn rejects_stray_segments() {
        assert!(SchemaPath::parse("/name").is_err());
        assert!(SchemaPath::parse("/properties").is_err());
        assert!(SchemaPath::parse("/properties/bad name").is_err());
    }

    #[test]
    fn data_path_walks_arrays() {
        let path = SchemaPath::parse("/properties/tags/items/properties/label")
            .unwrap()
            .data_path();
        assert!(path.contains_arrays());
        let value = json!({"tags": [{"label": "a"}, {"label": "b"}]});
        let mut found = Vec::new();
        path.collect(&value, &mut found);
        assert_eq!(found, vec![&json!("a"), &json!("b")]);
    }

    #[test]
    fn data_path_display_is_queryable() {
        let path = SchemaPath::parse("/properties/author/properties/id")
            .unwrap()
            .data_path();
        assert_eq!(path.to_string(), "$.author.id");
    }
}
