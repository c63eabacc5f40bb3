use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::model::content_hash;
use crate::schema::node::{SchemaNode, ValidationIssue};
use crate::schema::path::DataPath;
use crate::schema::refs::{collect_file_paths, collect_publish_paths};

/// A schema parsed once and reused for every row it validates.
///
/// "Compiling" a schema means parsing the document into the node tree and
/// precomputing the leaf paths the write path needs (publish-date and file
/// fields), keyed by the schema's content hash.
#[derive(Debug)]
pub struct CompiledSchema {
    pub root: SchemaNode,
    pub hash: String,
    publish_paths: Vec<DataPath>,
    file_paths: Vec<DataPath>,
}

impl CompiledSchema {
    pub fn compile(document: &Value) -> EngineResult<Self> {
        let root = SchemaNode::from_value(document)?;
        Ok(Self::from_node(root, content_hash(document)))
    }

    pub fn from_node(root: SchemaNode, hash: String) -> Self {
        let publish_paths = collect_publish_paths(&root);
        let file_paths = collect_file_paths(&root);
        Self {
            root,
            hash,
            publish_paths,
            file_paths,
        }
    }

    /// Validate row data, returning every offending JSON pointer.
    pub fn check(&self, data: &Value) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        self.root.validate_value(data, "", &mut issues);
        issues
    }

    /// Validate row data, failing on the first offending pointer.
    pub fn ensure_valid(&self, data: &Value) -> EngineResult<()> {
        match self.check(data).into_iter().next() {
            None => Ok(()),
            Some(issue) => Err(EngineError::invalid_at(issue.message, issue.pointer)),
        }
    }

    /// First non-empty publish-date leaf value, parsed as RFC 3339.
    /// Unparsable values count as empty.
    pub fn derive_published_at(&self, data: &Value) -> Option<DateTime<Utc>> {
        for path in &self.publish_paths {
            let mut values = Vec::new();
            path.collect(data, &mut values);
            for value in values {
                if let Some(raw) = value.as_str() {
                    if raw.is_empty() {
                        continue;
                    }
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                        return Some(parsed.with_timezone(&Utc));
                    }
                }
            }
        }
        None
    }

    pub fn has_file_fields(&self) -> bool {
        !self.file_paths.is_empty()
    }

    pub fn file_paths(&self) -> &[DataPath] {
        &self.file_paths
    }
}

struct CacheEntry {
    compiled: Arc<CompiledSchema>,
    inserted_at: Instant,
}

/// Process-wide cache of compiled schemas, keyed by schema content hash.
///
/// Shared across all concurrent requests; population races are
/// last-writer-wins, which is benign because every entry for a given hash is
/// equivalent.
pub struct ValidatorCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ValidatorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch the compiled form of `document`, compiling on miss or expiry.
    pub fn get_or_compile(&self, document: &Value) -> EngineResult<Arc<CompiledSchema>> {
        let hash = content_hash(document);
        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(&hash) {
                if entry.inserted_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&entry.compiled));
                }
            }
        }

        let compiled = Arc::new(CompiledSchema::from_node(
            SchemaNode::from_value(document)?,
            hash.clone(),
        ));
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        entries.insert(
            hash,
            CacheEntry {
                compiled: Arc::clone(&compiled),
                inserted_at: Instant::now(),
            },
        );
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ValidatorCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
