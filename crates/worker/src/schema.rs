//! Input schema descriptor
//!
//! The schema file records the declared dtype of every training-time column,
//! which restores types lost when tables travel as JSON.

use crate::table::DType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabscore_common::{Result, METRICS};
use tracing::{debug, info, warn};

/// One declared column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub dtype: String,
}

/// Contents of `input_schema.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(default)]
    pub schema: Vec<SchemaField>,
}

impl InputSchema {
    /// Read and parse a schema file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Column name to declared dtype. Unknown dtype names are skipped.
    pub fn dtype_map(&self) -> HashMap<String, DType> {
        self.schema
            .iter()
            .filter_map(|field| match field.dtype.parse::<DType>() {
                Ok(dtype) => Some((field.name.clone(), dtype)),
                Err(_) => {
                    debug!(
                        column = %field.name,
                        dtype = %field.dtype,
                        "Skipping undeclarable dtype"
                    );
                    None
                }
            })
            .collect()
    }
}

/// Loads the schema file at most once and shares the result
pub struct SchemaCache {
    path: PathBuf,
    loaded: Mutex<Option<Arc<InputSchema>>>,
}

impl SchemaCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the schema, reading the file on first use.
    ///
    /// A missing file yields an empty schema, which is cached as well.
    /// A malformed file is an error and is retried on the next call.
    pub fn get(&self) -> Result<Arc<InputSchema>> {
        let mut slot = self.loaded.lock();
        if let Some(schema) = slot.as_ref() {
            return Ok(Arc::clone(schema));
        }

        let schema = if self.path.exists() {
            let schema = InputSchema::from_file(&self.path)?;
            info!(
                path = %self.path.display(),
                columns = schema.schema.len(),
                "Input schema loaded"
            );
            schema
        } else {
            warn!(
                path = %self.path.display(),
                "Input schema not found, column dtypes will be inferred"
            );
            InputSchema::default()
        };
        METRICS.models.schema_loads.inc();

        let schema = Arc::new(schema);
        *slot = Some(Arc::clone(&schema));
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_dtype_map_skips_unknown() {
        let schema: InputSchema = serde_json::from_str(
            r#"{"schema": [
                {"name": "age", "dtype": "int64", "feature_type": "Integer"},
                {"name": "city", "dtype": "object"},
                {"name": "when", "dtype": "datetime64[ns]"}
            ]}"#,
        )
        .unwrap();

        let map = schema.dtype_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["age"], DType::Int64);
        assert_eq!(map["city"], DType::Object);
    }

    #[test]
    fn test_cache_reads_once() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"schema": [{{"name": "a", "dtype": "float64"}}]}}"#).unwrap();

        let cache = SchemaCache::new(file.path());
        let first = cache.get().unwrap();

        std::fs::write(file.path(), "not json").unwrap();
        let second = cache.get().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.schema[0].name, "a");
    }

    #[test]
    fn test_missing_schema_is_empty() {
        let dir = tempdir().unwrap();
        let cache = SchemaCache::new(dir.path().join("input_schema.json"));
        let schema = cache.get().unwrap();
        assert!(schema.dtype_map().is_empty());
    }

    #[test]
    fn test_malformed_schema_errors() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ nope").unwrap();
        let cache = SchemaCache::new(file.path());
        assert!(cache.get().is_err());
    }
}
