//! Transformer sidecar persistence
//!
//! The fitted state is stored next to the model as `onnx_data_transformer.json`.
//! Each attribute carries its value plus a `dtype` tag naming the type it had
//! when saved. The tag is informational and is not checked on load.

use super::{ColumnKey, DtypeMap, ImputeValues, OnnxTransformer};
use crate::table::{DType, Value};
use serde::Serialize;
use serde_json::Map;
use std::path::Path;
use tabscore_common::{Result, ScoringError};
use tracing::{info, warn};

const IMPUTE_VALUES: &str = "impute_values";
const DTYPES: &str = "dtypes";
const FITTED: &str = "_fitted";

#[derive(Serialize)]
struct Tagged<T> {
    value: T,
    dtype: &'static str,
}

#[derive(Serialize)]
struct FlatDtypes {
    index: Vec<String>,
    values: Vec<&'static str>,
}

#[derive(Serialize)]
struct SidecarDocument {
    impute_values: Tagged<Option<Map<String, serde_json::Value>>>,
    dtypes: Tagged<FlatDtypes>,
    #[serde(rename = "_fitted")]
    fitted: Tagged<bool>,
}

impl OnnxTransformer {
    /// Write the fitted state to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        let impute_values = match &self.impute_values {
            Some(map) => Tagged {
                value: Some(
                    map.iter()
                        .map(|(key, fill)| (key.to_string(), fill.to_json()))
                        .collect(),
                ),
                dtype: "dict",
            },
            None => Tagged {
                value: None,
                dtype: "NoneType",
            },
        };

        let (index, values): (Vec<String>, Vec<&'static str>) = self
            .dtypes
            .iter()
            .map(|(name, dtype)| (name.to_string(), dtype.as_str()))
            .unzip();

        let document = SidecarDocument {
            impute_values,
            dtypes: Tagged {
                value: FlatDtypes { index, values },
                dtype: "Series",
            },
            fitted: Tagged {
                value: self.fitted,
                dtype: "bool",
            },
        };

        std::fs::write(path, serde_json::to_vec_pretty(&document)?)?;
        info!(path = %path.display(), columns = self.dtypes.len(), "Transformer saved");
        Ok(())
    }

    /// Restore a transformer written by [`OnnxTransformer::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let document: serde_json::Value = serde_json::from_str(&content)?;

        let fields = document
            .as_object()
            .ok_or_else(|| reload_failure("<document>", path, "expected a JSON object".into()))?;

        for attribute in [IMPUTE_VALUES, DTYPES, FITTED] {
            if !fields.contains_key(attribute) {
                return Err(reload_failure(attribute, path, "attribute is missing".into()));
            }
        }

        let mut transformer = OnnxTransformer::new();
        for (attribute, entry) in fields {
            let restored = match attribute.as_str() {
                IMPUTE_VALUES => stored_value(entry)
                    .and_then(restore_impute_values)
                    .map(|v| transformer.impute_values = v),
                DTYPES => stored_value(entry)
                    .and_then(restore_dtypes)
                    .map(|v| transformer.dtypes = v),
                FITTED => stored_value(entry)
                    .and_then(|v| v.as_bool().ok_or_else(|| "expected a bool".to_string()))
                    .map(|v| transformer.fitted = v),
                other => {
                    warn!(
                        attribute = other,
                        path = %path.display(),
                        "Ignoring unknown transformer attribute"
                    );
                    Ok(())
                }
            };

            if let Err(reason) = restored {
                return Err(reload_failure(attribute, path, reason));
            }
        }

        if let Some(values) = transformer.impute_values.take() {
            transformer.impute_values = Some(relabel_column_names(values, &transformer.dtypes));
        }

        info!(
            path = %path.display(),
            columns = transformer.dtypes.len(),
            fitted = transformer.fitted,
            "Transformer loaded"
        );
        Ok(transformer)
    }
}

fn reload_failure(attribute: &str, path: &Path, reason: String) -> ScoringError {
    warn!(
        attribute,
        path = %path.display(),
        reason = %reason,
        "Unable to restore transformer attribute"
    );
    ScoringError::reload(attribute, path, reason)
}

fn stored_value(entry: &serde_json::Value) -> std::result::Result<&serde_json::Value, String> {
    entry
        .get("value")
        .ok_or_else(|| "entry has no `value` field".to_string())
}

fn restore_impute_values(
    value: &serde_json::Value,
) -> std::result::Result<Option<ImputeValues>, String> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, fill)| {
                Value::from_json(fill)
                    .map(|fill| (ColumnKey::parse(key), fill))
                    .ok_or_else(|| format!("fill value for {:?} is not a scalar", key))
            })
            .collect::<std::result::Result<ImputeValues, String>>()
            .map(Some),
        _ => Err("expected an object or null".to_string()),
    }
}

/// Digit-only keys that name a fitted column were saved from labels
fn relabel_column_names(values: ImputeValues, dtypes: &DtypeMap) -> ImputeValues {
    values
        .into_iter()
        .map(|(key, fill)| match key {
            ColumnKey::Position(i) if dtypes.get(&i.to_string()).is_some() => {
                (ColumnKey::Label(i.to_string()), fill)
            }
            other => (other, fill),
        })
        .collect()
}

fn restore_dtypes(value: &serde_json::Value) -> std::result::Result<DtypeMap, String> {
    let index = value
        .get("index")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| "expected an `index` array".to_string())?;
    let values = value
        .get("values")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| "expected a `values` array".to_string())?;

    if index.len() != values.len() {
        return Err(format!(
            "`index` has {} entries but `values` has {}",
            index.len(),
            values.len()
        ));
    }

    index
        .iter()
        .zip(values)
        .map(|(name, dtype)| {
            let name = name
                .as_str()
                .ok_or_else(|| format!("column name {} is not a string", name))?;
            let dtype = dtype
                .as_str()
                .ok_or_else(|| format!("dtype {} is not a string", dtype))?
                .parse::<DType>()
                .map_err(|e| e.to_string())?;
            Ok((name.to_string(), dtype))
        })
        .collect()
}
