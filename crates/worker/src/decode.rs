//! Request payload decoding
//!
//! Turns a request body and its declared [`DataType`] into a [`Payload`].
//! Each declared kind has its own decoder.

use crate::schema::SchemaCache;
use crate::table::{NdArray, Payload, Series, Table};
use crate::tensor::SafeTensorBuffer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use tabscore_common::{Result, ScoringError};
use tabscore_wire::{DataType, PredictRequest};
use tracing::debug;

/// Tensor name preferred when a binary payload holds several tensors
pub const PAYLOAD_TENSOR: &str = "data";

/// Decode a request into a payload
pub fn decode_payload(request: PredictRequest, schema: &SchemaCache) -> Result<Payload> {
    let PredictRequest { data, data_type } = request;
    debug!(data_type = ?data_type, "Decoding payload");

    match data_type {
        DataType::Array => decode_binary(&data).map(Payload::Array),
        DataType::Tensor => decode_binary(&data).map(Payload::Tensor),
        DataType::Series => Series::from_json(&data).map(Payload::Series),
        DataType::Table => decode_table(&data, schema).map(Payload::Table),
        DataType::Raw => match data {
            Value::String(_) => decode_table(&data, schema).map(Payload::Table),
            Value::Object(map) => Table::from_column_map(&map).map(Payload::Table),
            other => Ok(Payload::Raw(other)),
        },
    }
}

/// Base64 text holding a SafeTensor buffer
fn decode_binary(data: &Value) -> Result<NdArray> {
    let text = data
        .as_str()
        .ok_or_else(|| ScoringError::decode("binary payloads must be base64 strings"))?;
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| ScoringError::decode(format!("invalid base64 payload: {}", e)))?;

    let buffer = SafeTensorBuffer::from_bytes(bytes)?;
    let name = match buffer.len() {
        0 => return Err(ScoringError::decode("binary payload holds no tensor")),
        1 => buffer.tensor_names().next().cloned().unwrap_or_default(),
        _ => PAYLOAD_TENSOR.to_string(),
    };

    buffer
        .get_tensor(&name)
        .ok_or_else(|| {
            ScoringError::decode(format!(
                "binary payload holds several tensors but none named {:?}",
                PAYLOAD_TENSOR
            ))
        })?
        .to_ndarray()
}

/// Row-oriented JSON, possibly still encoded as a string, typed by the schema
fn decode_table(data: &Value, schema: &SchemaCache) -> Result<Table> {
    let parsed;
    let data = match data {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)?;
            &parsed
        }
        other => other,
    };

    let table = match data {
        Value::Array(rows) => Table::from_records(rows)?,
        Value::Object(map) => Table::from_column_map(map)?,
        other => {
            return Err(ScoringError::invalid_input(format!(
                "table payload must be a list of rows, got {}",
                json_kind(other)
            )))
        }
    };

    apply_schema(table, schema)
}

fn apply_schema(table: Table, schema: &SchemaCache) -> Result<Table> {
    let declared = schema.get()?.dtype_map();
    if declared.is_empty() {
        return Ok(table);
    }

    let columns = table
        .into_columns()
        .into_iter()
        .map(|column| match declared.get(&column.name) {
            Some(&dtype) if dtype != column.dtype => column.cast(dtype),
            _ => Ok(column),
        })
        .collect::<Result<Vec<_>>>()?;

    Table::new(columns)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{DType, Value as Cell};
    use crate::tensor::encode_f32;
    use serde_json::json;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn no_schema() -> (tempfile::TempDir, SchemaCache) {
        let dir = tempdir().unwrap();
        let cache = SchemaCache::new(dir.path().join("input_schema.json"));
        (dir, cache)
    }

    fn request(body: serde_json::Value) -> PredictRequest {
        PredictRequest::from_value(body)
    }

    #[test]
    fn test_array_payload() {
        let (_dir, schema) = no_schema();
        let array = NdArray::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let encoded = STANDARD.encode(encode_f32(&[("x", &array)]).unwrap());

        let payload =
            decode_payload(request(json!({"data": encoded, "data_type": "numpy.ndarray"})), &schema)
                .unwrap();
        assert_eq!(payload, Payload::Array(array));
    }

    #[test]
    fn test_tensor_payload_prefers_data_name() {
        let (_dir, schema) = no_schema();
        let other = NdArray::new(vec![1], vec![9.0]).unwrap();
        let data = NdArray::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let encoded = STANDARD.encode(encode_f32(&[("other", &other), ("data", &data)]).unwrap());

        let payload =
            decode_payload(request(json!({"data": encoded, "data_type": "tensor"})), &schema)
                .unwrap();
        assert_eq!(payload, Payload::Tensor(data));
    }

    #[test]
    fn test_oversized_shape_is_an_error() {
        let (_dir, schema) = no_schema();
        let shape = json!([1u64 << 62, 4]);
        let header = json!({"data": {"dtype": "F32", "shape": shape, "data_offsets": [0, 0]}})
            .to_string();
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());

        let err = decode_payload(
            request(json!({"data": STANDARD.encode(bytes), "data_type": "array"})),
            &schema,
        )
        .unwrap_err();
        assert!(matches!(err, ScoringError::Tensor(_)));
    }

    #[test]
    fn test_bad_base64() {
        let (_dir, schema) = no_schema();
        let err = decode_payload(request(json!({"data": "%%%", "data_type": "array"})), &schema)
            .unwrap_err();
        assert!(matches!(err, ScoringError::Decode(_)));
    }

    #[test]
    fn test_series_payload() {
        let (_dir, schema) = no_schema();
        let payload =
            decode_payload(request(json!({"data": [1, 2, 3], "data_type": "series"})), &schema)
                .unwrap();
        match payload {
            Payload::Series(series) => {
                assert_eq!(series.dtype, DType::Int64);
                assert_eq!(series.len(), 3);
            }
            other => panic!("expected a series, got {:?}", other),
        }
    }

    #[test]
    fn test_string_payload_uses_schema() {
        let mut file = NamedTempFile::new().unwrap();
        let schema = json!({"schema": [
            {"name": "zip", "dtype": "object"},
            {"name": "n", "dtype": "float32"}
        ]});
        write!(file, "{}", schema).unwrap();
        let schema = SchemaCache::new(file.path());

        let rows = json!([{"zip": "02139", "n": 1}, {"zip": "10001", "n": 2}]).to_string();
        let payload = decode_payload(request(json!(rows)), &schema).unwrap();

        let Payload::Table(table) = payload else {
            panic!("expected a table");
        };
        assert_eq!(table.column("zip").unwrap().dtype, DType::Object);
        assert_eq!(table.column("n").unwrap().dtype, DType::Float32);
        assert_eq!(table.column("n").unwrap().values[1], Cell::Float(2.0));
    }

    #[test]
    fn test_mapping_payload_is_column_table() {
        let (_dir, schema) = no_schema();
        let payload = decode_payload(request(json!({"a": [1, 2], "b": ["x", "y"]})), &schema)
            .unwrap();
        let Payload::Table(table) = payload else {
            panic!("expected a table");
        };
        assert_eq!(table.column_names(), vec!["a", "b"]);
        assert_eq!(table.n_rows(), 2);
    }

    #[test]
    fn test_other_payload_is_raw() {
        let (_dir, schema) = no_schema();
        let payload = decode_payload(request(json!([[1.0, 2.0]])), &schema).unwrap();
        assert_eq!(payload, Payload::Raw(json!([[1.0, 2.0]])));
    }

    #[test]
    fn test_table_tag_rejects_scalars() {
        let (_dir, schema) = no_schema();
        let err = decode_payload(request(json!({"data": 5, "data_type": "table"})), &schema)
            .unwrap_err();
        assert!(matches!(err, ScoringError::InvalidInput(_)));
    }
}
