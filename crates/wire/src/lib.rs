//! tabscore wire types
//!
//! Request and response shapes exchanged with a scoring front end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared payload kind of a prediction request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Dense numeric array, base64-encoded binary
    Array,
    /// Single column of values
    Series,
    /// Row-oriented table
    Table,
    /// Dense tensor, base64-encoded binary
    Tensor,
    /// No usable declaration
    Raw,
}

impl DataType {
    /// Parse a declared tag. Accepts short names and the fully qualified
    /// type names emitted by Python clients.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "array" | "ndarray" | "numpy.ndarray" => DataType::Array,
            "series" | "pandas.Series" | "pandas.core.series.Series" => DataType::Series,
            "table" | "dataframe" | "pandas.DataFrame" | "pandas.core.frame.DataFrame" => {
                DataType::Table
            }
            "tensor" | "torch.Tensor" | "tf.Tensor" => DataType::Tensor,
            _ => DataType::Raw,
        }
    }

    /// Whether the payload is carried as base64 binary
    pub fn is_binary(&self) -> bool {
        matches!(self, DataType::Array | DataType::Tensor)
    }
}

/// Inbound prediction request
#[derive(Debug, Clone, PartialEq)]
pub struct PredictRequest {
    pub data: Value,
    pub data_type: DataType,
}

impl PredictRequest {
    /// Split a request body into payload and declared type.
    ///
    /// `{"data": ..., "data_type": ...}` envelopes are unwrapped; any other
    /// value is taken as an undeclared raw payload.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map)
                if map.contains_key("data")
                    && map.keys().all(|k| k == "data" || k == "data_type") =>
            {
                let data_type = map
                    .get("data_type")
                    .and_then(Value::as_str)
                    .map(DataType::from_tag)
                    .unwrap_or(DataType::Raw);
                let data = map.remove("data").unwrap_or(Value::Null);
                PredictRequest { data, data_type }
            }
            other => PredictRequest {
                data: other,
                data_type: DataType::Raw,
            },
        }
    }
}

/// Successful prediction response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    pub prediction: Value,
}

/// Failed prediction response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_unwrapped() {
        let request = PredictRequest::from_value(json!({
            "data": "AAAA",
            "data_type": "numpy.ndarray"
        }));
        assert_eq!(request.data, json!("AAAA"));
        assert_eq!(request.data_type, DataType::Array);
        assert!(request.data_type.is_binary());
    }

    #[test]
    fn test_plain_mapping_is_raw() {
        let body = json!({"a": [1, 2], "b": [3, 4]});
        let request = PredictRequest::from_value(body.clone());
        assert_eq!(request.data, body);
        assert_eq!(request.data_type, DataType::Raw);
    }

    #[test]
    fn test_unknown_tag_is_raw() {
        let request = PredictRequest::from_value(json!({"data": [1], "data_type": "xarray"}));
        assert_eq!(request.data_type, DataType::Raw);
    }

    #[test]
    fn test_response_shape() {
        let response = PredictResponse {
            prediction: json!([0.5, 0.25]),
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"prediction": [0.5, 0.25]})
        );
    }
}
