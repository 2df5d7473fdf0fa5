//! Request scoring pipeline
//!
//! decode -> optional transform -> model -> `{"prediction": ...}`.
//! Each request is handled independently; the caches are shared.

use crate::decode::decode_payload;
use crate::model::{timed_predict, ModelCache};
use crate::schema::SchemaCache;
use crate::table::{NdArray, Payload};
use crate::transformer::OnnxTransformer;
use serde_json::Value;
use std::time::Instant;
use tabscore_common::{LatencyTimer, Result, ScoringConfig, ScoringError, METRICS};
use tabscore_wire::{PredictRequest, PredictResponse};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Scores prediction requests against one model
pub struct Scorer {
    model_name: String,
    models: ModelCache,
    schema: SchemaCache,
    transformer: Option<OnnxTransformer>,
}

impl Scorer {
    /// Build a scorer from configuration.
    ///
    /// The transformer sidecar is optional; without it payloads reach the
    /// model untransformed.
    pub fn new(config: &ScoringConfig) -> Result<Self> {
        let model_dir = config.model_dir()?;
        info!(
            model_dir = %model_dir.display(),
            model = %config.model.model_file,
            "Creating scorer"
        );

        let transformer_path = model_dir.join(&config.model.transformer_file);
        let transformer = if transformer_path.exists() {
            Some(OnnxTransformer::load(&transformer_path)?)
        } else {
            info!(
                path = %transformer_path.display(),
                "No transformer sidecar, inputs are used as given"
            );
            None
        };

        Ok(Self::from_parts(
            config.model.model_file.clone(),
            ModelCache::new(&model_dir, config.model.input_shape.clone()),
            SchemaCache::new(model_dir.join(&config.model.schema_file)),
            transformer,
        ))
    }

    pub fn from_parts(
        model_name: impl Into<String>,
        models: ModelCache,
        schema: SchemaCache,
        transformer: Option<OnnxTransformer>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            models,
            schema,
            transformer,
        }
    }

    /// Load the model ahead of the first request
    pub fn warm_up(&self) -> Result<()> {
        self.models.load_model(&self.model_name).map(|_| ())
    }

    pub fn transformer(&self) -> Option<&OnnxTransformer> {
        self.transformer.as_ref()
    }

    /// Score one request body
    pub fn predict(&self, body: Value) -> Result<PredictResponse> {
        let request_id = Uuid::new_v4();
        let span = info_span!("predict", request_id = %request_id);
        let _enter = span.enter();

        METRICS.scoring.requests_total.inc();
        METRICS.scoring.active_requests.inc();
        let start = Instant::now();

        let result = self.score(body);

        METRICS.scoring.active_requests.dec();
        METRICS
            .scoring
            .request_duration
            .observe(start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => {
                METRICS.scoring.requests_success.inc();
                debug!(elapsed_us = start.elapsed().as_micros() as u64, "Request scored");
            }
            Err(e) => {
                METRICS.scoring.requests_failed.inc();
                warn!(error = %e, status = e.status_code(), "Request failed");
            }
        }
        result
    }

    fn score(&self, body: Value) -> Result<PredictResponse> {
        let model = self.models.load_model(&self.model_name)?;
        let payload = decode_payload(PredictRequest::from_value(body), &self.schema)?;
        debug!(kind = payload.kind(), "Payload decoded");

        let input = self.pre_inference(payload)?;
        METRICS.scoring.rows_scored_total.inc_by(input.rows() as u64);

        let output = timed_predict(model.as_ref(), &input)?;
        Ok(post_inference(&output))
    }

    /// Apply the transformer to frames and flatten the payload into model input
    pub fn pre_inference(&self, payload: Payload) -> Result<NdArray> {
        match &self.transformer {
            Some(transformer) if payload.is_frame() => METRICS
                .scoring
                .transform_duration
                .time(|| transformer.transform(&payload))?
                .to_ndarray(),
            _ => payload_to_ndarray(payload),
        }
    }
}

fn payload_to_ndarray(payload: Payload) -> Result<NdArray> {
    match payload {
        Payload::Array(array) | Payload::Tensor(array) => Ok(array),
        Payload::Table(table) => table.to_ndarray(),
        Payload::Series(series) => series.to_ndarray(),
        Payload::Raw(value) => json_to_ndarray(&value),
    }
}

/// Numbers or nested equal-length lists of numbers.
/// A flat list is one row.
fn json_to_ndarray(value: &Value) -> Result<NdArray> {
    let mut shape = Vec::new();
    let mut cursor = value;
    while let Value::Array(items) = cursor {
        shape.push(items.len());
        match items.first() {
            Some(first) => cursor = first,
            None => break,
        }
    }

    let mut values = Vec::new();
    flatten_json(value, &shape, &mut values)?;

    let shape = match shape.len() {
        0 => vec![1],
        1 => vec![1, shape[0]],
        _ => shape,
    };
    NdArray::new(shape, values)
}

fn flatten_json(value: &Value, shape: &[usize], out: &mut Vec<f32>) -> Result<()> {
    match (value, shape.split_first()) {
        (Value::Array(items), Some((&len, rest))) if items.len() == len => {
            for item in items {
                flatten_json(item, rest, out)?;
            }
            Ok(())
        }
        (Value::Array(_), _) => Err(ScoringError::invalid_input("ragged nested list payload")),
        (scalar, None) => {
            let cell = crate::table::Value::from_json(scalar)
                .and_then(|cell| cell.to_f32())
                .ok_or_else(|| {
                    ScoringError::invalid_input(format!("non-numeric payload value {}", scalar))
                })?;
            out.push(cell);
            Ok(())
        }
        (_, Some(_)) => Err(ScoringError::invalid_input("ragged nested list payload")),
    }
}

/// Shape model output into a response: one value becomes a scalar, a column
/// vector a flat list, anything else nested lists
pub fn post_inference(output: &NdArray) -> PredictResponse {
    let prediction = if output.len() == 1 {
        number(output.values[0])
    } else {
        match output.shape.as_slice() {
            [_, 1] => Value::Array(output.values.iter().copied().map(number).collect()),
            shape => nest(shape, &output.values),
        }
    };
    PredictResponse { prediction }
}

fn nest(shape: &[usize], values: &[f32]) -> Value {
    match shape.split_first() {
        Some((_, rest)) if !rest.is_empty() => {
            let stride = rest.iter().product::<usize>().max(1);
            Value::Array(values.chunks(stride).map(|chunk| nest(rest, chunk)).collect())
        }
        _ => Value::Array(values.iter().copied().map(number).collect()),
    }
}

fn number(value: f32) -> Value {
    serde_json::Number::from_f64(f64::from(value))
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Frame, Table, Value as Cell};
    use crate::tensor::encode_f32;
    use crate::transformer::ImputeValues;
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    /// y = 2 * a + b + 1
    fn write_model(dir: &Path) {
        let weight = NdArray::new(vec![1, 2], vec![2.0, 1.0]).unwrap();
        let bias = NdArray::new(vec![1], vec![1.0]).unwrap();
        let bytes = encode_f32(&[("weight", &weight), ("bias", &bias)]).unwrap();
        std::fs::write(dir.join("model.safetensors"), bytes).unwrap();
    }

    fn scorer(dir: &Path, transformer: Option<OnnxTransformer>) -> Scorer {
        Scorer::from_parts(
            "model.safetensors",
            ModelCache::new(dir, None),
            SchemaCache::new(dir.join("input_schema.json")),
            transformer,
        )
    }

    #[test]
    fn test_predict_rows() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let scorer = scorer(dir.path(), None);

        let response = scorer
            .predict(json!({"data": [{"a": 1, "b": 2}, {"a": 0, "b": 0}], "data_type": "table"}))
            .unwrap();
        assert_eq!(response.prediction, json!([5.0, 1.0]));
    }

    #[test]
    fn test_predict_with_transformer_imputes() {
        let dir = tempdir().unwrap();
        write_model(dir.path());

        let reference = json!({"a": [1, 2], "b": [3, 4]});
        let table = Table::from_column_map(reference.as_object().unwrap()).unwrap();
        let mut impute = ImputeValues::new();
        impute.insert("b".into(), Cell::Int(10));
        let mut transformer = OnnxTransformer::new();
        transformer.fit(&Frame::Table(table), Some(impute));

        let scorer = scorer(dir.path(), Some(transformer));
        let response = scorer.predict(json!({"a": [1], "b": [null]})).unwrap();
        assert_eq!(response.prediction, json!(13.0));
    }

    #[test]
    fn test_predict_raw_list_is_one_row() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let scorer = scorer(dir.path(), None);

        let response = scorer.predict(json!([3, 4])).unwrap();
        assert_eq!(response.prediction, json!(11.0));
    }

    #[test]
    fn test_predict_missing_model() {
        let dir = tempdir().unwrap();
        let scorer = scorer(dir.path(), None);

        let err = scorer.predict(json!([1, 2])).unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(err.to_string().contains("model.safetensors"));
    }

    #[test]
    fn test_scorer_loads_sidecar_from_config() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let reference = json!({"a": [1], "b": [2]});
        let table = Table::from_column_map(reference.as_object().unwrap()).unwrap();
        let mut transformer = OnnxTransformer::new();
        transformer.fit(&Frame::Table(table), None);
        transformer
            .save(dir.path().join("onnx_data_transformer.json"))
            .unwrap();

        let config: ScoringConfig = serde_yaml::from_str(&format!(
            "model:\n  model_dir: {}\n  model_file: model.safetensors\n",
            dir.path().display()
        ))
        .unwrap();
        let scorer = Scorer::new(&config).unwrap();
        scorer.warm_up().unwrap();
        assert!(scorer.transformer().unwrap().is_fitted());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_cached_model() {
        let dir = tempdir().unwrap();
        write_model(dir.path());
        let scorer = std::sync::Arc::new(scorer(dir.path(), None));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let scorer = std::sync::Arc::clone(&scorer);
                tokio::task::spawn_blocking(move || scorer.predict(json!([i, 0])))
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.prediction, json!(2.0 * i as f64 + 1.0));
        }
        assert_eq!(scorer.models.len(), 1);
    }

    #[test]
    fn test_json_to_ndarray_shapes() {
        assert_eq!(json_to_ndarray(&json!(2)).unwrap().shape, vec![1]);
        assert_eq!(json_to_ndarray(&json!([[1, 2], [3, 4], [5, 6]])).unwrap().shape, vec![3, 2]);
        assert!(json_to_ndarray(&json!([[1, 2], [3]])).is_err());
        assert!(json_to_ndarray(&json!(["a"])).is_err());
    }

    #[test]
    fn test_post_inference_shapes() {
        let scalar = NdArray::new(vec![1, 1], vec![0.5]).unwrap();
        assert_eq!(post_inference(&scalar).prediction, json!(0.5));

        let column = NdArray::new(vec![2, 1], vec![0.5, 0.25]).unwrap();
        assert_eq!(post_inference(&column).prediction, json!([0.5, 0.25]));

        let matrix = NdArray::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(post_inference(&matrix).prediction, json!([[1.0, 2.0], [3.0, 4.0]]));
    }
}
