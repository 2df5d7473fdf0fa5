//! Model loading and caching
//!
//! Models live in a single directory next to their sidecar files. Each file is
//! deserialized once per [`ModelCache`] and shared afterwards; entries are
//! never evicted because model files do not change while serving.

use crate::table::NdArray;
use crate::tensor::SafeTensorBuffer;
use memmap2::Mmap;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabscore_common::{LatencyTimer, Result, ScoringError, METRICS};
use tract_onnx::prelude::*;
use tracing::{debug, info};

/// A loaded model that maps a batch of `f32` features to outputs
pub trait ScoringModel: Send + Sync {
    /// File name the model was loaded from
    fn name(&self) -> &str;

    /// Run inference on a batch
    fn predict(&self, input: &NdArray) -> Result<NdArray>;
}

/// On-disk model formats, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// ONNX graph run by tract
    Onnx,
    /// Dense linear checkpoint in SafeTensor layout
    SafeTensors,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "onnx" => Some(ModelFormat::Onnx),
            "safetensors" => Some(ModelFormat::SafeTensors),
            _ => None,
        }
    }
}

type Plan = TypedRunnableModel<TypedModel>;

/// ONNX inference session
pub struct OnnxModel {
    name: String,
    plan: Plan,
}

impl OnnxModel {
    /// Memory-map and compile an ONNX file.
    ///
    /// `input_shape` pins the first input to `f32` of that shape; without it
    /// the shape declared in the graph is used.
    pub fn load(path: &Path, name: &str, input_shape: Option<&[usize]>) -> Result<Self> {
        let file = File::open(path)?;

        // The mapping is read-only and the file is treated as immutable while serving
        let mmap = unsafe { Mmap::map(&file)? };
        let mut reader: &[u8] = &mmap;

        let mut model = tract_onnx::onnx()
            .model_for_read(&mut reader)
            .map_err(|e| ScoringError::model(format!("Failed to load {}: {}", path.display(), e)))?;

        if let Some(shape) = input_shape {
            let dims: TVec<usize> = shape.iter().copied().collect();
            model
                .set_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), dims))
                .map_err(|e| ScoringError::model(format!("Failed to set input shape: {}", e)))?;
        }

        let plan = model
            .into_optimized()
            .map_err(|e| ScoringError::model(format!("Failed to optimize {}: {}", name, e)))?
            .into_runnable()
            .map_err(|e| ScoringError::model(format!("Failed to plan {}: {}", name, e)))?;

        Ok(Self {
            name: name.to_string(),
            plan,
        })
    }
}

impl ScoringModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, input: &NdArray) -> Result<NdArray> {
        let array = tract_ndarray::ArrayD::from_shape_vec(
            tract_ndarray::IxDyn(&input.shape),
            input.values.clone(),
        )
        .map_err(|e| ScoringError::tensor(format!("Invalid input shape: {}", e)))?;

        let mut outputs = self
            .plan
            .run(tvec![array.into_tensor().into()])
            .map_err(|e| ScoringError::model(format!("Inference failed: {}", e)))?;

        if outputs.is_empty() {
            return Err(ScoringError::model("Model produced no outputs"));
        }
        let output = outputs.remove(0);
        let output = output
            .cast_to_dt(f32::datum_type())
            .map_err(|e| ScoringError::model(format!("Output is not numeric: {}", e)))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| ScoringError::model(format!("Output is not f32: {}", e)))?;

        NdArray::new(view.shape().to_vec(), view.iter().copied().collect())
    }
}

/// Dense linear model: `y = x @ weight^T + bias`
pub struct LinearModel {
    name: String,
    /// Row-major `[outputs, features]`
    weight: Vec<f32>,
    bias: Vec<f32>,
    outputs: usize,
    features: usize,
}

impl LinearModel {
    /// Load `weight` (`[outputs, features]` or `[features]`) and optional
    /// `bias` (`[outputs]`) from a SafeTensor checkpoint
    pub fn load(path: &Path, name: &str) -> Result<Self> {
        let buffer = SafeTensorBuffer::open(path)?;

        let weight = buffer
            .get_tensor("weight")
            .ok_or_else(|| ScoringError::model(format!("{} has no `weight` tensor", name)))?;
        let (outputs, features) = match weight.shape() {
            [features] => (1, *features),
            [outputs, features] => (*outputs, *features),
            shape => {
                return Err(ScoringError::model(format!(
                    "`weight` must be 1-D or 2-D, got shape {:?}",
                    shape
                )))
            }
        };

        let bias = match buffer.get_tensor("bias") {
            Some(bias) if bias.len() == outputs => bias.to_f32_vec(),
            Some(bias) => {
                return Err(ScoringError::model(format!(
                    "`bias` has {} elements, expected {}",
                    bias.len(),
                    outputs
                )))
            }
            None => vec![0.0; outputs],
        };

        Ok(Self {
            name: name.to_string(),
            weight: weight.to_f32_vec(),
            bias,
            outputs,
            features,
        })
    }
}

impl ScoringModel for LinearModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, input: &NdArray) -> Result<NdArray> {
        let width = input.shape.last().copied().unwrap_or(0);
        if width != self.features || self.features == 0 {
            return Err(ScoringError::invalid_input(format!(
                "model expects {} features, input has shape {:?}",
                self.features, input.shape
            )));
        }

        let rows: Vec<Vec<f32>> = input
            .values
            .par_chunks(self.features)
            .map(|row| {
                self.weight
                    .chunks_exact(self.features)
                    .zip(&self.bias)
                    .map(|(w, b)| row.iter().zip(w).map(|(x, w)| x * w).sum::<f32>() + b)
                    .collect()
            })
            .collect();

        let n = rows.len();
        NdArray::new(vec![n, self.outputs], rows.concat())
    }
}

/// Per-process model cache keyed by file name
pub struct ModelCache {
    model_dir: PathBuf,
    input_shape: Option<Vec<usize>>,
    entries: Mutex<HashMap<String, Arc<dyn ScoringModel>>>,
}

impl ModelCache {
    pub fn new(model_dir: impl Into<PathBuf>, input_shape: Option<Vec<usize>>) -> Self {
        Self {
            model_dir: model_dir.into(),
            input_shape,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Number of cached models
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load `name` from the model directory, or return the cached instance.
    ///
    /// The lock is held while loading so a name is deserialized only once.
    pub fn load_model(&self, name: &str) -> Result<Arc<dyn ScoringModel>> {
        let mut entries = self.entries.lock();
        if let Some(model) = entries.get(name) {
            METRICS.models.model_cache_hits.inc();
            debug!(model = %name, "Model cache hit");
            return Ok(Arc::clone(model));
        }

        let present = std::fs::read_dir(&self.model_dir)
            .map(|listing| {
                listing
                    .filter_map(|entry| entry.ok())
                    .any(|entry| entry.file_name().to_str() == Some(name))
            })
            .unwrap_or(false);
        if !present {
            return Err(ScoringError::not_found(name, &self.model_dir));
        }

        let path = self.model_dir.join(name);
        info!(model = %name, path = %path.display(), "Loading model");

        let model: Arc<dyn ScoringModel> = match ModelFormat::from_path(&path) {
            Some(ModelFormat::Onnx) => Arc::new(OnnxModel::load(
                &path,
                name,
                self.input_shape.as_deref(),
            )?),
            Some(ModelFormat::SafeTensors) => Arc::new(LinearModel::load(&path, name)?),
            None => {
                return Err(ScoringError::unsupported(format!(
                    "no loader for model file {}",
                    name
                )))
            }
        };

        METRICS.models.model_loads.inc();
        entries.insert(name.to_string(), Arc::clone(&model));
        info!(model = %name, "Model loaded");
        Ok(model)
    }
}

/// Run a model and record its latency
pub fn timed_predict(model: &dyn ScoringModel, input: &NdArray) -> Result<NdArray> {
    METRICS.models.inference_duration.time(|| model.predict(input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::encode_f32;
    use tempfile::tempdir;

    fn write_linear(dir: &Path, name: &str) {
        let weight = NdArray::new(vec![2, 3], vec![1.0, 0.0, 0.0, 0.5, 0.5, 0.5]).unwrap();
        let bias = NdArray::new(vec![2], vec![0.0, 1.0]).unwrap();
        let bytes = encode_f32(&[("weight", &weight), ("bias", &bias)]).unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_missing_model_names_file_and_dir() {
        let dir = tempdir().unwrap();
        let cache = ModelCache::new(dir.path(), None);

        let err = cache.load_model("missing.pkl").err().unwrap();
        assert!(matches!(err, ScoringError::NotFound { .. }));
        let msg = err.to_string();
        assert!(msg.contains("missing.pkl"));
        assert!(msg.contains(&dir.path().display().to_string()));
    }

    #[test]
    fn test_cache_returns_same_instance() {
        let dir = tempdir().unwrap();
        write_linear(dir.path(), "model.safetensors");
        write_linear(dir.path(), "other.safetensors");
        let cache = ModelCache::new(dir.path(), None);

        let first = cache.load_model("model.safetensors").unwrap();
        let second = cache.load_model("model.safetensors").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = cache.load_model("other.safetensors").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("model.pkl"), b"\x80\x04").unwrap();
        let cache = ModelCache::new(dir.path(), None);

        let err = cache.load_model("model.pkl").err().unwrap();
        assert!(matches!(err, ScoringError::Unsupported(_)));
    }

    #[test]
    fn test_linear_predict() {
        let dir = tempdir().unwrap();
        write_linear(dir.path(), "model.safetensors");
        let model = LinearModel::load(&dir.path().join("model.safetensors"), "model").unwrap();

        let input = NdArray::new(vec![2, 3], vec![2.0, 4.0, 6.0, 1.0, 1.0, 1.0]).unwrap();
        let output = model.predict(&input).unwrap();

        assert_eq!(output.shape, vec![2, 2]);
        assert_eq!(output.values, vec![2.0, 7.0, 1.0, 2.5]);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let dir = tempdir().unwrap();
        write_linear(dir.path(), "model.safetensors");
        let model = LinearModel::load(&dir.path().join("model.safetensors"), "model").unwrap();

        let input = NdArray::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        assert!(model.predict(&input).is_err());
    }

    #[test]
    fn test_model_format_from_path() {
        assert_eq!(
            ModelFormat::from_path(Path::new("m.onnx")),
            Some(ModelFormat::Onnx)
        );
        assert_eq!(ModelFormat::from_path(Path::new("m.joblib")), None);
    }
}
