//! Tabscore Worker
//!
//! Scores tabular model requests: decodes payloads, applies the fitted
//! input transformer and runs the cached model.

pub mod decode;
pub mod model;
pub mod schema;
pub mod scorer;
pub mod table;
pub mod tensor;
pub mod transformer;

pub use decode::decode_payload;
pub use model::{LinearModel, ModelCache, ModelFormat, OnnxModel, ScoringModel};
pub use schema::{InputSchema, SchemaCache};
pub use scorer::Scorer;
pub use table::{Column, DType, Frame, NdArray, Payload, Series, Table, Value};
pub use transformer::{ColumnKey, DtypeMap, ImputeValues, OnnxTransformer};
