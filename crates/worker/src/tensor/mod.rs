//! Binary tensor formats
//!
//! Model checkpoints and base64 request payloads both use the SafeTensor layout.

pub mod safetensors;

pub use safetensors::{encode_f32, SafeTensorBuffer, SafeTensorView, TensorDType};
