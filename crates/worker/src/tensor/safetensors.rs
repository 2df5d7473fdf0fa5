//! SafeTensor format support
//!
//! Checkpoint files are memory-mapped; binary request payloads are parsed from
//! owned bytes. Both share the same header validation and element decoding.

use crate::table::NdArray;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use tabscore_common::{Result, ScoringError};

const METADATA_KEY: &str = "__metadata__";

/// Data type for SafeTensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorDType {
    F64,
    F32,
    F16,
    I64,
    I32,
    I8,
    U8,
    BOOL,
}

impl TensorDType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            TensorDType::F64 | TensorDType::I64 => 8,
            TensorDType::F32 | TensorDType::I32 => 4,
            TensorDType::F16 => 2,
            TensorDType::I8 | TensorDType::U8 | TensorDType::BOOL => 1,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F64" => Some(TensorDType::F64),
            "F32" => Some(TensorDType::F32),
            "F16" => Some(TensorDType::F16),
            "I64" => Some(TensorDType::I64),
            "I32" => Some(TensorDType::I32),
            "I8" => Some(TensorDType::I8),
            "U8" => Some(TensorDType::U8),
            "BOOL" => Some(TensorDType::BOOL),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            TensorDType::F64 => "F64",
            TensorDType::F32 => "F32",
            TensorDType::F16 => "F16",
            TensorDType::I64 => "I64",
            TensorDType::I32 => "I32",
            TensorDType::I8 => "I8",
            TensorDType::U8 => "U8",
            TensorDType::BOOL => "BOOL",
        }
    }
}

/// Information about a single tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor dtype
    pub dtype: String,

    /// Tensor shape
    pub shape: Vec<usize>,

    /// Data offsets (start, end) in bytes, relative to the data section
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    /// Get the dtype
    pub fn get_dtype(&self) -> Option<TensorDType> {
        TensorDType::parse(&self.dtype)
    }

    /// Expected size in bytes from shape and dtype
    pub fn size_bytes(&self) -> Result<usize> {
        let dtype = self.get_dtype().ok_or_else(|| {
            ScoringError::tensor(format!("Unsupported dtype {}", self.dtype))
        })?;
        self.shape
            .iter()
            .try_fold(dtype.size(), |size, &dim| size.checked_mul(dim))
            .ok_or_else(|| {
                ScoringError::tensor(format!("Shape {:?} overflows the address space", self.shape))
            })
    }
}

enum Storage {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Storage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Storage::Mapped(mmap) => &mmap[..],
            Storage::Owned(bytes) => &bytes[..],
        }
    }
}

/// Parsed SafeTensor buffer
pub struct SafeTensorBuffer {
    storage: Storage,

    /// Tensor name to info, metadata entry excluded
    tensors: BTreeMap<String, TensorInfo>,

    /// Offset of the data section
    data_start: usize,
}

impl SafeTensorBuffer {
    /// Open a SafeTensor file with memory mapping
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| {
            ScoringError::tensor(format!("Failed to open file {}: {}", path.display(), e))
        })?;

        // The mapping is read-only and the file is treated as immutable while serving
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                ScoringError::tensor(format!("Failed to mmap file {}: {}", path.display(), e))
            })?
        };

        Self::parse(Storage::Mapped(mmap))
    }

    /// Parse a SafeTensor buffer held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(Storage::Owned(bytes))
    }

    fn parse(storage: Storage) -> Result<Self> {
        if storage.len() < 8 {
            return Err(ScoringError::tensor("Buffer too small to contain header"));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&storage[..8]);
        let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| ScoringError::tensor("Header length does not fit in memory"))?;

        let data_start = 8usize
            .checked_add(header_len)
            .filter(|end| *end <= storage.len())
            .ok_or_else(|| ScoringError::tensor("Truncated buffer: header length exceeds size"))?;

        let header: BTreeMap<String, serde_json::Value> =
            serde_json::from_slice(&storage[8..data_start]).map_err(|e| {
                ScoringError::tensor(format!("Failed to parse header JSON: {}", e))
            })?;

        let data_len = storage.len() - data_start;
        let mut tensors = BTreeMap::new();
        for (name, raw) in header {
            if name == METADATA_KEY {
                continue;
            }

            let info: TensorInfo = serde_json::from_value(raw).map_err(|e| {
                ScoringError::tensor(format!("Invalid entry for tensor {}: {}", name, e))
            })?;
            let expected = info.size_bytes().map_err(|e| {
                ScoringError::tensor(format!("Invalid tensor {}: {}", name, e))
            })?;

            let [start, end] = info.data_offsets;
            if start > end || end > data_len || end - start != expected {
                return Err(ScoringError::tensor(format!(
                    "Tensor {} has offsets {:?} inconsistent with shape {:?} ({} bytes available)",
                    name, info.data_offsets, info.shape, data_len
                )));
            }

            tensors.insert(name, info);
        }

        Ok(Self {
            storage,
            tensors,
            data_start,
        })
    }

    /// Get tensor names
    pub fn tensor_names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get a zero-copy view of a tensor
    pub fn get_tensor(&self, name: &str) -> Option<SafeTensorView<'_>> {
        let info = self.tensors.get(name)?;
        let dtype = info.get_dtype()?;
        let start = self.data_start + info.data_offsets[0];
        let end = self.data_start + info.data_offsets[1];

        Some(SafeTensorView {
            data: &self.storage[start..end],
            shape: info.shape.clone(),
            dtype,
        })
    }
}

/// Zero-copy view into a SafeTensor
pub struct SafeTensorView<'a> {
    data: &'a [u8],
    shape: Vec<usize>,
    dtype: TensorDType,
}

impl<'a> SafeTensorView<'a> {
    /// Get the tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the tensor dtype
    pub fn dtype(&self) -> TensorDType {
        self.dtype
    }

    /// Get the raw byte data
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Get the number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode every element to `f32`
    pub fn to_f32_vec(&self) -> Vec<f32> {
        let width = self.dtype.size();
        self.data
            .chunks_exact(width)
            .map(|b| match self.dtype {
                TensorDType::F64 => f64::from_le_bytes(bytes8(b)) as f32,
                TensorDType::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                TensorDType::F16 => half::f16::from_le_bytes([b[0], b[1]]).to_f32(),
                TensorDType::I64 => i64::from_le_bytes(bytes8(b)) as f32,
                TensorDType::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
                TensorDType::I8 => i8::from_le_bytes([b[0]]) as f32,
                TensorDType::U8 => b[0] as f32,
                TensorDType::BOOL => {
                    if b[0] != 0 {
                        1.0
                    } else {
                        0.0
                    }
                }
            })
            .collect()
    }

    /// Copy into an owned array
    pub fn to_ndarray(&self) -> Result<NdArray> {
        NdArray::new(self.shape.clone(), self.to_f32_vec())
    }
}

fn bytes8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Serialize `f32` tensors into a SafeTensor buffer
pub fn encode_f32(tensors: &[(&str, &NdArray)]) -> Result<Vec<u8>> {
    let mut header = BTreeMap::new();
    let mut data = Vec::new();
    for (name, array) in tensors {
        let start = data.len();
        for value in &array.values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        header.insert(
            name.to_string(),
            TensorInfo {
                dtype: TensorDType::F32.as_str().to_string(),
                shape: array.shape.clone(),
                data_offsets: [start, data.len()],
            },
        );
    }

    let header = serde_json::to_vec(&header)?;
    let mut buffer = Vec::with_capacity(8 + header.len() + data.len());
    buffer.extend_from_slice(&(header.len() as u64).to_le_bytes());
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&data);
    Ok(buffer)
}
