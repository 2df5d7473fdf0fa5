//! Tabular payload types
//!
//! Cells, dtypes, columns, series, and tables as decoded from prediction
//! requests. Tables keep column order; every column has the same length.

use num_traits::ToPrimitive;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Map;
use std::fmt;
use std::str::FromStr;
use tabscore_common::{Result, ScoringError};

/// A single cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Convert a JSON scalar. Arrays and objects are not cells.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int(i)),
                None => n.as_f64().map(Value::Float),
            },
            serde_json::Value::String(s) => Some(Value::Str(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Convert back to JSON. NaN becomes null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Missing-value marker: null or NaN
    pub fn is_missing(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Empty or all-whitespace string
    pub fn is_blank(&self) -> bool {
        matches!(self, Value::Str(s) if s.trim().is_empty())
    }

    /// Numeric view used when building model input
    pub fn to_f32(&self) -> Option<f32> {
        match self {
            Value::Null => Some(f32::NAN),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => i.to_f32(),
            Value::Float(f) => f.to_f32(),
            Value::Str(_) => None,
        }
    }

    /// Convert this cell to `dtype`
    pub fn cast(&self, dtype: DType) -> std::result::Result<Value, String> {
        match dtype {
            DType::Object => Ok(self.clone()),
            DType::Float32 => self.cast_float().map(|f| Value::Float(f as f32 as f64)),
            DType::Float64 => self.cast_float().map(Value::Float),
            DType::Int64 => self.cast_int(),
            DType::Int32 => match self.cast_int()? {
                Value::Int(i) if i32::try_from(i).is_ok() => Ok(Value::Int(i)),
                _ => Err(format!("{} is out of range for int32", self)),
            },
            DType::Bool => match self {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                Value::Float(f) if *f == 0.0 => Ok(Value::Bool(false)),
                Value::Float(f) if *f == 1.0 => Ok(Value::Bool(true)),
                Value::Str(s) => match s.trim() {
                    "true" | "True" => Ok(Value::Bool(true)),
                    "false" | "False" => Ok(Value::Bool(false)),
                    _ => Err(format!("cannot convert {} to bool", self)),
                },
                _ => Err(format!("cannot convert {} to bool", self)),
            },
        }
    }

    fn cast_float(&self) -> std::result::Result<f64, String> {
        match self {
            Value::Null => Ok(f64::NAN),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => i
                .to_f64()
                .ok_or_else(|| format!("cannot convert {} to float", i)),
            Value::Float(f) => Ok(*f),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("cannot convert {:?} to float", s)),
        }
    }

    fn cast_int(&self) -> std::result::Result<Value, String> {
        match self {
            Value::Null => Err("cannot convert missing value to integer".to_string()),
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => f
                .to_i64()
                .map(Value::Int)
                .ok_or_else(|| format!("{} is out of range for integer", f)),
            Value::Float(f) => Err(format!("cannot convert {} to integer", f)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("cannot convert {:?} to integer", s)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
    Bool,
    Object,
}

impl DType {
    /// Canonical name as written to schema and sidecar files
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Bool => "bool",
            DType::Object => "object",
        }
    }

    /// Integer or floating point
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DType::Float32 | DType::Float64 | DType::Int32 | DType::Int64
        )
    }
}

impl FromStr for DType {
    type Err = ScoringError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "float32" | "float16" => Ok(DType::Float32),
            "float64" | "float" | "double" => Ok(DType::Float64),
            "int32" | "int16" | "int8" | "uint16" | "uint8" => Ok(DType::Int32),
            "int64" | "int" | "integer" | "uint32" | "uint64" => Ok(DType::Int64),
            "bool" | "boolean" => Ok(DType::Bool),
            "object" | "str" | "string" | "category" | "O" => Ok(DType::Object),
            other => Err(ScoringError::invalid_input(format!(
                "Unknown dtype: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}

/// Infer a dtype from JSON-derived cells
pub fn infer_dtype(values: &[Value]) -> DType {
    let (mut ints, mut floats, mut bools) = (false, false, false);
    let (mut strs, mut nulls) = (false, false);
    for value in values {
        match value {
            Value::Null => nulls = true,
            Value::Bool(_) => bools = true,
            Value::Int(_) => ints = true,
            Value::Float(_) => floats = true,
            Value::Str(_) => strs = true,
        }
    }

    if strs || (bools && (ints || floats)) {
        DType::Object
    } else if bools {
        if nulls {
            DType::Object
        } else {
            DType::Bool
        }
    } else if floats || (ints && nulls) {
        DType::Float64
    } else if ints {
        DType::Int64
    } else {
        DType::Object
    }
}

fn cast_values(label: &str, values: &[Value], dtype: DType) -> Result<Vec<Value>> {
    values
        .iter()
        .map(|v| v.cast(dtype))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|reason| {
            ScoringError::invalid_input(format!(
                "column {:?} cannot be cast to {}: {}",
                label, dtype, reason
            ))
        })
}

fn cells_from_json(label: &str, values: &[serde_json::Value]) -> Result<Vec<Value>> {
    values
        .iter()
        .map(|v| {
            Value::from_json(v).ok_or_else(|| {
                ScoringError::invalid_input(format!("column {:?} holds a nested value", label))
            })
        })
        .collect()
}

/// A named column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub dtype: DType,
    pub values: Vec<Value>,
}

impl Column {
    /// Build a column, inferring its dtype from the cells
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        let dtype = infer_dtype(&values);
        let values = if dtype == DType::Float64 {
            values
                .into_iter()
                .map(|v| match v {
                    Value::Int(i) => Value::Float(i as f64),
                    other => other,
                })
                .collect()
        } else {
            values
        };
        Self {
            name: name.into(),
            dtype,
            values,
        }
    }

    /// Build a column with a declared dtype, converting every cell
    pub fn with_dtype(name: impl Into<String>, dtype: DType, values: Vec<Value>) -> Result<Self> {
        let name = name.into();
        let values = cast_values(&name, &values, dtype)?;
        Ok(Self { name, dtype, values })
    }

    /// Copy of this column converted to `dtype`
    pub fn cast(&self, dtype: DType) -> Result<Column> {
        Column::with_dtype(self.name.clone(), dtype, self.values.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A single column of values, optionally named
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub name: Option<String>,
    pub dtype: DType,
    pub values: Vec<Value>,
}

impl Series {
    /// Build a series, inferring its dtype
    pub fn new(name: Option<String>, values: Vec<Value>) -> Self {
        let column = Column::new(String::new(), values);
        Self {
            name,
            dtype: column.dtype,
            values: column.values,
        }
    }

    /// Build a series from a JSON array, or a single scalar
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let values = match value {
            serde_json::Value::Array(items) => cells_from_json("series", items)?,
            other => cells_from_json("series", std::slice::from_ref(other))?,
        };
        Ok(Series::new(None, values))
    }

    /// Key under which the series' dtype is recorded
    pub fn key(&self) -> String {
        self.name.clone().unwrap_or_else(|| "0".to_string())
    }

    /// Copy of this series converted to `dtype`
    pub fn cast(&self, dtype: DType) -> Result<Series> {
        Ok(Series {
            name: self.name.clone(),
            dtype,
            values: cast_values(&self.key(), &self.values, dtype)?,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column vector of shape `[n, 1]`
    pub fn to_ndarray(&self) -> Result<NdArray> {
        let values = numeric_cells(&self.key(), &self.values)?;
        NdArray::new(vec![values.len(), 1], values)
    }
}

/// Columns of equal length in a fixed order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
}

impl Table {
    /// Build a table, checking that all columns have the same length
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        if let Some(first) = columns.first() {
            if let Some(bad) = columns.iter().find(|c| c.len() != first.len()) {
                return Err(ScoringError::invalid_input(format!(
                    "column {:?} has {} rows, expected {}",
                    bad.name,
                    bad.len(),
                    first.len()
                )));
            }
        }
        Ok(Self { columns })
    }

    /// Build a table from row objects; keys absent from a row are null
    pub fn from_records(rows: &[serde_json::Value]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for row in rows {
            let object = row.as_object().ok_or_else(|| {
                ScoringError::invalid_input("table rows must be JSON objects")
            })?;
            for key in object.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }

        let columns = names
            .iter()
            .map(|name| {
                let cells: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| row.get(name).cloned().unwrap_or(serde_json::Value::Null))
                    .collect();
                Ok(Column::new(name.clone(), cells_from_json(name, &cells)?))
            })
            .collect::<Result<Vec<_>>>()?;

        Table::new(columns)
    }

    /// Build a table from a column -> values mapping; scalars are one-row columns
    pub fn from_column_map(map: &Map<String, serde_json::Value>) -> Result<Self> {
        let columns = map
            .iter()
            .map(|(name, value)| {
                let cells = match value {
                    serde_json::Value::Array(items) => cells_from_json(name, items)?,
                    other => cells_from_json(name, std::slice::from_ref(other))?,
                };
                Ok(Column::new(name.clone(), cells))
            })
            .collect::<Result<Vec<_>>>()?;

        Table::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Row-major matrix of shape `[rows, cols]`
    pub fn to_ndarray(&self) -> Result<NdArray> {
        let (rows, cols) = (self.n_rows(), self.n_cols());
        let numeric = self
            .columns
            .iter()
            .map(|c| numeric_cells(&c.name, &c.values))
            .collect::<Result<Vec<_>>>()?;

        let mut values = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            values.extend(numeric.iter().map(|column| column[row]));
        }
        NdArray::new(vec![rows, cols], values)
    }
}

fn numeric_cells(label: &str, values: &[Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            v.to_f32().ok_or_else(|| {
                ScoringError::invalid_input(format!(
                    "column {:?} is not numeric: found {}",
                    label, v
                ))
            })
        })
        .collect()
}

/// Shapes the tabular transformer understands
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Table(Table),
    Series(Series),
}

impl Frame {
    pub fn to_ndarray(&self) -> Result<NdArray> {
        match self {
            Frame::Table(table) => table.to_ndarray(),
            Frame::Series(series) => series.to_ndarray(),
        }
    }
}

/// Dense row-major `f32` array
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NdArray {
    /// Build an array, checking the element count against the shape
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected = shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
            .ok_or_else(|| {
                ScoringError::tensor(format!("shape {:?} overflows the address space", shape))
            })?;
        if expected != values.len() {
            return Err(ScoringError::tensor(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of rows when viewed as a 2-D batch
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }
}

/// A decoded request payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Array(NdArray),
    Tensor(NdArray),
    Series(Series),
    Table(Table),
    Raw(serde_json::Value),
}

impl Payload {
    /// Short name of the payload kind, for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Array(_) => "array",
            Payload::Tensor(_) => "tensor",
            Payload::Series(_) => "series",
            Payload::Table(_) => "table",
            Payload::Raw(_) => "raw",
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Payload::Series(_) | Payload::Table(_))
    }
}

impl From<Frame> for Payload {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Table(table) => Payload::Table(table),
            Frame::Series(series) => Payload::Series(series),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ndarray_rejects_overflowing_shape() {
        let err = NdArray::new(vec![1 << 62, 4], Vec::new()).unwrap_err();
        assert!(matches!(err, ScoringError::Tensor(_)));
        assert!(NdArray::new(vec![2, 0], Vec::new()).is_ok());
    }

    #[test]
    fn test_infer_dtype() {
        assert_eq!(infer_dtype(&[Value::Int(1), Value::Int(2)]), DType::Int64);
        assert_eq!(infer_dtype(&[Value::Int(1), Value::Null]), DType::Float64);
        assert_eq!(infer_dtype(&[Value::Int(1), Value::Float(2.5)]), DType::Float64);
        assert_eq!(
            infer_dtype(&[Value::Int(1), Value::Str("x".into())]),
            DType::Object
        );
        assert_eq!(infer_dtype(&[Value::Bool(true)]), DType::Bool);
        assert_eq!(infer_dtype(&[Value::Null]), DType::Object);
    }

    #[test]
    fn test_dtype_names() {
        assert_eq!("float".parse::<DType>().unwrap(), DType::Float64);
        assert_eq!("category".parse::<DType>().unwrap(), DType::Object);
        assert_eq!(DType::Float32.to_string(), "float32");
        assert!("complex128".parse::<DType>().is_err());
    }

    #[test]
    fn test_cast_to_float32_rounds() {
        let value = Value::Float(0.1).cast(DType::Float32).unwrap();
        assert_eq!(value, Value::Float(0.1f32 as f64));
        assert_eq!(Value::Str(" 2 ".into()).cast(DType::Float32).unwrap(), Value::Float(2.0));
        assert!(Value::Str("abc".into()).cast(DType::Float32).is_err());
    }

    #[test]
    fn test_cast_to_int_rejects_missing() {
        assert!(Value::Null.cast(DType::Int64).is_err());
        assert!(Value::Float(1.5).cast(DType::Int64).is_err());
        assert_eq!(Value::Float(3.0).cast(DType::Int64).unwrap(), Value::Int(3));
        assert!(Value::Int(i64::MAX).cast(DType::Int32).is_err());
    }

    #[test]
    fn test_from_records_preserves_order_and_fills_null() {
        let rows = vec![json!({"b": 1, "a": "x"}), json!({"a": "y", "c": 2.5})];
        let table = Table::from_records(&rows).unwrap();

        assert_eq!(table.column_names(), vec!["b", "a", "c"]);
        assert_eq!(table.n_rows(), 2);
        assert_eq!(table.column("b").unwrap().dtype, DType::Float64);
        assert_eq!(table.column("b").unwrap().values[1], Value::Null);
        assert_eq!(table.column("a").unwrap().dtype, DType::Object);
    }

    #[test]
    fn test_from_column_map_rejects_ragged() {
        let map = json!({"a": [1, 2], "b": [1]});
        assert!(Table::from_column_map(map.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_table_to_ndarray_row_major() {
        let map = json!({"a": [1, 2], "b": [3.5, null]});
        let table = Table::from_column_map(map.as_object().unwrap()).unwrap();
        let array = table.to_ndarray().unwrap();

        assert_eq!(array.shape, vec![2, 2]);
        assert_eq!(array.values[0], 1.0);
        assert_eq!(array.values[1], 3.5);
        assert_eq!(array.values[2], 2.0);
        assert!(array.values[3].is_nan());
    }

    #[test]
    fn test_table_to_ndarray_rejects_strings() {
        let map = json!({"a": ["x"]});
        let table = Table::from_column_map(map.as_object().unwrap()).unwrap();
        assert!(table.to_ndarray().is_err());
    }
}
