//! Tabular transformer applied before ONNX inference
//!
//! `fit` records an ONNX-friendly dtype for every column (integers and floats
//! become `float32`) together with per-column fill values. `transform`
//! re-applies those dtypes to new inputs and imputes missing or blank cells.

mod sidecar;

use crate::table::{Column, DType, Frame, Payload, Series, Table, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use tabscore_common::{Result, ScoringError};
use tracing::debug;

/// Column selector for imputation
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnKey {
    /// Zero-based column position
    Position(usize),
    /// Column name
    Label(String),
}

impl ColumnKey {
    /// Canonical all-digit keys are positions, anything else is a label
    pub fn parse(key: &str) -> Self {
        let canonical = key == "0" || !key.starts_with('0');
        if canonical && !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(position) = key.parse() {
                return ColumnKey::Position(position);
            }
        }
        ColumnKey::Label(key.to_string())
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKey::Position(i) => write!(f, "{}", i),
            ColumnKey::Label(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ColumnKey {
    fn from(label: &str) -> Self {
        ColumnKey::Label(label.to_string())
    }
}

impl From<usize> for ColumnKey {
    fn from(position: usize) -> Self {
        ColumnKey::Position(position)
    }
}

/// Fill values keyed by column
pub type ImputeValues = BTreeMap<ColumnKey, Value>;

/// Column name to dtype, in column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DtypeMap(Vec<(String, DType)>);

impl DtypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the dtype of a column
    pub fn insert(&mut self, name: impl Into<String>, dtype: DType) {
        let name = name.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = dtype,
            None => self.0.push((name, dtype)),
        }
    }

    pub fn get(&self, name: &str) -> Option<DType> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, d)| *d)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DType)> {
        self.0.iter().map(|(n, d)| (n.as_str(), *d))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, DType)> for DtypeMap {
    fn from_iter<I: IntoIterator<Item = (String, DType)>>(iter: I) -> Self {
        let mut map = DtypeMap::new();
        for (name, dtype) in iter {
            map.insert(name, dtype);
        }
        map
    }
}

/// Dtype coercion and imputation fitted on reference data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OnnxTransformer {
    impute_values: Option<ImputeValues>,
    dtypes: DtypeMap,
    fitted: bool,
}

fn onnx_dtype(dtype: DType) -> DType {
    if dtype.is_numeric() {
        DType::Float32
    } else {
        dtype
    }
}

impl OnnxTransformer {
    /// Create an unfitted transformer
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn dtypes(&self) -> &DtypeMap {
        &self.dtypes
    }

    pub fn impute_values(&self) -> Option<&ImputeValues> {
        self.impute_values.as_ref()
    }

    /// Record column dtypes and fill values from reference data.
    ///
    /// Impute keys are stored as given and are not checked against columns.
    pub fn fit(&mut self, frame: &Frame, impute_values: Option<ImputeValues>) -> &mut Self {
        self.dtypes = match frame {
            Frame::Table(table) => table
                .columns()
                .iter()
                .map(|c| (c.name.clone(), onnx_dtype(c.dtype)))
                .collect(),
            Frame::Series(series) => {
                std::iter::once((series.key(), onnx_dtype(series.dtype))).collect()
            }
        };
        self.impute_values = impute_values;
        self.fitted = true;

        debug!(
            columns = self.dtypes.len(),
            impute_keys = self.impute_values.as_ref().map_or(0, BTreeMap::len),
            "Transformer fitted"
        );
        self
    }

    /// Apply the fitted dtypes and fill values to an input frame.
    ///
    /// The input is left untouched; a new frame is returned.
    pub fn transform(&self, payload: &Payload) -> Result<Frame> {
        if !self.fitted {
            return Err(ScoringError::NotFitted);
        }

        match payload {
            Payload::Table(table) => self.transform_table(table).map(Frame::Table),
            Payload::Series(series) => self.transform_series(series).map(Frame::Series),
            other => Err(ScoringError::unsupported(format!(
                "transform is not implemented for {} payloads",
                other.kind()
            ))),
        }
    }

    fn transform_table(&self, table: &Table) -> Result<Table> {
        let missing = self
            .dtypes
            .iter()
            .find(|(name, _)| table.column(name).is_none());
        if let Some((missing, _)) = missing {
            return Err(ScoringError::invalid_input(format!(
                "column {:?} seen at fit time is missing from the input",
                missing
            )));
        }

        let mut columns = table
            .columns()
            .iter()
            .map(|column| match self.dtypes.get(&column.name) {
                Some(dtype) if dtype != column.dtype => column.cast(dtype).map(Cow::Owned),
                _ => Ok(Cow::Borrowed(column)),
            })
            .collect::<Result<Vec<Cow<'_, Column>>>>()?;

        for (key, fill) in self.impute_values.iter().flatten() {
            // A position that is also a column name selects that column
            let index = match key {
                ColumnKey::Position(i) => {
                    let name = i.to_string();
                    columns
                        .iter()
                        .position(|c| c.name == name)
                        .or_else(|| (*i < columns.len()).then_some(*i))
                }
                ColumnKey::Label(name) => columns.iter().position(|c| &c.name == name),
            }
            .ok_or_else(|| unknown_impute_key(key))?;

            if needs_fill(&columns[index].values) {
                let column = columns[index].to_mut();
                fill_missing(&mut column.dtype, &mut column.values, fill);
            }
        }

        Table::new(columns.into_iter().map(Cow::into_owned).collect())
    }

    fn transform_series(&self, series: &Series) -> Result<Series> {
        let impute = self.impute_values.as_ref();
        if impute.map_or(0, BTreeMap::len) > 1 {
            return Err(ScoringError::usage(
                "X has only one dim: a series accepts a single impute value",
            ));
        }

        let mut series = match self.dtypes.len() {
            0 => Cow::Borrowed(series),
            1 => match self.dtypes.iter().next() {
                Some((_, dtype)) if dtype != series.dtype => Cow::Owned(series.cast(dtype)?),
                _ => Cow::Borrowed(series),
            },
            n => {
                return Err(ScoringError::invalid_input(format!(
                    "transformer was fitted on {} columns but received a series",
                    n
                )))
            }
        };

        if let Some(fill) = impute.and_then(|m| m.values().next()) {
            if needs_fill(&series.values) {
                let series = series.to_mut();
                fill_missing(&mut series.dtype, &mut series.values, fill);
            }
        }

        Ok(series.into_owned())
    }
}

fn unknown_impute_key(key: &ColumnKey) -> ScoringError {
    ScoringError::invalid_input(format!("impute key {:?} matches no column", key.to_string()))
}

fn needs_fill(values: &[Value]) -> bool {
    values.iter().any(|v| v.is_blank() || v.is_missing())
}

/// Blank strings become missing, then missing cells take `fill`.
/// A fill that does not fit the column dtype demotes the column to object.
fn fill_missing(dtype: &mut DType, values: &mut [Value], fill: &Value) {
    let fill = match fill.cast(*dtype) {
        Ok(fill) => fill,
        Err(_) => {
            *dtype = DType::Object;
            fill.clone()
        }
    };

    for value in values.iter_mut() {
        if value.is_blank() {
            *value = Value::Null;
        }
        if value.is_missing() {
            *value = fill.clone();
        }
    }
}
