//! Schema-checked model tables and ID alignment
//!
//! The excluded I/O layer hands the core one `polars::DataFrame` per model.
//! Everything here validates those frames at the boundary (missing columns
//! become typed [`BlendError::Schema`] values) and converts them into the
//! ndarray-backed structures the rest of the engine computes on.

use crate::error::{BlendError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Row identifier — any orderable key type supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(v) => write!(f, "{}", v),
            IdValue::Str(v) => f.write_str(v),
        }
    }
}

/// One model's prediction table, validated and extracted from a DataFrame
#[derive(Debug, Clone)]
pub struct ModelTable {
    pub name: String,
    pub ids: Vec<IdValue>,
    pub preds: Array1<f64>,
    /// CV partition labels, when the table carries a `fold` column
    pub folds: Option<Vec<i64>>,
    /// True labels, required for OOF tables (absence degrades to NaN metrics)
    pub targets: Option<Array1<f64>>,
    /// Row timestamps, when the table carries a `timestamp` column
    pub times: Option<Vec<NaiveDateTime>>,
}

impl ModelTable {
    /// Build an OOF table. Requires `id` and `pred`; reads the target column,
    /// and the optional `fold` and `timestamp` columns when present.
    pub fn from_oof_frame(name: &str, df: &DataFrame, target_col: &str) -> Result<Self> {
        let ids = id_column(df, name)?;
        let preds = f64_column(df, "pred", name)?;
        check_unique_ids(&ids, name)?;

        let targets = if has_column(df, target_col) {
            Some(f64_column(df, target_col, name)?)
        } else {
            warn!(
                model = name,
                target = target_col,
                "OOF table has no target column; metrics will be NaN"
            );
            None
        };

        let folds = if has_column(df, "fold") {
            Some(i64_column(df, "fold", name)?)
        } else {
            None
        };

        let times = if has_column(df, "timestamp") {
            Some(time_column(df, "timestamp", name)?)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            ids,
            preds,
            folds,
            targets,
            times,
        })
    }

    /// Build a submission table. Requires `id` and `pred` only.
    pub fn from_submission_frame(name: &str, df: &DataFrame) -> Result<Self> {
        let ids = id_column(df, name)?;
        let preds = f64_column(df, "pred", name)?;
        check_unique_ids(&ids, name)?;

        Ok(Self {
            name: name.to_string(),
            ids,
            preds,
            folds: None,
            targets: None,
            times: None,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Submission tables restricted to the shared id set, sorted ascending by id.
///
/// `preds` is rows × models, column order matching `names`.
#[derive(Debug, Clone)]
pub struct AlignedSubmissions {
    pub ids: Vec<IdValue>,
    pub names: Vec<String>,
    pub preds: Array2<f64>,
}

impl AlignedSubmissions {
    pub fn n_models(&self) -> usize {
        self.names.len()
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    /// Column index of a model by name
    pub fn model_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// OOF tables joined on the shared id set, with the target (and optional fold
/// and timestamp labels) taken from the first table that provides them.
#[derive(Debug, Clone)]
pub struct AlignedOof {
    pub ids: Vec<IdValue>,
    pub names: Vec<String>,
    pub preds: Array2<f64>,
    pub targets: Array1<f64>,
    pub folds: Option<Vec<i64>>,
    pub times: Option<Vec<NaiveDateTime>>,
}

impl AlignedOof {
    pub fn n_models(&self) -> usize {
        self.names.len()
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    /// Restrict to a row subset (used for per-window stability scoring)
    pub fn select_rows(&self, rows: &[usize]) -> AlignedOof {
        let ids = rows.iter().map(|&r| self.ids[r].clone()).collect();
        let preds = Array2::from_shape_fn((rows.len(), self.n_models()), |(r, c)| {
            self.preds[[rows[r], c]]
        });
        let targets = Array1::from_iter(rows.iter().map(|&r| self.targets[r]));
        let folds = self
            .folds
            .as_ref()
            .map(|f| rows.iter().map(|&r| f[r]).collect());
        let times = self
            .times
            .as_ref()
            .map(|t| rows.iter().map(|&r| t[r]).collect());

        AlignedOof {
            ids,
            names: self.names.clone(),
            preds,
            targets,
            folds,
            times,
        }
    }

    /// Restrict to a subset of models, preserving the given order
    pub fn select_models(&self, names: &[String]) -> Result<AlignedOof> {
        let cols: Vec<usize> = names
            .iter()
            .map(|n| {
                self.names
                    .iter()
                    .position(|m| m == n)
                    .ok_or_else(|| BlendError::Data(format!("unknown model '{}'", n)))
            })
            .collect::<Result<Vec<usize>>>()?;

        let preds = Array2::from_shape_fn((self.n_rows(), cols.len()), |(r, c)| {
            self.preds[[r, cols[c]]]
        });

        Ok(AlignedOof {
            ids: self.ids.clone(),
            names: names.to_vec(),
            preds,
            targets: self.targets.clone(),
            folds: self.folds.clone(),
            times: self.times.clone(),
        })
    }
}

/// Align submission tables by id intersection, warning on mismatch.
pub fn align_submissions(tables: &[ModelTable]) -> Result<AlignedSubmissions> {
    if tables.is_empty() {
        return Err(BlendError::InsufficientModels(0));
    }

    let common = common_ids(tables)?;
    let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    let preds = gather_preds(tables, &common)?;

    Ok(AlignedSubmissions {
        ids: common,
        names,
        preds,
    })
}

/// Align OOF tables by id intersection and attach target/fold/time labels.
pub fn align_oof(tables: &[ModelTable]) -> Result<AlignedOof> {
    if tables.is_empty() {
        return Err(BlendError::InsufficientModels(0));
    }

    let common = common_ids(tables)?;
    let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    let preds = gather_preds(tables, &common)?;

    // Targets come from the first table that carries them
    let (target_source, target_values) = tables
        .iter()
        .find_map(|t| t.targets.as_ref().map(|v| (t, v)))
        .ok_or_else(|| BlendError::Data("no OOF table provides a target column".to_string()))?;
    let targets = gather_rows_f64(target_source, target_values.view(), &common)?;

    let folds = match tables.iter().find_map(|t| t.folds.as_ref().map(|v| (t, v))) {
        Some((src, values)) => Some(gather_rows(src, values, &common)?),
        None => None,
    };
    let times = match tables.iter().find_map(|t| t.times.as_ref().map(|v| (t, v))) {
        Some((src, values)) => Some(gather_rows(src, values, &common)?),
        None => None,
    };

    Ok(AlignedOof {
        ids: common,
        names,
        preds,
        targets,
        folds,
        times,
    })
}

/// Sorted intersection of all tables' id sets; warns when ids are dropped.
fn common_ids(tables: &[ModelTable]) -> Result<Vec<IdValue>> {
    let mut union: BTreeSet<IdValue> = BTreeSet::new();
    let mut common: Option<BTreeSet<IdValue>> = None;

    for table in tables {
        let ids: BTreeSet<IdValue> = table.ids.iter().cloned().collect();
        union.extend(ids.iter().cloned());
        common = Some(match common {
            None => ids,
            Some(acc) => acc.intersection(&ids).cloned().collect(),
        });
    }

    let common = common.unwrap_or_default();
    if common.is_empty() {
        return Err(BlendError::Data(
            "no common ids across model tables".to_string(),
        ));
    }
    if common.len() < union.len() {
        warn!(
            total_ids = union.len(),
            common_ids = common.len(),
            "ID mismatch between model tables; falling back to intersection"
        );
    }

    Ok(common.into_iter().collect())
}

/// Per-model prediction matrix over a shared id sequence (rows × models)
fn gather_preds(tables: &[ModelTable], ids: &[IdValue]) -> Result<Array2<f64>> {
    let mut preds = Array2::zeros((ids.len(), tables.len()));
    for (col, table) in tables.iter().enumerate() {
        let lookup: BTreeMap<&IdValue, f64> = table
            .ids
            .iter()
            .zip(table.preds.iter())
            .map(|(id, &p)| (id, p))
            .collect();
        for (row, id) in ids.iter().enumerate() {
            let value = lookup.get(id).ok_or_else(|| {
                BlendError::Data(format!("model '{}' is missing id {}", table.name, id))
            })?;
            preds[[row, col]] = *value;
        }
    }
    Ok(preds)
}

fn gather_rows_f64(
    table: &ModelTable,
    values: ndarray::ArrayView1<f64>,
    ids: &[IdValue],
) -> Result<Array1<f64>> {
    let lookup: BTreeMap<&IdValue, f64> = table
        .ids
        .iter()
        .zip(values.iter())
        .map(|(id, &v)| (id, v))
        .collect();
    ids.iter()
        .map(|id| {
            lookup.get(id).copied().ok_or_else(|| {
                BlendError::Data(format!("model '{}' is missing id {}", table.name, id))
            })
        })
        .collect::<Result<Vec<f64>>>()
        .map(Array1::from_vec)
}

fn gather_rows<T: Clone>(table: &ModelTable, values: &[T], ids: &[IdValue]) -> Result<Vec<T>> {
    let lookup: BTreeMap<&IdValue, &T> = table.ids.iter().zip(values.iter()).collect();
    ids.iter()
        .map(|id| {
            lookup.get(id).map(|v| (*v).clone()).ok_or_else(|| {
                BlendError::Data(format!("model '{}' is missing id {}", table.name, id))
            })
        })
        .collect()
}

fn check_unique_ids(ids: &[IdValue], model: &str) -> Result<()> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(BlendError::Schema(format!(
                "model '{}': duplicate id {}",
                model, id
            )));
        }
    }
    Ok(())
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

fn f64_column(df: &DataFrame, name: &str, model: &str) -> Result<Array1<f64>> {
    let series = required_column(df, name, model)?;
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|e| BlendError::Data(format!("model '{}', column '{}': {}", model, name, e)))?;
    let values: Vec<f64> = casted
        .f64()
        .map_err(|e| BlendError::Data(e.to_string()))?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    Ok(Array1::from_vec(values))
}

fn i64_column(df: &DataFrame, name: &str, model: &str) -> Result<Vec<i64>> {
    let series = required_column(df, name, model)?;
    let casted = series
        .cast(&DataType::Int64)
        .map_err(|e| BlendError::Data(format!("model '{}', column '{}': {}", model, name, e)))?;
    casted
        .i64()
        .map_err(|e| BlendError::Data(e.to_string()))?
        .into_iter()
        .map(|v| {
            v.ok_or_else(|| {
                BlendError::Data(format!("model '{}', column '{}': null value", model, name))
            })
        })
        .collect()
}

fn id_column(df: &DataFrame, model: &str) -> Result<Vec<IdValue>> {
    let series = required_column(df, "id", model)?;
    match series.dtype() {
        dt if dt.is_integer() => Ok(i64_column(df, "id", model)?
            .into_iter()
            .map(IdValue::Int)
            .collect()),
        DataType::String => series
            .str()
            .map_err(|e| BlendError::Data(e.to_string()))?
            .into_iter()
            .map(|v| {
                v.map(|s| IdValue::Str(s.to_string())).ok_or_else(|| {
                    BlendError::Data(format!("model '{}': null id value", model))
                })
            })
            .collect(),
        other => Err(BlendError::Schema(format!(
            "model '{}': id column has unsupported dtype {}",
            model, other
        ))),
    }
}

fn time_column(df: &DataFrame, name: &str, model: &str) -> Result<Vec<NaiveDateTime>> {
    let series = required_column(df, name, model)?;
    match series.dtype() {
        DataType::String => series
            .str()
            .map_err(|e| BlendError::Data(e.to_string()))?
            .into_iter()
            .map(|v| {
                let raw = v.ok_or_else(|| {
                    BlendError::Data(format!("model '{}': null timestamp", model))
                })?;
                parse_timestamp(raw)
            })
            .collect(),
        dt if dt.is_integer() => i64_column(df, name, model)?
            .into_iter()
            .map(|secs| {
                DateTime::from_timestamp(secs, 0)
                    .map(|dt| dt.naive_utc())
                    .ok_or_else(|| {
                        BlendError::Data(format!(
                            "model '{}': epoch timestamp {} out of range",
                            model, secs
                        ))
                    })
            })
            .collect(),
        other => Err(BlendError::Schema(format!(
            "model '{}': timestamp column has unsupported dtype {}",
            model, other
        ))),
    }
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN))
        .map_err(|_| BlendError::Data(format!("unparseable timestamp '{}'", raw)))
}

fn required_column<'a>(df: &'a DataFrame, name: &str, model: &str) -> Result<&'a Series> {
    df.column(name)
        .map(|c| c.as_materialized_series())
        .map_err(|_| {
            BlendError::Schema(format!(
                "model '{}': missing required column '{}'",
                model, name
            ))
        })
}
