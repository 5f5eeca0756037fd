//! Deterministic blending of aligned submissions

use crate::error::{BlendError, Result};
use crate::frame::{align_submissions, AlignedSubmissions, IdValue, ModelTable};
use crate::metrics::MetricsTable;
use crate::scoring::average_ranks;
use ndarray::{Array1, Array2, ArrayView2};
use polars::prelude::{Column, DataFrame};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const LOGIT_EPS: f64 = 1e-6;

/// Blending method identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BlendMethod {
    /// Elementwise arithmetic mean
    Mean,
    /// Mean of fractional ranks (ties averaged)
    RankMean,
    /// Mean in log-odds space
    LogitMean,
    /// Submission of the best OOF model, unchanged
    BestSingle,
    /// Weighted sum with an optimized weight vector
    Weighted,
}

impl BlendMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlendMethod::Mean => "mean",
            BlendMethod::RankMean => "rank_mean",
            BlendMethod::LogitMean => "logit_mean",
            BlendMethod::BestSingle => "best_single",
            BlendMethod::Weighted => "weight_opt",
        }
    }

    /// The parameter-free methods, in their canonical order
    pub fn parameter_free() -> Vec<BlendMethod> {
        vec![
            BlendMethod::Mean,
            BlendMethod::RankMean,
            BlendMethod::LogitMean,
            BlendMethod::BestSingle,
        ]
    }
}

impl fmt::Display for BlendMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlendMethod {
    type Err = BlendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(BlendMethod::Mean),
            "rank_mean" => Ok(BlendMethod::RankMean),
            "logit_mean" => Ok(BlendMethod::LogitMean),
            "best_single" => Ok(BlendMethod::BestSingle),
            "weight_opt" => Ok(BlendMethod::Weighted),
            other => Err(BlendError::Validation(format!(
                "unknown blend method '{}'",
                other
            ))),
        }
    }
}

/// Non-negative per-model weights summing to one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightVector(pub BTreeMap<String, f64>);

impl WeightVector {
    pub fn uniform(names: &[String]) -> Self {
        let w = 1.0 / names.len().max(1) as f64;
        Self(names.iter().map(|n| (n.clone(), w)).collect())
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    /// Check non-negativity and unit sum within tolerance
    pub fn is_simplex(&self, tol: f64) -> bool {
        self.0.values().all(|&w| w >= -tol)
            && (self.0.values().sum::<f64>() - 1.0).abs() <= tol
    }
}

/// A blended prediction table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendResult {
    pub ids: Vec<IdValue>,
    pub preds: Array1<f64>,
}

impl BlendResult {
    /// Render as an `id`/`pred` DataFrame for the reporting layer
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let id_col = if self.ids.iter().all(|id| matches!(id, IdValue::Int(_))) {
            let ints: Vec<i64> = self
                .ids
                .iter()
                .map(|id| match id {
                    IdValue::Int(v) => *v,
                    IdValue::Str(_) => unreachable!(),
                })
                .collect();
            Column::new("id".into(), ints)
        } else {
            let strs: Vec<String> = self.ids.iter().map(|id| id.to_string()).collect();
            Column::new("id".into(), strs)
        };
        let pred_col = Column::new("pred".into(), self.preds.to_vec());
        Ok(DataFrame::new(vec![id_col, pred_col])?)
    }
}

/// Elementwise arithmetic mean across models
pub fn blend_mean(subs: &AlignedSubmissions) -> Result<BlendResult> {
    require_models(subs)?;
    Ok(BlendResult {
        ids: subs.ids.clone(),
        preds: mean_columns(subs.preds.view()),
    })
}

/// Mean of per-model fractional ranks
pub fn blend_rank_mean(subs: &AlignedSubmissions) -> Result<BlendResult> {
    require_models(subs)?;
    Ok(BlendResult {
        ids: subs.ids.clone(),
        preds: rank_mean_columns(subs.preds.view()),
    })
}

/// Mean in log-odds space, clipped to avoid infinities
pub fn blend_logit_mean(subs: &AlignedSubmissions) -> Result<BlendResult> {
    require_models(subs)?;
    Ok(BlendResult {
        ids: subs.ids.clone(),
        preds: logit_mean_columns(subs.preds.view()),
    })
}

/// Submission of the model with the maximum overall OOF score, unchanged
pub fn blend_best_single(
    subs: &AlignedSubmissions,
    metrics: &MetricsTable,
) -> Result<BlendResult> {
    require_models(subs)?;
    let best = metrics
        .best_model()
        .ok_or_else(|| BlendError::Data("no model has a finite OOF score".to_string()))?;
    let col = subs.model_index(best).ok_or_else(|| {
        BlendError::Data(format!("best model '{}' has no submission", best))
    })?;
    Ok(BlendResult {
        ids: subs.ids.clone(),
        preds: subs.preds.column(col).to_owned(),
    })
}

/// Weighted sum of submissions.
///
/// Zero-weight models are dropped before alignment, so they do not constrain
/// the id join.
pub fn blend_weighted(tables: &[ModelTable], weights: &WeightVector) -> Result<BlendResult> {
    let active: Vec<ModelTable> = tables
        .iter()
        .filter(|t| weights.get(&t.name) > 0.0)
        .cloned()
        .collect();
    if active.is_empty() {
        return Err(BlendError::InsufficientModels(0));
    }

    let subs = align_submissions(&active)?;
    let w: Array1<f64> = subs.names.iter().map(|n| weights.get(n)).collect();
    Ok(BlendResult {
        ids: subs.ids.clone(),
        preds: subs.preds.dot(&w),
    })
}

// Matrix kernels shared with the optimizer and the stability analyzer.

pub(crate) fn mean_columns(preds: ArrayView2<f64>) -> Array1<f64> {
    let n_models = preds.ncols() as f64;
    preds.rows().into_iter().map(|r| r.sum() / n_models).collect()
}

pub(crate) fn rank_mean_columns(preds: ArrayView2<f64>) -> Array1<f64> {
    let n_rows = preds.nrows();
    let mut ranked = Array2::zeros((n_rows, preds.ncols()));
    for (c, col) in preds.columns().into_iter().enumerate() {
        let values: Vec<f64> = col.iter().copied().collect();
        let ranks = average_ranks(&values);
        let n_ranked = ranks.iter().filter(|r| !r.is_nan()).count().max(1) as f64;
        for (r, rank) in ranks.into_iter().enumerate() {
            // fractional rank in (0, 1]; NaN inputs stay NaN
            ranked[[r, c]] = rank / n_ranked;
        }
    }
    mean_columns(ranked.view())
}

pub(crate) fn logit_mean_columns(preds: ArrayView2<f64>) -> Array1<f64> {
    let n_models = preds.ncols() as f64;
    preds
        .rows()
        .into_iter()
        .map(|row| {
            let logit_sum: f64 = row
                .iter()
                .map(|&p| {
                    let clipped = p.clamp(LOGIT_EPS, 1.0 - LOGIT_EPS);
                    (clipped / (1.0 - clipped)).ln()
                })
                .sum();
            sigmoid(logit_sum / n_models)
        })
        .collect()
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn require_models(subs: &AlignedSubmissions) -> Result<()> {
    if subs.n_models() == 0 {
        return Err(BlendError::InsufficientModels(0));
    }
    Ok(())
}
