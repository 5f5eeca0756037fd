//! Per-model OOF metrics and the methods comparison table

use crate::frame::ModelTable;
use crate::scoring::{score, Metric};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OOF metrics for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OofMetrics {
    /// Score over all rows (NaN when the model lacks a usable target pairing)
    pub overall: f64,
    /// Per-fold scores, keyed by fold label
    pub fold_scores: BTreeMap<i64, f64>,
    pub n_folds: usize,
}

/// One row of the comparison table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRow {
    pub model: String,
    pub overall_oof: f64,
    /// Mean of finite fold scores (NaN when no fold is scoreable)
    pub mean_fold: f64,
    pub n_folds: usize,
}

/// Comparison table, one row per model in first-seen order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsTable {
    pub rows: Vec<MetricsRow>,
}

impl MetricsTable {
    pub fn from_metrics(metrics: &[(String, OofMetrics)]) -> Self {
        let rows = metrics
            .iter()
            .map(|(name, m)| MetricsRow {
                model: name.clone(),
                overall_oof: m.overall,
                mean_fold: finite_mean(m.fold_scores.values().copied()),
                n_folds: m.n_folds,
            })
            .collect();
        Self { rows }
    }

    /// Overall score of a model, NaN when unknown
    pub fn overall_score(&self, model: &str) -> f64 {
        self.rows
            .iter()
            .find(|r| r.model == model)
            .map(|r| r.overall_oof)
            .unwrap_or(f64::NAN)
    }

    /// Model with the maximum overall OOF score, ties broken by first-seen
    /// order. NaN rows never win; None when no row has a finite score.
    pub fn best_model(&self) -> Option<&str> {
        let mut best: Option<(&str, f64)> = None;
        for row in &self.rows {
            if row.overall_oof.is_nan() {
                continue;
            }
            match best {
                Some((_, s)) if row.overall_oof <= s => {}
                _ => best = Some((&row.model, row.overall_oof)),
            }
        }
        best.map(|(name, _)| name)
    }
}

/// Compute OOF metrics for each model table.
///
/// Models without a usable target pairing get NaN scores rather than failing
/// the whole aggregation.
pub fn compute_oof_metrics(tables: &[ModelTable], metric: Metric) -> Vec<(String, OofMetrics)> {
    tables
        .iter()
        .map(|table| (table.name.clone(), model_metrics(table, metric)))
        .collect()
}

fn model_metrics(table: &ModelTable, metric: Metric) -> OofMetrics {
    let targets = match &table.targets {
        Some(t) if t.len() == table.preds.len() => t,
        _ => {
            return OofMetrics {
                overall: f64::NAN,
                fold_scores: BTreeMap::new(),
                n_folds: 0,
            }
        }
    };

    let overall = score(metric, targets.view(), table.preds.view()).unwrap_or(f64::NAN);

    let mut fold_scores = BTreeMap::new();
    if let Some(folds) = &table.folds {
        let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (row, &fold) in folds.iter().enumerate() {
            groups.entry(fold).or_default().push(row);
        }
        for (fold, rows) in groups {
            let y: Array1<f64> = rows.iter().map(|&r| targets[r]).collect();
            let p: Array1<f64> = rows.iter().map(|&r| table.preds[r]).collect();
            let s = score(metric, y.view(), p.view()).unwrap_or(f64::NAN);
            fold_scores.insert(fold, s);
        }
    }

    OofMetrics {
        overall,
        n_folds: fold_scores.len(),
        fold_scores,
    }
}

/// Mean over finite values, NaN when there are none
pub(crate) fn finite_mean(values: impl Iterator<Item = f64>) -> f64 {
    let finite: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        f64::NAN
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    }
}
