//! Scoring of predictions against true labels

use crate::error::{BlendError, Result};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported evaluation metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Metric {
    /// Area under the ROC curve (ranking quality, higher is better)
    Auc,
    /// Mean squared error
    Mse,
    /// Mean absolute error
    Mae,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Auc => "auc",
            Metric::Mse => "mse",
            Metric::Mae => "mae",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = BlendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auc" => Ok(Metric::Auc),
            "mse" => Ok(Metric::Mse),
            "mae" => Ok(Metric::Mae),
            other => Err(BlendError::UnsupportedMetric(other.to_string())),
        }
    }
}

/// Score predictions against true labels.
///
/// AUC returns NaN when the labels contain fewer than one positive and one
/// negative example. MSE and MAE reject missing (NaN) values.
pub fn score(metric: Metric, y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> Result<f64> {
    if y_true.len() != y_pred.len() {
        return Err(BlendError::Shape {
            expected: format!("y_pred length = {}", y_true.len()),
            actual: format!("y_pred length = {}", y_pred.len()),
        });
    }
    if y_true.is_empty() {
        return Err(BlendError::Data("cannot score empty arrays".to_string()));
    }

    match metric {
        Metric::Auc => Ok(auc(y_true, y_pred)),
        Metric::Mse => {
            require_no_missing(y_true, y_pred)?;
            let sum: f64 = y_true
                .iter()
                .zip(y_pred.iter())
                .map(|(&t, &p)| (t - p) * (t - p))
                .sum();
            Ok(sum / y_true.len() as f64)
        }
        Metric::Mae => {
            require_no_missing(y_true, y_pred)?;
            let sum: f64 = y_true
                .iter()
                .zip(y_pred.iter())
                .map(|(&t, &p)| (t - p).abs())
                .sum();
            Ok(sum / y_true.len() as f64)
        }
    }
}

fn require_no_missing(y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> Result<()> {
    if y_true.iter().chain(y_pred.iter()).any(|v| v.is_nan()) {
        return Err(BlendError::Data(
            "metric does not accept missing values".to_string(),
        ));
    }
    Ok(())
}

/// AUC via the rank-sum (Mann-Whitney) formulation with average ranks for ties
fn auc(y_true: ArrayView1<f64>, y_pred: ArrayView1<f64>) -> f64 {
    let n_pos = y_true.iter().filter(|&&t| t > 0.5).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }

    let preds: Vec<f64> = y_pred.iter().copied().collect();
    let ranks = average_ranks(&preds);

    let pos_rank_sum: f64 = y_true
        .iter()
        .zip(ranks.iter())
        .filter(|(&t, _)| t > 0.5)
        .map(|(_, &r)| r)
        .sum();

    let np = n_pos as f64;
    let nn = n_neg as f64;
    (pos_rank_sum - np * (np + 1.0) / 2.0) / (np * nn)
}

/// Average (fractional) 1-based ranks, ties averaged. Only finite values are
/// ranked; NaN inputs keep a NaN rank so they propagate downstream.
pub(crate) fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).filter(|&i| !values[i].is_nan()).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![f64::NAN; n];
    let m = order.len();
    let mut i = 0;
    while i < m {
        let mut j = i;
        while j + 1 < m && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        // 1-based ranks i+1..=j+1 averaged across the tie group
        let avg = (i + j + 2) as f64 / 2.0;
        for k in i..=j {
            ranks[order[k]] = avg;
        }
        i = j + 1;
    }
    ranks
}
