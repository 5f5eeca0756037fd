//! Meta-model stacking over OOF predictions
//!
//! Fits a ridge or logistic meta-model on the base models' OOF predictions
//! and applies the resulting linear combination to the aligned submissions.
//! When fold labels are present, one meta-model is fitted per fold (each on
//! the other folds' rows) and the coefficients are averaged, so no row
//! contributes to the coefficients that score it.

use crate::blend::{sigmoid, BlendResult};
use crate::error::{BlendError, Result};
use crate::frame::{AlignedOof, AlignedSubmissions};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Meta-model family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetaModel {
    /// L2-regularized linear regression, closed-form solve
    Ridge,
    /// L2-regularized logistic regression, gradient descent
    Logistic,
}

/// Configuration for the stacking blender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingConfig {
    pub model: MetaModel,
    /// L2 regularization strength
    pub alpha: f64,
    /// Gradient-descent iteration cap (Logistic only)
    pub max_iter: usize,
    /// Gradient-descent learning rate (Logistic only)
    pub learning_rate: f64,
    /// Gradient-norm convergence tolerance (Logistic only)
    pub tol: f64,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            model: MetaModel::Ridge,
            alpha: 1.0,
            max_iter: 1000,
            learning_rate: 0.1,
            tol: 1e-6,
        }
    }
}

impl StackingConfig {
    pub fn with_model(mut self, model: MetaModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }
}

/// Fitted meta-model coefficients, keyed by base model name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackingCoefficients {
    pub model: MetaModel,
    pub weights: BTreeMap<String, f64>,
    pub intercept: f64,
}

/// Stacking blender
pub struct StackingBlender {
    config: StackingConfig,
}

impl StackingBlender {
    pub fn new(config: StackingConfig) -> Self {
        Self { config }
    }

    /// Fit the meta-model on aligned OOF predictions
    pub fn fit(&self, oof: &AlignedOof) -> Result<StackingCoefficients> {
        if oof.n_models() == 0 {
            return Err(BlendError::InsufficientModels(0));
        }
        if oof.targets.iter().any(|t| t.is_nan()) {
            return Err(BlendError::Stacking(
                "target contains missing values".to_string(),
            ));
        }

        let (coef, intercept) = match &oof.folds {
            Some(folds) => self.fit_fold_averaged(oof, folds)?,
            None => self.fit_once(oof.preds.view(), oof.targets.view())?,
        };

        Ok(StackingCoefficients {
            model: self.config.model,
            weights: oof
                .names
                .iter()
                .cloned()
                .zip(coef.iter().copied())
                .collect(),
            intercept,
        })
    }

    /// Apply fitted coefficients to the aligned submissions
    pub fn apply(
        &self,
        coef: &StackingCoefficients,
        subs: &AlignedSubmissions,
    ) -> Result<BlendResult> {
        if subs.n_models() == 0 {
            return Err(BlendError::InsufficientModels(0));
        }
        let w: Array1<f64> = subs
            .names
            .iter()
            .map(|name| {
                coef.weights.get(name).copied().ok_or_else(|| {
                    BlendError::Stacking(format!("no coefficient for model '{}'", name))
                })
            })
            .collect::<Result<Vec<f64>>>()?
            .into();

        let mut preds = subs.preds.dot(&w) + coef.intercept;
        if coef.model == MetaModel::Logistic {
            preds.mapv_inplace(sigmoid);
        }

        Ok(BlendResult {
            ids: subs.ids.clone(),
            preds,
        })
    }

    /// One meta-model per fold, fitted on the other folds' rows, coefficients
    /// averaged. Falls back to a single fit when only one fold exists.
    fn fit_fold_averaged(&self, oof: &AlignedOof, folds: &[i64]) -> Result<(Array1<f64>, f64)> {
        let mut distinct: Vec<i64> = folds.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        if distinct.len() < 2 {
            return self.fit_once(oof.preds.view(), oof.targets.view());
        }

        let mut coef_sum = Array1::zeros(oof.n_models());
        let mut intercept_sum = 0.0;

        for &held_out in &distinct {
            let rows: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(_, &f)| f != held_out)
                .map(|(i, _)| i)
                .collect();
            let x = oof.preds.select(Axis(0), &rows);
            let y: Array1<f64> = rows.iter().map(|&r| oof.targets[r]).collect();
            let (coef, intercept) = self.fit_once(x.view(), y.view())?;
            coef_sum = coef_sum + coef;
            intercept_sum += intercept;
        }

        let k = distinct.len() as f64;
        Ok((coef_sum / k, intercept_sum / k))
    }

    fn fit_once(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(Array1<f64>, f64)> {
        if x.nrows() != y.len() {
            return Err(BlendError::Shape {
                expected: format!("y length = {}", x.nrows()),
                actual: format!("y length = {}", y.len()),
            });
        }
        if x.nrows() < 2 {
            return Err(BlendError::Stacking(
                "too few rows to fit a meta-model".to_string(),
            ));
        }

        match self.config.model {
            MetaModel::Ridge => self.fit_ridge(x, y),
            MetaModel::Logistic => self.fit_logistic(x, y),
        }
    }

    /// Ridge via centered normal equations
    fn fit_ridge(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(Array1<f64>, f64)> {
        let x_mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| BlendError::Stacking("empty feature matrix".to_string()))?;
        let y_mean = y.mean().unwrap_or(0.0);

        let x_c = &x - &x_mean.clone().insert_axis(Axis(0));
        let y_c = &y - y_mean;

        let mut xtx = x_c.t().dot(&x_c);
        for i in 0..xtx.nrows() {
            xtx[[i, i]] += self.config.alpha;
        }
        let xty = x_c.t().dot(&y_c);

        let coef = solve_spd(&xtx, &xty)
            .ok_or_else(|| BlendError::Stacking("singular meta-feature matrix".to_string()))?;
        let intercept = y_mean - coef.dot(&x_mean);

        Ok((coef, intercept))
    }

    /// Logistic via batch gradient descent with L2 penalty
    fn fit_logistic(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(Array1<f64>, f64)> {
        let has_pos = y.iter().any(|&t| t > 0.5);
        let has_neg = y.iter().any(|&t| t <= 0.5);
        if !has_pos || !has_neg {
            return Err(BlendError::Stacking(
                "degenerate target: a single class cannot be fit".to_string(),
            ));
        }

        let n_samples = x.nrows() as f64;
        let mut weights: Array1<f64> = Array1::zeros(x.ncols());
        let mut bias = 0.0;

        for _ in 0..self.config.max_iter {
            let linear = x.dot(&weights) + bias;
            let probs = linear.mapv(sigmoid);
            let errors = &probs - &y;

            let dw = x.t().dot(&errors) / n_samples + &(self.config.alpha * &weights);
            let db = errors.mean().unwrap_or(0.0);

            let grad_norm = (dw.mapv(|v| v * v).sum() + db * db).sqrt();
            if grad_norm < self.config.tol {
                break;
            }

            weights = weights - self.config.learning_rate * &dw;
            bias -= self.config.learning_rate * db;
        }

        Ok((weights, bias))
    }
}

/// Solve a symmetric positive-definite system via Cholesky, falling back to
/// Gauss-Jordan elimination when the decomposition fails.
fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    cholesky_solve(a, b).or_else(|| gauss_solve(a, b))
}

fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[[i, k]] * l[[j, k]]).sum();
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward then backward substitution
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let sum: f64 = (0..i).map(|j| l[[i, j]] * y[j]).sum();
        y[i] = (b[i] - sum) / l[[i, i]];
    }
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let sum: f64 = ((i + 1)..n).map(|j| l[[j, i]] * x[j]).sum();
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Some(x)
}

fn gauss_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut aug = Array2::zeros((n, n + 1));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = a[[i, j]];
        }
        aug[[i, n]] = b[i];
    }

    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if aug[[row, col]].abs() > aug[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if aug[[pivot, col]].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for j in 0..=n {
                let tmp = aug[[col, j]];
                aug[[col, j]] = aug[[pivot, j]];
                aug[[pivot, j]] = tmp;
            }
        }
        let scale = aug[[col, col]];
        for j in 0..=n {
            aug[[col, j]] /= scale;
        }
        for row in 0..n {
            if row != col {
                let factor = aug[[row, col]];
                for j in 0..=n {
                    aug[[row, j]] -= factor * aug[[col, j]];
                }
            }
        }
    }

    Some(Array1::from_iter((0..n).map(|i| aug[[i, n]])))
}
