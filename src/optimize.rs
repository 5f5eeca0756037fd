//! Simplex-constrained weight search over OOF predictions
//!
//! Random-restart hill climbing. Every trial derives its own RNG from
//! (base seed, trial index), so trials are reproducible and may run on
//! independent rayon workers; the final reduction scans trials in index
//! order, which makes serial and parallel execution agree exactly.
//! Trial 0 starts from uniform weights, which guarantees the returned
//! score is never below the uniform-blend score.

use crate::blend::WeightVector;
use crate::error::{BlendError, Result};
use crate::frame::AlignedOof;
use crate::metrics::finite_mean;
use crate::scoring::{score, Metric};
use ndarray::Array1;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Number of independent restarts
    pub n_restarts: usize,
    /// Perturbation budget per restart
    pub n_steps: usize,
    /// Scale of the Gaussian perturbations
    pub step_size: f64,
    /// Stop a restart after this many consecutive non-improving steps
    pub stall_limit: usize,
    /// Minimum score gain counted as an improvement
    pub tol: f64,
    /// Base seed; trial i uses seed.wrapping_add(i)
    pub seed: u64,
    /// Run restarts on rayon workers
    pub parallel: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            n_restarts: 8,
            n_steps: 200,
            step_size: 0.1,
            stall_limit: 50,
            tol: 1e-9,
            seed: 42,
            parallel: true,
        }
    }
}

impl OptimizerConfig {
    pub fn with_restarts(mut self, n: usize) -> Self {
        self.n_restarts = n;
        self
    }

    pub fn with_steps(mut self, n: usize) -> Self {
        self.n_steps = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Search metadata returned alongside the weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerMeta {
    pub n_restarts: usize,
    pub n_steps: usize,
    pub seed: u64,
    /// Index of the winning trial
    pub best_trial: usize,
}

/// The optimized weight vector and its OOF score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedWeights {
    pub weights: WeightVector,
    pub score: f64,
    pub meta: OptimizerMeta,
}

/// Simplex weight optimizer
pub struct WeightOptimizer {
    config: OptimizerConfig,
}

struct Trial {
    index: usize,
    weights: Array1<f64>,
    score: f64,
}

impl WeightOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Find weights on the simplex maximizing the metric of the weighted OOF
    /// blend, averaged over folds when fold labels are available.
    pub fn optimize(&self, oof: &AlignedOof, metric: Metric) -> Result<OptimizedWeights> {
        let n_models = oof.n_models();
        if n_models == 0 {
            return Err(BlendError::InsufficientModels(0));
        }
        if self.config.n_restarts == 0 {
            return Err(BlendError::Validation(
                "n_restarts must be at least 1".to_string(),
            ));
        }
        if self.config.step_size <= 0.0 {
            return Err(BlendError::Validation(
                "step_size must be positive".to_string(),
            ));
        }

        let run_trial = |index: usize| -> Trial {
            let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(index as u64));
            // Trial 0 starts at the uniform point; later restarts draw from
            // a uniform Dirichlet so the simplex is covered
            let start = if index == 0 {
                Array1::from_elem(n_models, 1.0 / n_models as f64)
            } else {
                dirichlet_draw(&mut rng, n_models)
            };
            let (weights, score) = self.climb(oof, metric, start, &mut rng);
            Trial { index, weights, score }
        };

        let trials: Vec<Trial> = if self.config.parallel {
            (0..self.config.n_restarts)
                .into_par_iter()
                .map(run_trial)
                .collect()
        } else {
            (0..self.config.n_restarts).map(run_trial).collect()
        };

        // Strictly-greater scan keeps the earliest trial on ties
        let mut best: Option<&Trial> = None;
        for trial in &trials {
            if trial.score.is_nan() {
                continue;
            }
            match best {
                Some(b) if trial.score <= b.score => {}
                _ => best = Some(trial),
            }
        }
        let best = best.ok_or_else(|| {
            BlendError::Computation("weight search produced no finite score".to_string())
        })?;

        debug!(
            best_trial = best.index,
            score = best.score,
            "weight optimization finished"
        );

        let weights: BTreeMap<String, f64> = oof
            .names
            .iter()
            .cloned()
            .zip(best.weights.iter().copied())
            .collect();

        Ok(OptimizedWeights {
            weights: WeightVector(weights),
            score: best.score,
            meta: OptimizerMeta {
                n_restarts: self.config.n_restarts,
                n_steps: self.config.n_steps,
                seed: self.config.seed,
                best_trial: best.index,
            },
        })
    }

    /// Hill climbing with projection back onto the simplex; only
    /// non-decreasing moves are accepted.
    fn climb(
        &self,
        oof: &AlignedOof,
        metric: Metric,
        start: Array1<f64>,
        rng: &mut ChaCha8Rng,
    ) -> (Array1<f64>, f64) {
        let mut current = start;
        let mut current_score = objective(oof, metric, &current);
        let mut stall = 0;

        for _ in 0..self.config.n_steps {
            let candidate = match perturb(&current, self.config.step_size, rng) {
                Some(c) => c,
                None => continue,
            };
            let candidate_score = objective(oof, metric, &candidate);
            if candidate_score.is_nan() {
                stall += 1;
            } else if current_score.is_nan() || candidate_score >= current_score {
                if candidate_score > current_score + self.config.tol || current_score.is_nan() {
                    stall = 0;
                } else {
                    stall += 1;
                }
                current = candidate;
                current_score = candidate_score;
            } else {
                stall += 1;
            }

            if stall >= self.config.stall_limit {
                break;
            }
        }

        (current, current_score)
    }
}

/// Metric of the weighted OOF blend; fold-averaged when folds exist.
/// NaN signals an unevaluable point.
pub(crate) fn objective(oof: &AlignedOof, metric: Metric, weights: &Array1<f64>) -> f64 {
    let blended = oof.preds.dot(weights);

    match &oof.folds {
        Some(folds) => {
            let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
            for (row, &fold) in folds.iter().enumerate() {
                groups.entry(fold).or_default().push(row);
            }
            let fold_scores = groups.values().map(|rows| {
                let y: Array1<f64> = rows.iter().map(|&r| oof.targets[r]).collect();
                let p: Array1<f64> = rows.iter().map(|&r| blended[r]).collect();
                score(metric, y.view(), p.view()).unwrap_or(f64::NAN)
            });
            finite_mean(fold_scores)
        }
        None => score(metric, oof.targets.view(), blended.view()).unwrap_or(f64::NAN),
    }
}

/// Uniform Dirichlet draw via normalized exponentials
fn dirichlet_draw(rng: &mut ChaCha8Rng, n: usize) -> Array1<f64> {
    let draws: Vec<f64> = (0..n)
        .map(|_| -(1.0 - rng.gen::<f64>()).ln().max(1e-12))
        .collect();
    let total: f64 = draws.iter().sum();
    Array1::from_iter(draws.into_iter().map(|d| d / total))
}

/// Gaussian perturbation projected back onto the simplex; None when the
/// projection collapses to the zero vector
fn perturb(weights: &Array1<f64>, step_size: f64, rng: &mut ChaCha8Rng) -> Option<Array1<f64>> {
    let mut candidate: Array1<f64> = weights
        .iter()
        .map(|&w| (w + step_size * gaussian(rng)).max(0.0))
        .collect();
    let total: f64 = candidate.sum();
    if total <= 0.0 {
        return None;
    }
    candidate.mapv_inplace(|w| w / total);
    Some(candidate)
}

/// Standard normal via Box-Muller
fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(1e-12);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend::mean_columns;
    use crate::frame::IdValue;
    use ndarray::{array, Array2};

    fn aligned(preds: Array2<f64>, targets: Array1<f64>) -> AlignedOof {
        let names = (0..preds.ncols()).map(|i| format!("m{}", i)).collect();
        AlignedOof {
            ids: (1..=preds.nrows() as i64).map(IdValue::Int).collect(),
            names,
            preds,
            targets,
            folds: None,
            times: None,
        }
    }

    fn fixture() -> AlignedOof {
        // m1 ranks the target perfectly, m0 is noisy
        aligned(
            array![
                [0.6, 0.1],
                [0.2, 0.3],
                [0.8, 0.7],
                [0.1, 0.9],
                [0.5, 0.2],
                [0.9, 0.8]
            ],
            array![0.0, 0.0, 1.0, 1.0, 0.0, 1.0],
        )
    }

    #[test]
    fn test_weights_form_a_simplex() {
        let oof = fixture();
        let optimizer = WeightOptimizer::new(OptimizerConfig::default().with_restarts(4));
        let result = optimizer.optimize(&oof, Metric::Auc).unwrap();
        assert!(result.weights.is_simplex(1e-6));
        for &w in result.weights.0.values() {
            assert!(w >= 0.0);
        }
    }

    #[test]
    fn test_score_at_least_uniform_blend() {
        let oof = fixture();
        let uniform_blend = mean_columns(oof.preds.view());
        let uniform_score =
            score(Metric::Auc, oof.targets.view(), uniform_blend.view()).unwrap();

        let optimizer = WeightOptimizer::new(OptimizerConfig::default().with_restarts(4));
        let result = optimizer.optimize(&oof, Metric::Auc).unwrap();
        assert!(result.score >= uniform_score - 1e-12);
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let oof = fixture();
        let config = OptimizerConfig::default().with_restarts(6).with_seed(7);
        let a = WeightOptimizer::new(config.clone()).optimize(&oof, Metric::Auc).unwrap();
        let b = WeightOptimizer::new(config).optimize(&oof, Metric::Auc).unwrap();

        assert_eq!(a.score, b.score);
        assert_eq!(a.meta.best_trial, b.meta.best_trial);
        for (name, w) in &a.weights.0 {
            assert_eq!(*w, b.weights.get(name));
        }
    }

    #[test]
    fn test_serial_matches_parallel() {
        let oof = fixture();
        let serial = WeightOptimizer::new(
            OptimizerConfig::default().with_restarts(6).with_seed(3).with_parallel(false),
        )
        .optimize(&oof, Metric::Auc)
        .unwrap();
        let parallel = WeightOptimizer::new(
            OptimizerConfig::default().with_restarts(6).with_seed(3).with_parallel(true),
        )
        .optimize(&oof, Metric::Auc)
        .unwrap();

        assert_eq!(serial.score, parallel.score);
        assert_eq!(serial.meta.best_trial, parallel.meta.best_trial);
        for (name, w) in &serial.weights.0 {
            assert_eq!(*w, parallel.weights.get(name));
        }
    }

    #[test]
    fn test_fold_averaged_objective() {
        let mut oof = fixture();
        oof.folds = Some(vec![0, 0, 0, 1, 1, 1]);
        let w = Array1::from_elem(2, 0.5);
        let value = objective(&oof, Metric::Auc, &w);
        assert!(value.is_finite());
    }

    #[test]
    fn test_zero_models_rejected() {
        let oof = aligned(Array2::zeros((0, 0)), Array1::zeros(0));
        let optimizer = WeightOptimizer::new(OptimizerConfig::default());
        assert!(matches!(
            optimizer.optimize(&oof, Metric::Auc),
            Err(BlendError::InsufficientModels(0))
        ));
    }

    #[test]
    fn test_zero_restarts_rejected() {
        let oof = fixture();
        let optimizer = WeightOptimizer::new(OptimizerConfig::default().with_restarts(0));
        assert!(matches!(
            optimizer.optimize(&oof, Metric::Auc),
            Err(BlendError::Validation(_))
        ));
    }

    #[test]
    fn test_dirichlet_draw_is_on_simplex() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let w = dirichlet_draw(&mut rng, 5);
        assert!((w.sum() - 1.0).abs() < 1e-12);
        assert!(w.iter().all(|&v| v >= 0.0));
    }
}
