//! Temporal stability of blend methods
//!
//! Groups OOF rows into calendar windows, scores each parameter-free blend
//! method inside every usable window, and summarizes how consistent and how
//! often dominant each method is across time.

use crate::blend::{logit_mean_columns, mean_columns, rank_mean_columns, BlendMethod};
use crate::error::{BlendError, Result};
use crate::frame::AlignedOof;
use crate::metrics::{finite_mean, MetricsTable};
use crate::scoring::{score, Metric};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Calendar bucketing for window keys
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    /// Window key format. Lexicographic order matches chronological order.
    fn format(&self) -> &'static str {
        match self {
            Frequency::Daily => "%Y-%m-%d",
            Frequency::Weekly => "%G-W%V",
            Frequency::Monthly => "%Y-%m",
        }
    }
}

/// Configuration for the stability analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    pub frequency: Frequency,
    /// Windows with fewer rows are skipped
    pub min_rows: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            frequency: Frequency::Daily,
            min_rows: 10,
        }
    }
}

impl StabilityConfig {
    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_min_rows(mut self, min_rows: usize) -> Self {
        self.min_rows = min_rows;
        self
    }
}

/// Per-method stability summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodStability {
    pub method: String,
    /// Score per window key, chronological
    pub window_scores: BTreeMap<String, f64>,
    /// Coefficient of variation of the window scores (lower is steadier)
    pub stability: f64,
    /// Fraction of windows in which this method scored strictly best
    pub dominance: f64,
}

/// Stability report over all analyzed methods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityReport {
    pub methods: Vec<MethodStability>,
    /// Number of scored windows
    pub n_windows: usize,
    /// Windows dropped for having too few rows or a single-class target
    pub skipped_windows: usize,
}

/// Score each parameter-free blend method per calendar window and summarize
/// consistency (coefficient of variation) and dominance.
pub fn analyze_stability(
    oof: &AlignedOof,
    metrics: &MetricsTable,
    metric: Metric,
    methods: &[BlendMethod],
    config: &StabilityConfig,
) -> Result<StabilityReport> {
    let times = oof
        .times
        .as_ref()
        .ok_or_else(|| BlendError::Data("stability analysis requires timestamps".to_string()))?;

    let methods: Vec<BlendMethod> = methods
        .iter()
        .copied()
        .filter(|m| BlendMethod::parameter_free().contains(m))
        .collect();
    if methods.is_empty() {
        return Err(BlendError::Validation(
            "no parameter-free blend method to analyze".to_string(),
        ));
    }

    // BTreeMap keeps windows in chronological order
    let mut windows: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (row, t) in times.iter().enumerate() {
        let key = t.format(config.frequency.format()).to_string();
        windows.entry(key).or_default().push(row);
    }

    let mut window_scores: Vec<BTreeMap<String, f64>> = vec![BTreeMap::new(); methods.len()];
    let mut dominated = vec![0usize; methods.len()];
    let mut n_windows = 0usize;
    let mut skipped = 0usize;

    for (key, rows) in &windows {
        if rows.len() < config.min_rows {
            debug!(window = %key, rows = rows.len(), "window below minimum row count");
            skipped += 1;
            continue;
        }
        let window = oof.select_rows(rows);
        if metric == Metric::Auc && single_class(&window.targets) {
            debug!(window = %key, "single-class window");
            skipped += 1;
            continue;
        }

        let mut scores = Vec::with_capacity(methods.len());
        for (m, method) in methods.iter().enumerate() {
            let s = window_score(&window, metrics, metric, *method);
            window_scores[m].insert(key.clone(), s);
            scores.push(s);
        }
        n_windows += 1;

        // Strictly-best method per window, ties kept by the first method
        let mut winner: Option<usize> = None;
        for (m, &s) in scores.iter().enumerate() {
            if s.is_nan() {
                continue;
            }
            match winner {
                Some(w) if s <= scores[w] => {}
                _ => winner = Some(m),
            }
        }
        if let Some(w) = winner {
            dominated[w] += 1;
        }
    }

    if n_windows == 0 {
        return Err(BlendError::Data(
            "no window has enough usable rows for stability analysis".to_string(),
        ));
    }

    let methods = methods
        .iter()
        .zip(window_scores)
        .zip(dominated)
        .map(|((method, scores), wins)| {
            let stability = coefficient_of_variation(scores.values().copied());
            MethodStability {
                method: method.as_str().to_string(),
                window_scores: scores,
                stability,
                dominance: wins as f64 / n_windows as f64,
            }
        })
        .collect();

    Ok(StabilityReport {
        methods,
        n_windows,
        skipped_windows: skipped,
    })
}

/// Blend the window's OOF columns with one method and score the result
fn window_score(
    window: &AlignedOof,
    metrics: &MetricsTable,
    metric: Metric,
    method: BlendMethod,
) -> f64 {
    let preds: Array1<f64> = match method {
        BlendMethod::Mean => mean_columns(window.preds.view()),
        BlendMethod::RankMean => rank_mean_columns(window.preds.view()),
        BlendMethod::LogitMean => logit_mean_columns(window.preds.view()),
        BlendMethod::BestSingle => {
            let best = match metrics.best_model() {
                Some(name) => name,
                None => return f64::NAN,
            };
            match window.names.iter().position(|n| n == best) {
                Some(col) => window.preds.column(col).to_owned(),
                None => return f64::NAN,
            }
        }
        BlendMethod::Weighted => return f64::NAN,
    };
    score(metric, window.targets.view(), preds.view()).unwrap_or(f64::NAN)
}

fn single_class(targets: &Array1<f64>) -> bool {
    let has_pos = targets.iter().any(|&t| t > 0.5);
    let has_neg = targets.iter().any(|&t| t <= 0.5);
    !(has_pos && has_neg)
}

/// Population standard deviation over mean magnitude; NaN when undefined
fn coefficient_of_variation(scores: impl Iterator<Item = f64>) -> f64 {
    let finite: Vec<f64> = scores.filter(|s| s.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    let mean = finite_mean(finite.iter().copied());
    if mean == 0.0 {
        return f64::NAN;
    }
    let var = finite.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / finite.len() as f64;
    var.sqrt() / mean.abs()
}
