//! Redundancy reduction: correlation-based clustering of near-duplicate models
//!
//! Greedy seed-and-sweep clustering over an explicit Pearson correlation
//! matrix. Models are processed in descending overall-OOF order; each
//! unassigned model opens a cluster and sweeps in every still-unassigned
//! model correlated above the threshold. This is a greedy approximation,
//! not globally optimal clustering; ties follow the input model order.

use crate::error::{BlendError, Result};
use crate::frame::AlignedOof;
use crate::metrics::MetricsTable;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Pairwise Pearson correlations of OOF predictions, joined on id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub models: Vec<String>,
    pub values: Array2<f64>,
}

impl CorrelationMatrix {
    pub fn get(&self, a: usize, b: usize) -> f64 {
        self.values[[a, b]]
    }
}

/// A cluster of mutually redundant models with its designated representative
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub representative: String,
    pub members: Vec<String>,
}

/// Exact partition of the input model set into clusters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMap {
    pub clusters: Vec<Cluster>,
}

impl ClusterMap {
    pub fn n_clusters(&self) -> usize {
        self.clusters.len()
    }
}

/// Output of the decorrelation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecorrelationResult {
    pub cluster_map: ClusterMap,
    /// Cluster representatives, in descending overall-OOF order
    pub retained: Vec<String>,
    pub correlations: CorrelationMatrix,
}

/// Cluster models by OOF-prediction correlation and keep one representative
/// per cluster (the member with the highest overall OOF score).
pub fn decorrelate(
    oof: &AlignedOof,
    metrics: &MetricsTable,
    threshold: f64,
) -> Result<DecorrelationResult> {
    if oof.n_models() == 0 {
        return Err(BlendError::InsufficientModels(0));
    }
    if !(-1.0..=1.0).contains(&threshold) {
        return Err(BlendError::Validation(format!(
            "correlation threshold must be in [-1, 1], got {}",
            threshold
        )));
    }

    let correlations = correlation_matrix(oof);
    let n = oof.n_models();

    let scores: Vec<f64> = oof
        .names
        .iter()
        .map(|name| metrics.overall_score(name))
        .collect();

    // Descending by overall score, NaN last, ties stable by input order
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        sort_key(scores[b])
            .partial_cmp(&sort_key(scores[a]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut assigned = vec![false; n];
    let mut clusters = Vec::new();

    for &seed in &order {
        if assigned[seed] {
            continue;
        }
        assigned[seed] = true;
        let mut member_idx = vec![seed];

        for &other in &order {
            if assigned[other] {
                continue;
            }
            if correlations.get(seed, other) > threshold {
                assigned[other] = true;
                member_idx.push(other);
            }
        }

        // Representative is the member with the highest overall score,
        // ties broken by input order (member_idx is score-descending, stable)
        let mut rep = seed;
        for &m in &member_idx {
            if sort_key(scores[m]) > sort_key(scores[rep]) {
                rep = m;
            }
        }

        clusters.push(Cluster {
            representative: oof.names[rep].clone(),
            members: member_idx.iter().map(|&i| oof.names[i].clone()).collect(),
        });
    }

    let retained = clusters.iter().map(|c| c.representative.clone()).collect();

    Ok(DecorrelationResult {
        cluster_map: ClusterMap { clusters },
        retained,
        correlations,
    })
}

fn sort_key(score: f64) -> f64 {
    if score.is_nan() {
        f64::NEG_INFINITY
    } else {
        score
    }
}

/// Symmetric Pearson correlation matrix over the aligned OOF columns
pub fn correlation_matrix(oof: &AlignedOof) -> CorrelationMatrix {
    let n = oof.n_models();
    let mut values = Array2::zeros((n, n));

    for i in 0..n {
        values[[i, i]] = 1.0;
        for j in (i + 1)..n {
            let corr = pearson(oof.preds.column(i), oof.preds.column(j));
            values[[i, j]] = corr;
            values[[j, i]] = corr;
        }
    }

    CorrelationMatrix {
        models: oof.names.clone(),
        values,
    }
}

fn pearson(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let n = x.len() as f64;
    if n < 2.0 {
        return 0.0;
    }

    let x_mean = x.mean().unwrap_or(0.0);
    let y_mean = y.mean().unwrap_or(0.0);

    let mut sum_xy = 0.0;
    let mut sum_x2 = 0.0;
    let mut sum_y2 = 0.0;

    for (&xi, &yi) in x.iter().zip(y.iter()) {
        let dx = xi - x_mean;
        let dy = yi - y_mean;
        sum_xy += dx * dy;
        sum_x2 += dx * dx;
        sum_y2 += dy * dy;
    }

    let denom = (sum_x2 * sum_y2).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        sum_xy / denom
    }
}
