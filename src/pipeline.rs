//! End-to-end blending pipeline
//!
//! Orchestrates ingestion, metrics, decorrelation, blending, weight
//! optimization, stacking, and stability analysis into one report. Schema
//! problems in the input frames are fatal; downstream stage failures degrade
//! to [`StageOutcome::Skipped`] so one broken stage never sinks the run.

use crate::blend::{
    blend_best_single, blend_logit_mean, blend_mean, blend_rank_mean, blend_weighted,
    BlendMethod, BlendResult,
};
use crate::decorrelate::{decorrelate, ClusterMap, CorrelationMatrix};
use crate::error::{BlendError, Result};
use crate::frame::{align_oof, align_submissions, AlignedOof, ModelTable};
use crate::metrics::{compute_oof_metrics, MetricsTable};
use crate::optimize::{OptimizedWeights, OptimizerConfig, WeightOptimizer};
use crate::scoring::Metric;
use crate::stability::{analyze_stability, StabilityConfig, StabilityReport};
use crate::stacking::{StackingBlender, StackingCoefficients, StackingConfig};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// Outcome of an optional pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageOutcome<T> {
    Computed(T),
    Skipped { reason: String },
}

impl<T> StageOutcome<T> {
    pub fn is_computed(&self) -> bool {
        matches!(self, StageOutcome::Computed(_))
    }

    pub fn computed(&self) -> Option<&T> {
        match self {
            StageOutcome::Computed(v) => Some(v),
            StageOutcome::Skipped { .. } => None,
        }
    }
}

/// Deterministic resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Hard cap on models entering the blend stages
    pub max_models: usize,
    /// Row cap above which the weight search is skipped
    pub max_optimization_rows: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_models: 50,
            max_optimization_rows: 2_000_000,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub metric: Metric,
    /// Name of the label column in the OOF frames
    pub target_col: String,
    /// Parameter-free methods to run
    pub methods: Vec<BlendMethod>,
    /// Correlation threshold for redundancy clustering
    pub corr_threshold: f64,
    pub optimizer: Option<OptimizerConfig>,
    pub stacking: Option<StackingConfig>,
    pub stability: Option<StabilityConfig>,
    pub governor: GovernorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Auc,
            target_col: "target".to_string(),
            methods: BlendMethod::parameter_free(),
            corr_threshold: 0.8,
            optimizer: Some(OptimizerConfig::default()),
            stacking: None,
            stability: None,
            governor: GovernorConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_target_col(mut self, target_col: impl Into<String>) -> Self {
        self.target_col = target_col.into();
        self
    }

    pub fn with_methods(mut self, methods: Vec<BlendMethod>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_corr_threshold(mut self, threshold: f64) -> Self {
        self.corr_threshold = threshold;
        self
    }

    pub fn with_optimizer(mut self, optimizer: Option<OptimizerConfig>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_stacking(mut self, stacking: Option<StackingConfig>) -> Self {
        self.stacking = stacking;
        self
    }

    pub fn with_stability(mut self, stability: Option<StabilityConfig>) -> Self {
        self.stability = stability;
        self
    }

    pub fn with_governor(mut self, governor: GovernorConfig) -> Self {
        self.governor = governor;
        self
    }
}

/// Full pipeline output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendReport {
    pub metrics: MetricsTable,
    pub correlations: CorrelationMatrix,
    pub cluster_map: ClusterMap,
    /// Models that survived decorrelation and the governor, best first
    pub retained_models: Vec<String>,
    pub dropped_models: Vec<String>,
    /// Blend outputs keyed by method name
    pub blends: BTreeMap<String, BlendResult>,
    pub optimized: StageOutcome<OptimizedWeights>,
    pub stacking: StageOutcome<StackingCoefficients>,
    pub stability: StageOutcome<StabilityReport>,
    /// Recommended submission: best_single when scoreable, else mean, else
    /// the first configured method that produced output
    pub best: (String, BlendResult),
}

/// The blending pipeline
pub struct BlendPipeline {
    config: PipelineConfig,
}

impl BlendPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Run the pipeline over named OOF and submission frames.
    pub fn run(
        &self,
        oof_frames: &[(String, DataFrame)],
        sub_frames: &[(String, DataFrame)],
    ) -> Result<BlendReport> {
        let oof_tables: Vec<ModelTable> = oof_frames
            .iter()
            .map(|(name, df)| ModelTable::from_oof_frame(name, df, &self.config.target_col))
            .collect::<Result<_>>()?;
        let sub_tables: Vec<ModelTable> = sub_frames
            .iter()
            .map(|(name, df)| ModelTable::from_submission_frame(name, df))
            .collect::<Result<_>>()?;

        // Only models with both an OOF table and a submission participate
        let sub_names: BTreeSet<&str> = sub_tables.iter().map(|t| t.name.as_str()).collect();
        let oof_names: BTreeSet<&str> = oof_tables.iter().map(|t| t.name.as_str()).collect();
        let matched: Vec<ModelTable> = oof_tables
            .iter()
            .filter(|t| sub_names.contains(t.name.as_str()))
            .cloned()
            .collect();
        for table in &oof_tables {
            if !sub_names.contains(table.name.as_str()) {
                warn!(model = %table.name, "OOF table has no submission; dropping");
            }
        }
        for table in &sub_tables {
            if !oof_names.contains(table.name.as_str()) {
                warn!(model = %table.name, "submission has no OOF table; dropping");
            }
        }
        if matched.is_empty() {
            return Err(BlendError::InsufficientModels(0));
        }

        let metrics = MetricsTable::from_metrics(&compute_oof_metrics(
            &matched,
            self.config.metric,
        ));
        let aligned = align_oof(&matched)?;

        let decorrelation = decorrelate(&aligned, &metrics, self.config.corr_threshold)?;
        let mut retained = decorrelation.retained.clone();

        // Governor: retained is best-first, so truncation keeps the strongest
        if retained.len() > self.config.governor.max_models {
            warn!(
                retained = retained.len(),
                max_models = self.config.governor.max_models,
                "model cap exceeded; dropping lowest-scoring models"
            );
            retained.truncate(self.config.governor.max_models);
        }

        let dropped_models: Vec<String> = aligned
            .names
            .iter()
            .filter(|n| !retained.contains(n))
            .cloned()
            .collect();
        info!(
            retained = retained.len(),
            dropped = dropped_models.len(),
            "model selection complete"
        );

        let oof_retained = aligned.select_models(&retained)?;
        let retained_subs: Vec<ModelTable> = retained
            .iter()
            .filter_map(|name| sub_tables.iter().find(|t| &t.name == name).cloned())
            .collect();
        let subs = align_submissions(&retained_subs)?;

        let mut blends: BTreeMap<String, BlendResult> = BTreeMap::new();
        for method in &self.config.methods {
            let result = match method {
                BlendMethod::Mean => blend_mean(&subs),
                BlendMethod::RankMean => blend_rank_mean(&subs),
                BlendMethod::LogitMean => blend_logit_mean(&subs),
                BlendMethod::BestSingle => blend_best_single(&subs, &metrics),
                // Produced by the optimizer stage, never directly
                BlendMethod::Weighted => continue,
            };
            match result {
                Ok(blend) => {
                    blends.insert(method.as_str().to_string(), blend);
                }
                Err(e) => warn!(method = %method, error = %e, "blend method failed; omitting"),
            }
        }

        let optimized = self.run_optimizer(&oof_retained, &retained_subs, &mut blends);
        let stacking = self.run_stacking(&oof_retained, &subs, &mut blends);
        let stability = self.run_stability(&oof_retained, &metrics);

        let best = self.pick_best(&blends)?;

        Ok(BlendReport {
            metrics,
            correlations: decorrelation.correlations,
            cluster_map: decorrelation.cluster_map,
            retained_models: retained,
            dropped_models,
            blends,
            optimized,
            stacking,
            stability,
            best,
        })
    }

    fn run_optimizer(
        &self,
        oof: &AlignedOof,
        retained_subs: &[ModelTable],
        blends: &mut BTreeMap<String, BlendResult>,
    ) -> StageOutcome<OptimizedWeights> {
        let config = match &self.config.optimizer {
            Some(c) => c.clone(),
            None => {
                return StageOutcome::Skipped {
                    reason: "weight optimization not configured".to_string(),
                }
            }
        };
        if oof.n_rows() > self.config.governor.max_optimization_rows {
            warn!(
                rows = oof.n_rows(),
                cap = self.config.governor.max_optimization_rows,
                "row cap exceeded; skipping weight search"
            );
            return StageOutcome::Skipped {
                reason: format!(
                    "{} OOF rows exceed the optimization cap of {}; degrading to mean",
                    oof.n_rows(),
                    self.config.governor.max_optimization_rows
                ),
            };
        }

        match WeightOptimizer::new(config).optimize(oof, self.config.metric) {
            Ok(result) => {
                match blend_weighted(retained_subs, &result.weights) {
                    Ok(blend) => {
                        blends.insert(BlendMethod::Weighted.as_str().to_string(), blend);
                    }
                    Err(e) => warn!(error = %e, "weighted blend failed; omitting"),
                }
                StageOutcome::Computed(result)
            }
            Err(e) => {
                warn!(error = %e, "weight optimization failed");
                StageOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn run_stacking(
        &self,
        oof: &AlignedOof,
        subs: &crate::frame::AlignedSubmissions,
        blends: &mut BTreeMap<String, BlendResult>,
    ) -> StageOutcome<StackingCoefficients> {
        let config = match &self.config.stacking {
            Some(c) => c.clone(),
            None => {
                return StageOutcome::Skipped {
                    reason: "stacking not configured".to_string(),
                }
            }
        };

        let blender = StackingBlender::new(config);
        match blender.fit(oof).and_then(|coef| {
            let blend = blender.apply(&coef, subs)?;
            Ok((coef, blend))
        }) {
            Ok((coef, blend)) => {
                blends.insert("stacking".to_string(), blend);
                StageOutcome::Computed(coef)
            }
            Err(e) => {
                warn!(error = %e, "stacking failed");
                StageOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn run_stability(
        &self,
        oof: &AlignedOof,
        metrics: &MetricsTable,
    ) -> StageOutcome<StabilityReport> {
        let config = match &self.config.stability {
            Some(c) => c.clone(),
            None => {
                return StageOutcome::Skipped {
                    reason: "stability analysis not configured".to_string(),
                }
            }
        };

        match analyze_stability(oof, metrics, self.config.metric, &self.config.methods, &config)
        {
            Ok(report) => StageOutcome::Computed(report),
            Err(e) => {
                warn!(error = %e, "stability analysis failed");
                StageOutcome::Skipped {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// best_single when present, then mean, then the first configured method
    /// that produced output
    fn pick_best(
        &self,
        blends: &BTreeMap<String, BlendResult>,
    ) -> Result<(String, BlendResult)> {
        for name in [BlendMethod::BestSingle.as_str(), BlendMethod::Mean.as_str()] {
            if let Some(blend) = blends.get(name) {
                return Ok((name.to_string(), blend.clone()));
            }
        }
        for method in &self.config.methods {
            if let Some(blend) = blends.get(method.as_str()) {
                return Ok((method.as_str().to_string(), blend.clone()));
            }
        }
        Err(BlendError::Data(
            "no blend method produced output".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn oof_frame(preds: &[f64], targets: &[f64]) -> DataFrame {
        let ids: Vec<i64> = (1..=preds.len() as i64).collect();
        df!(
            "id" => ids.as_slice(),
            "pred" => preds,
            "target" => targets
        )
        .unwrap()
    }

    fn sub_frame(preds: &[f64]) -> DataFrame {
        let ids: Vec<i64> = (1..=preds.len() as i64).collect();
        df!("id" => ids.as_slice(), "pred" => preds).unwrap()
    }

    fn inputs() -> (Vec<(String, DataFrame)>, Vec<(String, DataFrame)>) {
        let targets = [0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        let oof = vec![
            (
                "a".to_string(),
                // one ranking error, so "b" scores strictly better
                oof_frame(&[0.2, 0.7, 0.3, 0.8, 0.6, 0.65], &targets),
            ),
            (
                "b".to_string(),
                oof_frame(&[0.6, 0.8, 0.1, 0.9, 0.7, 0.2], &targets),
            ),
        ];
        let subs = vec![
            ("a".to_string(), sub_frame(&[0.1, 0.5, 0.9])),
            ("b".to_string(), sub_frame(&[0.3, 0.4, 0.8])),
        ];
        (oof, subs)
    }

    #[test]
    fn test_end_to_end_run() {
        let (oof, subs) = inputs();
        let config = PipelineConfig::default()
            .with_corr_threshold(0.99)
            .with_optimizer(Some(OptimizerConfig::default().with_restarts(2)));
        let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

        assert_eq!(report.retained_models.len(), 2);
        assert!(report.blends.contains_key("mean"));
        assert!(report.blends.contains_key("best_single"));
        assert!(report.blends.contains_key("weight_opt"));
        assert!(report.optimized.is_computed());
        assert_eq!(report.best.0, "best_single");

        let mean = &report.blends["mean"];
        assert!((mean.preds[0] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_unmatched_models_are_dropped() {
        let (mut oof, subs) = inputs();
        oof.push((
            "orphan".to_string(),
            oof_frame(&[0.5, 0.5, 0.5, 0.5, 0.5, 0.5], &[0.0, 1.0, 0.0, 1.0, 1.0, 0.0]),
        ));
        let report = BlendPipeline::new(PipelineConfig::default().with_optimizer(None))
            .run(&oof, &subs)
            .unwrap();
        assert!(!report.retained_models.contains(&"orphan".to_string()));
    }

    #[test]
    fn test_no_matched_models_is_fatal() {
        let (oof, _) = inputs();
        let subs = vec![("z".to_string(), sub_frame(&[0.1, 0.2, 0.3]))];
        assert!(matches!(
            BlendPipeline::new(PipelineConfig::default()).run(&oof, &subs),
            Err(BlendError::InsufficientModels(0))
        ));
    }

    #[test]
    fn test_governor_caps_models() {
        let (oof, subs) = inputs();
        let config = PipelineConfig::default()
            .with_corr_threshold(0.999)
            .with_optimizer(None)
            .with_governor(GovernorConfig {
                max_models: 1,
                max_optimization_rows: 2_000_000,
            });
        let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

        assert_eq!(report.retained_models.len(), 1);
        // the survivor is the best-scoring model
        assert_eq!(report.retained_models[0], "b");
        assert_eq!(report.dropped_models, vec!["a".to_string()]);
    }

    #[test]
    fn test_optimizer_row_cap_degrades_gracefully() {
        let (oof, subs) = inputs();
        let config = PipelineConfig::default().with_governor(GovernorConfig {
            max_models: 50,
            max_optimization_rows: 3,
        });
        let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

        assert!(!report.optimized.is_computed());
        assert!(!report.blends.contains_key("weight_opt"));
        assert!(report.blends.contains_key("mean"));
    }

    #[test]
    fn test_stacking_failure_is_not_fatal() {
        // single-class target makes the logistic meta-model unfittable
        let targets = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let oof = vec![
            (
                "a".to_string(),
                oof_frame(&[0.2, 0.7, 0.3, 0.8, 0.6, 0.4], &targets),
            ),
            (
                "b".to_string(),
                oof_frame(&[0.6, 0.8, 0.1, 0.9, 0.7, 0.2], &targets),
            ),
        ];
        let subs = vec![
            ("a".to_string(), sub_frame(&[0.1, 0.5, 0.9])),
            ("b".to_string(), sub_frame(&[0.3, 0.4, 0.8])),
        ];

        let config = PipelineConfig::default()
            .with_optimizer(None)
            .with_stacking(Some(
                StackingConfig::default().with_model(crate::stacking::MetaModel::Logistic),
            ));
        let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

        assert!(!report.stacking.is_computed());
        assert!(report.blends.contains_key("mean"));
        // AUC is NaN on a single class, so best_single cannot be scored
        assert_eq!(report.best.0, "mean");
    }

    #[test]
    fn test_stage_outcome_accessors() {
        let computed: StageOutcome<u32> = StageOutcome::Computed(7);
        let skipped: StageOutcome<u32> = StageOutcome::Skipped {
            reason: "n/a".to_string(),
        };
        assert_eq!(computed.computed(), Some(&7));
        assert!(skipped.computed().is_none());
    }
}
