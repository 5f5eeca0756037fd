//! CrediBlend - Model prediction blending engine
//!
//! Takes per-model out-of-fold (OOF) prediction tables and test-set
//! submission tables, scores every model, prunes redundant ones, and
//! produces blended submissions with a full diagnostic report.
//!
//! # Modules
//!
//! ## Core
//! - [`frame`] - Schema-checked model tables and ID alignment
//! - [`scoring`] - Evaluation metrics (AUC, MSE, MAE)
//! - [`metrics`] - Per-model OOF metrics and the comparison table
//! - [`decorrelate`] - Correlation-based redundancy clustering
//!
//! ## Blending
//! - [`blend`] - Deterministic blend methods (mean, rank mean, logit mean, best single)
//! - [`optimize`] - Simplex-constrained weight search
//! - [`stacking`] - Ridge and logistic meta-model stacking
//!
//! ## Analysis
//! - [`stability`] - Temporal stability of blend methods
//!
//! ## Orchestration
//! - [`pipeline`] - End-to-end pipeline with degradable stages

pub mod error;

pub mod frame;
pub mod scoring;
pub mod metrics;
pub mod decorrelate;

pub mod blend;
pub mod optimize;
pub mod stacking;

pub mod stability;

pub mod pipeline;

pub use error::{BlendError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{BlendError, Result};

    pub use crate::frame::{
        align_oof, align_submissions, AlignedOof, AlignedSubmissions, IdValue, ModelTable,
    };
    pub use crate::scoring::{score, Metric};
    pub use crate::metrics::{compute_oof_metrics, MetricsTable, OofMetrics};
    pub use crate::decorrelate::{decorrelate, ClusterMap, CorrelationMatrix, DecorrelationResult};

    pub use crate::blend::{
        blend_best_single, blend_logit_mean, blend_mean, blend_rank_mean, blend_weighted,
        BlendMethod, BlendResult, WeightVector,
    };
    pub use crate::optimize::{OptimizedWeights, OptimizerConfig, WeightOptimizer};
    pub use crate::stacking::{
        MetaModel, StackingBlender, StackingCoefficients, StackingConfig,
    };

    pub use crate::stability::{
        analyze_stability, Frequency, MethodStability, StabilityConfig, StabilityReport,
    };

    pub use crate::pipeline::{
        BlendPipeline, BlendReport, GovernorConfig, PipelineConfig, StageOutcome,
    };
}
