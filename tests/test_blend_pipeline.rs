//! Integration tests for the full blending pipeline

use crediblend::prelude::*;
use polars::df;
use polars::prelude::DataFrame;

// ============================================================================
// Fixtures
// ============================================================================

// Alternating binary target; model "a" ranks it perfectly, "b" makes a few
// ranking errors, so "a" is the best single model.
const TARGETS: [f64; 10] = [0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
const A_OOF: [f64; 10] = [0.1, 0.6, 0.2, 0.7, 0.3, 0.8, 0.4, 0.9, 0.45, 0.55];
const B_OOF: [f64; 10] = [0.5, 0.6, 0.3, 0.4, 0.2, 0.7, 0.45, 0.8, 0.35, 0.3];

fn oof_df(preds: &[f64]) -> DataFrame {
    let ids: Vec<i64> = (1..=preds.len() as i64).collect();
    df!(
        "id" => ids.as_slice(),
        "pred" => preds,
        "target" => &TARGETS[..preds.len()]
    )
    .unwrap()
}

fn timed_oof_df(preds: &[f64]) -> DataFrame {
    let ids: Vec<i64> = (1..=preds.len() as i64).collect();
    let stamps: Vec<String> = (0..preds.len())
        .map(|i| {
            if i < preds.len() / 2 {
                "2024-06-01".to_string()
            } else {
                "2024-06-02".to_string()
            }
        })
        .collect();
    df!(
        "id" => ids.as_slice(),
        "pred" => preds,
        "target" => &TARGETS[..preds.len()],
        "timestamp" => stamps.as_slice()
    )
    .unwrap()
}

fn sub_df(preds: &[f64]) -> DataFrame {
    let ids: Vec<i64> = (1..=preds.len() as i64).collect();
    df!("id" => ids.as_slice(), "pred" => preds).unwrap()
}

fn standard_inputs() -> (Vec<(String, DataFrame)>, Vec<(String, DataFrame)>) {
    let oof = vec![
        ("a".to_string(), oof_df(&A_OOF)),
        ("b".to_string(), oof_df(&B_OOF)),
    ];
    let subs = vec![
        ("a".to_string(), sub_df(&[0.2, 0.8, 0.4, 0.6])),
        ("b".to_string(), sub_df(&[0.6, 0.4, 0.2, 0.9])),
    ];
    (oof, subs)
}

// ============================================================================
// End-to-end pipeline
// ============================================================================

#[test]
fn test_pipeline_end_to_end() {
    let (oof, subs) = standard_inputs();
    let config = PipelineConfig::default()
        .with_optimizer(Some(OptimizerConfig::default().with_restarts(4).with_seed(0)));
    let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

    // both models survive decorrelation (correlation well below 0.8)
    assert_eq!(report.retained_models.len(), 2);
    assert!(report.dropped_models.is_empty());

    // "a" ranks the OOF target perfectly
    assert_eq!(report.metrics.best_model(), Some("a"));
    assert!((report.metrics.overall_score("a") - 1.0).abs() < 1e-12);
    assert!(report.metrics.overall_score("b") < 1.0);

    for method in ["mean", "rank_mean", "logit_mean", "best_single", "weight_opt"] {
        assert!(report.blends.contains_key(method), "missing blend {}", method);
    }

    // best_single passes the winner's submission through unchanged
    let best_single = &report.blends["best_single"];
    for (out, orig) in best_single.preds.iter().zip([0.2, 0.8, 0.4, 0.6]) {
        assert!((out - orig).abs() < 1e-12);
    }
    assert_eq!(report.best.0, "best_single");

    // mean is the elementwise average of the aligned submissions
    let mean = &report.blends["mean"];
    for (out, expect) in mean.preds.iter().zip([0.4, 0.6, 0.3, 0.75]) {
        assert!((out - expect).abs() < 1e-12);
    }

    // the optimized weights lie on the simplex and never lose to uniform
    let optimized = report.optimized.computed().unwrap();
    assert!(optimized.weights.is_simplex(1e-6));
    assert!(optimized.score >= report.metrics.overall_score("b"));
}

#[test]
fn test_two_model_known_values() {
    // Hand-checked AUCs: "a" scores 14/20 = 0.70, "b" scores 15/20 = 0.75
    let targets = [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
    let oof_ids: Vec<i64> = (1..=9).collect();
    let a_oof = df!(
        "id" => oof_ids.as_slice(),
        "pred" => &[0.1, 0.2, 0.3, 0.4, 0.5, 0.9, 0.55, 0.35, 0.15],
        "target" => &targets[..]
    )
    .unwrap();
    let b_oof = df!(
        "id" => oof_ids.as_slice(),
        "pred" => &[0.1, 0.2, 0.3, 0.4, 0.5, 0.9, 0.8, 0.45, 0.15],
        "target" => &targets[..]
    )
    .unwrap();

    let oof = vec![("a".to_string(), a_oof), ("b".to_string(), b_oof)];
    let subs = vec![
        ("a".to_string(), sub_df(&[0.2, 0.4, 0.6, 0.8, 1.0])),
        ("b".to_string(), sub_df(&[0.5, 0.4, 0.3, 0.2, 0.1])),
    ];

    // high threshold keeps both models despite their shared negative half
    let config = PipelineConfig::default()
        .with_corr_threshold(0.99)
        .with_optimizer(Some(OptimizerConfig::default().with_restarts(4).with_seed(0)));
    let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

    assert!((report.metrics.overall_score("a") - 0.70).abs() < 1e-9);
    assert!((report.metrics.overall_score("b") - 0.75).abs() < 1e-9);

    // mean is the elementwise average; best_single is b's submission verbatim
    for (out, expect) in report.blends["mean"].preds.iter().zip([0.35, 0.4, 0.45, 0.5, 0.55]) {
        assert!((out - expect).abs() < 1e-12);
    }
    for (out, orig) in report.blends["best_single"].preds.iter().zip([0.5, 0.4, 0.3, 0.2, 0.1]) {
        assert!((out - orig).abs() < 1e-12);
    }

    // the simplex corner that puts everything on "b" scores 0.75, and the
    // search must do at least that well
    let optimized = report.optimized.computed().unwrap();
    assert!(optimized.score >= 0.75 - 1e-9);
}

#[test]
fn test_pipeline_optimizer_is_reproducible() {
    let (oof, subs) = standard_inputs();
    let config = || {
        PipelineConfig::default()
            .with_optimizer(Some(OptimizerConfig::default().with_restarts(4).with_seed(11)))
    };
    let r1 = BlendPipeline::new(config()).run(&oof, &subs).unwrap();
    let r2 = BlendPipeline::new(config()).run(&oof, &subs).unwrap();

    let (w1, w2) = (
        r1.optimized.computed().unwrap(),
        r2.optimized.computed().unwrap(),
    );
    assert_eq!(w1.score, w2.score);
    for (name, w) in &w1.weights.0 {
        assert_eq!(*w, w2.weights.get(name));
    }
}

// ============================================================================
// Decorrelation and model selection
// ============================================================================

#[test]
fn test_pipeline_prunes_duplicate_models() {
    let (mut oof, mut subs) = standard_inputs();
    // "c" is an exact copy of "a"
    oof.push(("c".to_string(), oof_df(&A_OOF)));
    subs.push(("c".to_string(), sub_df(&[0.2, 0.8, 0.4, 0.6])));

    let report = BlendPipeline::new(PipelineConfig::default().with_optimizer(None))
        .run(&oof, &subs)
        .unwrap();

    assert_eq!(report.retained_models, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(report.dropped_models, vec!["c".to_string()]);
    assert!((report.correlations.values.diag().sum() - 3.0).abs() < 1e-12);
}

// ============================================================================
// Optional stages
// ============================================================================

#[test]
fn test_pipeline_with_stacking() {
    let (oof, subs) = standard_inputs();
    let config = PipelineConfig::default()
        .with_optimizer(None)
        .with_stacking(Some(StackingConfig::default()));
    let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

    let coef = report.stacking.computed().unwrap();
    assert_eq!(coef.weights.len(), 2);
    assert!(report.blends.contains_key("stacking"));
    assert_eq!(report.blends["stacking"].preds.len(), 4);
}

#[test]
fn test_pipeline_with_stability() {
    let oof = vec![
        ("a".to_string(), timed_oof_df(&A_OOF)),
        ("b".to_string(), timed_oof_df(&B_OOF)),
    ];
    let subs = vec![
        ("a".to_string(), sub_df(&[0.2, 0.8, 0.4, 0.6])),
        ("b".to_string(), sub_df(&[0.6, 0.4, 0.2, 0.9])),
    ];
    let config = PipelineConfig::default()
        .with_optimizer(None)
        .with_stability(Some(StabilityConfig::default().with_min_rows(2)));
    let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

    let stability = report.stability.computed().unwrap();
    assert_eq!(stability.n_windows, 2);
    assert_eq!(stability.skipped_windows, 0);
    for method in &stability.methods {
        assert_eq!(method.window_scores.len(), 2);
        assert!((0.0..=1.0).contains(&method.dominance));
    }
}

#[test]
fn test_pipeline_stability_without_timestamps_is_skipped() {
    let (oof, subs) = standard_inputs();
    let config = PipelineConfig::default()
        .with_optimizer(None)
        .with_stability(Some(StabilityConfig::default()));
    let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

    assert!(!report.stability.is_computed());
    // the rest of the run is unaffected
    assert!(report.blends.contains_key("mean"));
}

// ============================================================================
// Reporting
// ============================================================================

#[test]
fn test_report_serializes_to_json() {
    let (oof, subs) = standard_inputs();
    let config = PipelineConfig::default()
        .with_optimizer(Some(OptimizerConfig::default().with_restarts(2)));
    let report = BlendPipeline::new(config).run(&oof, &subs).unwrap();

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("retained_models"));
    assert!(json.contains("best_single"));
}

#[test]
fn test_blend_result_to_dataframe() {
    let (oof, subs) = standard_inputs();
    let report = BlendPipeline::new(PipelineConfig::default().with_optimizer(None))
        .run(&oof, &subs)
        .unwrap();

    let df = report.best.1.to_dataframe().unwrap();
    assert_eq!(df.height(), 4);
    assert_eq!(df.get_column_names().len(), 2);
}
