//! Speculation integration tests: the engine-level loop from prediction
//! through sandboxed execution to consumption and reinforcement.

use std::time::Duration;

use khepri::config::SpeculationConfig;
use khepri::engine::{Engine, EngineConfig};
use khepri::graph::{CapabilityOptions, EdgeType};
use khepri::predict::{PredictedNode, PredictionSource};
use khepri::shgat::ShgatConfig;
use serde_json::json;

fn engine_with(speculation: SpeculationConfig) -> Engine {
    Engine::new(EngineConfig {
        embedding_dim: 8,
        shgat: ShgatConfig {
            embedding_dim: 8,
            scoring_dim: 4,
            num_heads: 2,
            num_layers: 1,
            dropout: 0.0,
            ..Default::default()
        },
        speculation,
        ..Default::default()
    })
    .unwrap()
}

fn predicted(tool_id: &str, confidence: f32) -> PredictedNode {
    PredictedNode {
        tool_id: tool_id.into(),
        confidence,
        reasoning: "test".into(),
        source: PredictionSource::Learned,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn capability_snippet_speculation_hit() {
    let engine = engine_with(SpeculationConfig::default());
    engine.register_tool("seed", None, None).unwrap();
    engine.register_tool("aux", None, None).unwrap();
    engine
        .register_capability(
            "calc",
            CapabilityOptions {
                members: vec!["aux".into()],
                snippet: Some("context.base * 2 + 1".into()),
                ..Default::default()
            },
        )
        .unwrap();

    let started = engine.start_speculations(
        &[predicted("calc", 0.9)],
        &json!({ "base": 20 }),
        Some("seed"),
    );
    assert_eq!(started, 1);
    settle().await;

    // The main path picks the prediction: consume the cached result.
    let result = engine.validate_and_consume("calc", Some("seed"));
    assert_eq!(result, Some(json!(41)));

    let metrics = engine.speculation_metrics();
    assert_eq!(metrics.total_hits, 1);
    assert_eq!(metrics.total_misses, 0);
    assert_eq!(metrics.total_speculations, 1);
    assert!((metrics.hit_rate - 1.0).abs() < 1e-6);

    // The hit reinforced seed → calc as a learned sequence edge.
    let edge = engine
        .graph()
        .get_edge_data("seed", "calc", EdgeType::Sequence)
        .unwrap();
    assert!((edge.weight - 0.5).abs() < 1e-6);

    // Exactly-once consumption.
    assert!(engine.check_speculation_cache("calc").is_none());
}

#[tokio::test]
async fn threshold_and_cap_filtering() {
    // confidence_threshold 0.70, max 2 concurrent: of [a 0.8, b 0.6,
    // c 0.75] only a and c run.
    let engine = engine_with(SpeculationConfig {
        confidence_threshold: 0.70,
        max_concurrent_speculations: 2,
        ..Default::default()
    });
    for (id, snippet) in [("a", "1"), ("b", "2"), ("c", "3")] {
        engine.register_tool("aux", None, None).unwrap();
        engine
            .register_capability(
                id,
                CapabilityOptions {
                    members: vec!["aux".into()],
                    snippet: Some(snippet.into()),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    let started = engine.start_speculations(
        &[predicted("a", 0.8), predicted("b", 0.6), predicted("c", 0.75)],
        &json!({}),
        None,
    );
    assert_eq!(started, 2);
    settle().await;

    assert!(engine.check_speculation_cache("a").is_some());
    assert!(engine.check_speculation_cache("b").is_none());
    assert!(engine.check_speculation_cache("c").is_some());
}

#[tokio::test]
async fn dangerous_operations_never_speculate() {
    let engine = engine_with(SpeculationConfig::default());
    engine.register_tool("aux", None, None).unwrap();
    engine
        .register_capability(
            "delete_user",
            CapabilityOptions {
                members: vec!["aux".into()],
                snippet: Some("1".into()),
                ..Default::default()
            },
        )
        .unwrap();

    let started =
        engine.start_speculations(&[predicted("delete_user", 0.95)], &json!({}), None);
    assert_eq!(started, 0);
    settle().await;
    assert!(engine.check_speculation_cache("delete_user").is_none());
    assert_eq!(engine.speculation_metrics().total_speculations, 0);
}

#[tokio::test]
async fn failed_sandbox_runs_never_reach_the_main_path() {
    let engine = engine_with(SpeculationConfig::default());
    engine.register_tool("aux", None, None).unwrap();
    engine
        .register_capability(
            "broken",
            CapabilityOptions {
                members: vec!["aux".into()],
                snippet: Some("1 / 0".into()),
                ..Default::default()
            },
        )
        .unwrap();

    let started = engine.start_speculations(&[predicted("broken", 0.9)], &json!({}), None);
    assert_eq!(started, 1);
    settle().await;

    // The failure was swallowed: no cache entry, no miss until consumption.
    assert!(engine.check_speculation_cache("broken").is_none());
    assert_eq!(engine.speculation_metrics().total_misses, 0);

    // Consuming the absent slot is the miss.
    assert!(engine.validate_and_consume("broken", None).is_none());
    assert_eq!(engine.speculation_metrics().total_misses, 1);
}

#[tokio::test]
async fn abort_all_discards_pending_work() {
    let engine = engine_with(SpeculationConfig::default());
    engine.register_tool("aux", None, None).unwrap();
    engine
        .register_capability(
            "job",
            CapabilityOptions {
                members: vec!["aux".into()],
                snippet: Some("7".into()),
                ..Default::default()
            },
        )
        .unwrap();

    engine.start_speculations(&[predicted("job", 0.9)], &json!({}), None);
    settle().await;
    assert!(engine.check_speculation_cache("job").is_some());

    // Workflow failure: everything goes.
    engine.abort_speculations();
    assert!(engine.check_speculation_cache("job").is_none());
}
