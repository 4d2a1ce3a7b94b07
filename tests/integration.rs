//! End-to-end integration tests for the khepri engine.
//!
//! These tests exercise the full pipeline from registration through
//! hierarchy computation, trace learning, scoring, and emergence metrics,
//! validating that the graph store, model, and facade all work together.

use khepri::engine::{Engine, EngineConfig};
use khepri::error::{GraphError, KhepriError};
use khepri::graph::{CapabilityOptions, EdgeSource, EdgeType};
use khepri::shgat::ShgatConfig;
use khepri::trace::TraceEvent;

fn test_engine() -> Engine {
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
        ..Default::default()
    })
    .unwrap()
}

fn tool_end(trace: &str, parent: Option<&str>, tool: &str, ts: u64) -> TraceEvent {
    TraceEvent::ToolEnd {
        trace_id: trace.into(),
        parent_trace_id: parent.map(Into::into),
        tool_id: tool.into(),
        timestamp_ms: ts,
        duration_ms: 25,
        success: true,
        error: None,
        provides_to: None,
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

#[test]
fn nested_capability_levels() {
    // A = {t1, t2}, B = {t1, A}, C = {B}.
    let engine = test_engine();
    for t in ["t1", "t2"] {
        engine.register_tool(t, None, None).unwrap();
    }
    engine
        .register_capability(
            "A",
            CapabilityOptions {
                members: vec!["t1".into(), "t2".into()],
                ..Default::default()
            },
        )
        .unwrap();
    engine
        .register_capability(
            "B",
            CapabilityOptions {
                members: vec!["t1".into(), "A".into()],
                ..Default::default()
            },
        )
        .unwrap();
    engine
        .register_capability(
            "C",
            CapabilityOptions {
                members: vec!["B".into()],
                ..Default::default()
            },
        )
        .unwrap();

    let graph = engine.graph();
    assert_eq!(graph.capability("A").unwrap().level, 0);
    assert_eq!(graph.capability("B").unwrap().level, 1);
    assert_eq!(graph.capability("C").unwrap().level, 2);
    assert_eq!(graph.max_level(), 2);

    // Running the computation again changes nothing.
    let levels = engine.recompute_hierarchy().unwrap();
    assert_eq!(levels.max_level, 2);
    assert_eq!(levels.levels["B"], 1);
}

#[test]
fn containment_cycle_is_rejected_with_path() {
    let engine = test_engine();
    engine.register_tool("t", None, None).unwrap();
    engine
        .register_capability(
            "X",
            CapabilityOptions {
                members: vec!["t".into()],
                ..Default::default()
            },
        )
        .unwrap();
    engine
        .register_capability(
            "Y",
            CapabilityOptions {
                members: vec!["X".into()],
                ..Default::default()
            },
        )
        .unwrap();

    // Re-declare X = {Y}: closes X → Y → X.
    let err = engine
        .register_capability(
            "X",
            CapabilityOptions {
                members: vec!["Y".into()],
                ..Default::default()
            },
        )
        .unwrap_err();
    match err {
        KhepriError::Graph(GraphError::HierarchyCycle { path, .. }) => {
            assert_eq!(path.len(), 2);
            assert!(path.contains(&"X".to_string()));
            assert!(path.contains(&"Y".to_string()));
        }
        other => panic!("expected HierarchyCycle, got {other:?}"),
    }
    // Nothing was corrupted: levels still reflect the pre-error state.
    assert_eq!(engine.graph().capability("X").unwrap().level, 0);
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[test]
fn scoring_is_deterministic_and_ordered() {
    let engine = test_engine();
    for t in ["read", "parse", "write"] {
        engine.register_tool(t, None, None).unwrap();
    }
    engine
        .register_capability(
            "ingest",
            CapabilityOptions {
                members: vec!["read".into(), "parse".into()],
                ..Default::default()
            },
        )
        .unwrap();
    engine
        .register_capability(
            "publish",
            CapabilityOptions {
                members: vec!["write".into()],
                ..Default::default()
            },
        )
        .unwrap();

    let intent = engine.embed("ingest a document");
    let first = engine.score_intent(&intent).unwrap();
    let second = engine.score_intent(&intent).unwrap();
    assert_eq!(first, second, "same params and intent must rank identically");

    assert_eq!(first.len(), 2);
    for pair in first.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    let tools = engine.score_tools(&intent).unwrap();
    assert_eq!(tools.len(), 3);
}

// ---------------------------------------------------------------------------
// Trace learning → prediction loop
// ---------------------------------------------------------------------------

#[test]
fn traces_reshape_the_graph_and_predictions() {
    let engine = test_engine();
    let batch = vec![
        TraceEvent::CapabilityEnd {
            trace_id: "root".into(),
            parent_trace_id: None,
            capability_id: "deploy".into(),
            timestamp_ms: 0,
            duration_ms: 500,
            success: true,
            error: None,
            provides_to: None,
        },
        tool_end("s1", Some("root"), "git_pull", 1),
        tool_end("s2", Some("root"), "build", 2),
        tool_end("s3", Some("root"), "upload", 3),
    ];
    let report = engine.process_trace_batch(&batch).unwrap();
    assert_eq!(report.nodes_created, 4);
    assert!(report.edges_created > 0);

    // Replay is a no-op (idempotence).
    let graph = engine.graph();
    let before = graph
        .get_edge_data("git_pull", "build", EdgeType::Sequence)
        .unwrap();
    let replay = engine.process_trace_batch(&batch).unwrap();
    assert!(replay.replayed);
    let after = graph
        .get_edge_data("git_pull", "build", EdgeType::Sequence)
        .unwrap();
    assert_eq!(before.count, after.count);
    assert_eq!(before.weight, after.weight);

    // The learned sequence now drives prediction.
    let predictions = engine.predict_next(&["git_pull".into()], &[]);
    assert!(predictions.iter().any(|p| p.tool_id == "build"));
}

#[test]
fn reinforcement_follows_the_hit_rule() {
    let engine = test_engine();
    let graph = engine.graph();
    graph.register_tool("a", None).unwrap();
    graph.register_tool("b", None).unwrap();

    // Fresh learned edge at 0.5.
    let fresh = graph.reinforce("a", "b").unwrap();
    assert_eq!(fresh.source, EdgeSource::Learned);
    assert!((fresh.weight - 0.5).abs() < 1e-6);

    // Boost multiplies by 1.05 and caps at 0.95.
    let boosted = graph.reinforce("a", "b").unwrap();
    assert!((boosted.weight - 0.525).abs() < 1e-6);
    for _ in 0..200 {
        graph.reinforce("a", "b").unwrap();
    }
    let capped = graph.get_edge_data("a", "b", EdgeType::Sequence).unwrap();
    assert!(capped.weight <= 0.95 + 1e-6);
}

// ---------------------------------------------------------------------------
// Emergence
// ---------------------------------------------------------------------------

#[test]
fn complete_graph_emergence_sanity() {
    // Complete graph on 5 tools with unit weights: the degree distribution
    // is uniform, so structural entropy normalizes to 1.0.
    let engine = test_engine();
    let graph = engine.graph();
    let ids: Vec<String> = (0..5).map(|i| format!("t{i}")).collect();
    for id in &ids {
        graph.register_tool(id.clone(), None).unwrap();
    }
    for i in 0..5 {
        for j in i + 1..5 {
            graph
                .add_edge(
                    &ids[i],
                    &ids[j],
                    khepri::graph::EdgeUpsert {
                        edge_type: EdgeType::Cooccurrence,
                        source: EdgeSource::Observed,
                        count: 1,
                        weight: Some(1.0),
                    },
                )
                .unwrap();
        }
    }

    let payload = engine.emergence().unwrap();
    assert!((payload.metrics.structural_entropy - 1.0).abs() < 1e-3);
    // K5's normalized Laplacian spectrum is uniform over 4 nonzero points.
    assert!((payload.metrics.tensor_entropy - 2.0).abs() < 1e-2);
    // First observation: stability baseline.
    assert_eq!(payload.metrics.cluster_stability, 1.0);

    // Unchanged graph: second evaluation is fully stable.
    let second = engine.emergence().unwrap();
    assert_eq!(second.metrics.cluster_stability, 1.0);
    assert_eq!(second.metrics.tensor_entropy, payload.metrics.tensor_entropy);
}

#[test]
fn snapshot_carries_all_node_metadata() {
    let engine = test_engine();
    engine.register_tool("x", None, Some("server-1")).unwrap();
    engine.register_tool("y", None, None).unwrap();
    engine
        .register_capability(
            "cap",
            CapabilityOptions {
                name: Some("Cap".into()),
                members: vec!["x".into(), "y".into()],
                ..Default::default()
            },
        )
        .unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.nodes.len(), 3);
    let x = snapshot.nodes.iter().find(|n| n.id == "x").unwrap();
    assert_eq!(x.server.as_deref(), Some("server-1"));
    assert!(x.pagerank >= 0.0);
    for node in &snapshot.nodes {
        assert!(node.community_id < 16, "hash communities use 16 buckets");
    }
    assert_eq!(snapshot.metadata.node_count, 3);
    assert!(snapshot.metadata.density > 0.0);
}
