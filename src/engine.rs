//! Engine facade: top-level API for the khepri recommender.
//!
//! The `Engine` owns all subsystems — graph store, capability catalog,
//! SHGAT model, trace learner, emergence tracker, speculation manager and
//! executor, sandbox bridge — and serializes every mutation per owner:
//! the graph behind its own lock, the model behind an `RwLock`, the
//! emergence tracker behind a `Mutex`. Readers never observe a partially
//! applied edge upsert or parameter import.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::catalog::CapabilityStore;
use crate::config::SpeculationConfig;
use crate::embed::{Embedder, HashEmbedder};
use crate::emergence::{EmergencePayload, EmergenceTracker, Hyperedge, assemble_payload};
use crate::error::{EngineError, KhepriResult, SandboxError};
use crate::graph::hierarchy::HierarchyLevels;
use crate::graph::store::{GraphLimits, GraphStore};
use crate::graph::{CapabilityOptions, GraphSnapshot};
use crate::math;
use crate::predict::{PredictedNode, Predictor, PredictorConfig};
use crate::sandbox::worker::{SandboxBridge, SandboxLimits, ToolDef, ToolRouter};
use crate::shgat::scorer::{CandidateStats, ScoredCandidate};
use crate::shgat::trainer::{TrainOutcome, Trainer, TrainerOptions};
use crate::shgat::{GraphFeatures, ShgatConfig, ShgatModel, TrainingExample};
use crate::speculate::executor::{
    ExecutorConfig, RunFuture, SpeculativeExecutor, SpeculativeRunner,
};
use crate::speculate::manager::{SpeculationManager, SpeculationMetrics};
use crate::store::{MemParamStore, ParamStore, RedbParamStore};
use crate::trace::TraceEvent;
use crate::trace::learner::{LearnReport, TraceLearner};

/// Configuration for the khepri engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedding dimension `D`; applied to the graph and the model.
    pub embedding_dim: usize,
    /// Data directory for persistence. `None` for memory-only mode.
    pub data_dir: Option<PathBuf>,
    /// Graph capacity limits.
    pub max_nodes: usize,
    pub max_edges: usize,
    /// Model and trainer hyperparameters.
    pub shgat: ShgatConfig,
    /// Speculation gating config (usually loaded from YAML).
    pub speculation: SpeculationConfig,
    /// Sandbox resource limits.
    pub sandbox: SandboxLimits,
    /// Prediction facade knobs.
    pub predictor: PredictorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1024,
            data_dir: None,
            max_nodes: 100_000,
            max_edges: 1_000_000,
            shgat: ShgatConfig::default(),
            speculation: SpeculationConfig::default(),
            sandbox: SandboxLimits::default(),
            predictor: PredictorConfig::default(),
        }
    }
}

/// The khepri self-learning recommender engine.
pub struct Engine {
    config: EngineConfig,
    graph: Arc<GraphStore>,
    catalog: Arc<CapabilityStore>,
    learner: TraceLearner,
    emergence: Mutex<EmergenceTracker>,
    model: RwLock<ShgatModel>,
    predictor: Predictor,
    spec_manager: Arc<SpeculationManager>,
    executor: SpeculativeExecutor,
    router: Arc<ToolRouter>,
    params: Arc<dyn ParamStore>,
    embedder: Arc<dyn Embedder>,
    events_tx: broadcast::Sender<TraceEvent>,
}

impl Engine {
    /// Create a new engine with the given configuration.
    pub fn new(mut config: EngineConfig) -> KhepriResult<Self> {
        if config.embedding_dim == 0 {
            return Err(EngineError::InvalidConfig {
                message: "embedding_dim must be > 0".into(),
            }
            .into());
        }
        config.speculation.validate()?;
        // One dimension rules them all.
        config.shgat.embedding_dim = config.embedding_dim;

        let kernel = math::best_kernel();
        tracing::info!(
            backend = %kernel.backend(),
            dim = config.embedding_dim,
            "initializing khepri engine"
        );

        let graph = Arc::new(GraphStore::with_limits(GraphLimits {
            max_nodes: config.max_nodes,
            max_edges: config.max_edges,
            embedding_dim: Some(config.embedding_dim),
        }));
        let catalog = Arc::new(CapabilityStore::new(Arc::clone(&graph)));

        let params: Arc<dyn ParamStore> = if let Some(ref dir) = config.data_dir {
            std::fs::create_dir_all(dir).map_err(|_| EngineError::DataDir {
                path: dir.display().to_string(),
            })?;
            Arc::new(RedbParamStore::open(&dir.join("params.redb"))?)
        } else {
            Arc::new(MemParamStore::new())
        };

        let (events_tx, _) = broadcast::channel(1024);
        let router = Arc::new(ToolRouter::new());
        let sandbox = Arc::new(
            SandboxBridge::new(Arc::clone(&router), config.sandbox.clone())
                .with_trace_channel(events_tx.clone()),
        );

        let spec_manager = Arc::new(
            SpeculationManager::new(config.speculation.clone()).with_graph(Arc::clone(&graph)),
        );
        let runner = Arc::new(SandboxRunner {
            sandbox,
            catalog: Arc::clone(&catalog),
            graph: Arc::clone(&graph),
        });
        let executor = SpeculativeExecutor::new(
            ExecutorConfig {
                timeout_ms: config.speculation.speculation_timeout,
                max_concurrent: config.speculation.max_concurrent_speculations,
                memory_limit_mb: config.sandbox.memory_limit_mb,
                ..Default::default()
            },
            Arc::clone(&spec_manager),
            runner,
        );

        let model = ShgatModel::new(config.shgat.clone(), 0, Arc::clone(&kernel));
        let predictor = Predictor::new(
            Arc::clone(&graph),
            Arc::clone(&catalog),
            config.predictor.clone(),
        );

        Ok(Self {
            embedder: Arc::new(HashEmbedder::new(config.embedding_dim)),
            config,
            graph,
            catalog,
            learner: TraceLearner::new(),
            emergence: Mutex::new(EmergenceTracker::new()),
            model: RwLock::new(model),
            predictor,
            spec_manager,
            executor,
            router,
            params,
            events_tx,
        })
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register a tool, optionally with its embedding and MCP server id.
    pub fn register_tool(
        &self,
        id: &str,
        embedding: Option<Vec<f32>>,
        server: Option<&str>,
    ) -> KhepriResult<()> {
        match server {
            Some(server) => self.graph.register_tool_with_server(id, embedding, server)?,
            None => self.graph.register_tool(id, embedding)?,
        }
        Ok(())
    }

    /// Register a capability (cycle-checked; recomputes hierarchy levels).
    pub fn register_capability(
        &self,
        id: &str,
        options: CapabilityOptions,
    ) -> KhepriResult<()> {
        self.graph.register_capability(id, options)?;
        Ok(())
    }

    /// Recompute hierarchy levels explicitly.
    pub fn recompute_hierarchy(&self) -> KhepriResult<HierarchyLevels> {
        Ok(self.graph.recompute_hierarchy()?)
    }

    // -----------------------------------------------------------------------
    // Scoring & prediction
    // -----------------------------------------------------------------------

    /// Embed free text with the engine's embedder.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.embed(text)
    }

    /// Rank all capabilities against an intent embedding, best first.
    pub fn score_intent(&self, intent: &[f32]) -> KhepriResult<Vec<ScoredCandidate>> {
        self.ensure_model_levels()?;
        let features = GraphFeatures::from_store(&self.graph, self.config.embedding_dim)?;
        let model = self.model.read().expect("model lock poisoned");
        let output = model.forward(&features)?;
        Ok(model.score_all_capabilities(&features, &output, intent)?)
    }

    /// Rank all tools against an intent embedding, best first.
    pub fn score_tools(&self, intent: &[f32]) -> KhepriResult<Vec<ScoredCandidate>> {
        self.ensure_model_levels()?;
        let features = GraphFeatures::from_store(&self.graph, self.config.embedding_dim)?;
        let model = self.model.read().expect("model lock poisoned");
        let output = model.forward(&features)?;
        Ok(model.score_all_tools(&features, &output, intent)?)
    }

    /// Context-aware capability ranking: the attention logits augmented by
    /// the fusion MLP over each candidate's historical stats and its
    /// overlap with the running tool context.
    pub fn score_intent_with_context(
        &self,
        intent: &[f32],
        context_tools: &[String],
    ) -> KhepriResult<Vec<ScoredCandidate>> {
        self.ensure_model_levels()?;
        let features = GraphFeatures::from_store(&self.graph, self.config.embedding_dim)?;
        let model = self.model.read().expect("model lock poisoned");
        let output = model.forward(&features)?;

        let now = crate::graph::now_secs();
        let graph = Arc::clone(&self.graph);
        let catalog = Arc::clone(&self.catalog);
        let context: Vec<String> = context_tools.to_vec();
        let stats = move |id: &str| -> CandidateStats {
            let Some(cap) = graph.capability(id) else {
                return CandidateStats::default();
            };
            let recency = cap
                .last_executed
                .map(|t| 1.0 / (1.0 + now.saturating_sub(t) as f32 / 3_600.0))
                .unwrap_or(0.0);
            let usage = (cap.execution_count as f32 / 100.0).min(1.0);
            let context_overlap = if context.is_empty() {
                0.0
            } else {
                let members = catalog.tool_members(id);
                let hits = members.iter().filter(|m| context.contains(m)).count();
                let union = members.len() + context.len() - hits;
                if union == 0 { 0.0 } else { hits as f32 / union as f32 }
            };
            CandidateStats {
                success_rate: cap.success_rate,
                recency,
                usage,
                context_overlap,
            }
        };
        Ok(model.score_all_capabilities_v2(&features, &output, intent, &stats)?)
    }

    /// Predict likely next tools for a running workflow.
    pub fn predict_next(
        &self,
        context_tools: &[String],
        completed_tasks: &[String],
    ) -> Vec<PredictedNode> {
        self.predictor.predict_next_nodes(context_tools, completed_tasks)
    }

    // -----------------------------------------------------------------------
    // Traces & emergence
    // -----------------------------------------------------------------------

    /// Learn graph edges from one batch of trace events and broadcast them
    /// to the event stream.
    pub fn process_trace_batch(&self, events: &[TraceEvent]) -> KhepriResult<LearnReport> {
        let report = self.learner.process_batch(&self.graph, events)?;
        if !report.replayed {
            for event in events {
                let _ = self.events_tx.send(event.clone());
            }
        }
        Ok(report)
    }

    /// Evaluate emergence metrics for the current graph, advancing the
    /// tracker state (stability baseline, entropy history).
    pub fn emergence(&self) -> KhepriResult<EmergencePayload> {
        let snapshot = self.graph.snapshot();
        let hyperedges: Vec<Hyperedge> = self
            .graph
            .capability_ids()
            .into_iter()
            .filter_map(|id| {
                let members = self.catalog.tool_members(&id);
                (members.len() >= 2).then(|| Hyperedge {
                    id,
                    members,
                    weight: 1.0,
                })
            })
            .collect();
        let mut tracker = self.emergence.lock().expect("emergence lock poisoned");
        let report = tracker.observe(&snapshot, &hyperedges)?;
        Ok(assemble_payload(report, &tracker))
    }

    /// Export the current graph snapshot.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    // -----------------------------------------------------------------------
    // Speculation
    // -----------------------------------------------------------------------

    /// Start speculative executions for gated predictions.
    pub fn start_speculations(
        &self,
        predictions: &[PredictedNode],
        context: &Value,
        last_completed_tool: Option<&str>,
    ) -> usize {
        let gate_input: Vec<_> = predictions.iter().map(PredictedNode::to_prediction).collect();
        self.executor
            .start_speculations(&gate_input, context, last_completed_tool)
    }

    /// Consume a speculative result exactly once; absent entries count as
    /// misses.
    pub fn validate_and_consume(
        &self,
        tool_id: &str,
        from_tool_id: Option<&str>,
    ) -> Option<Value> {
        self.executor.validate_and_consume(tool_id, from_tool_id)
    }

    /// Non-consuming cache probe.
    pub fn check_speculation_cache(&self, tool_id: &str) -> Option<Value> {
        self.executor.check_cache(tool_id)
    }

    /// Abort one in-flight speculation.
    pub fn abort_speculation(&self, tool_id: &str) {
        self.executor.abort_speculation(tool_id);
    }

    /// Abort everything and drop the cache (workflow failure path).
    pub fn abort_speculations(&self) {
        self.executor.abort_all();
        self.executor.discard_cache();
    }

    /// Current speculation metrics.
    pub fn speculation_metrics(&self) -> SpeculationMetrics {
        self.spec_manager.metrics()
    }

    /// Router for wiring MCP clients (external transports).
    pub fn tool_router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    // -----------------------------------------------------------------------
    // Training & parameters
    // -----------------------------------------------------------------------

    /// Run training in-process (the worker binary wraps this).
    pub fn train(
        &self,
        examples: &[TrainingExample],
        options: TrainerOptions,
    ) -> KhepriResult<TrainOutcome> {
        self.ensure_model_levels()?;
        let trainer = Trainer::new(options);
        let mut model = self.model.write().expect("model lock poisoned");
        Ok(trainer.train(&mut model, &self.graph, examples)?)
    }

    /// Persist the current parameters for a user.
    pub fn save_params(&self, user_id: &str) -> KhepriResult<()> {
        let blob = {
            let model = self.model.read().expect("model lock poisoned");
            crate::shgat::params::serialize_tensor_map(&model.export_params())
        };
        self.params.put_params(user_id, &blob)?;
        Ok(())
    }

    /// Load persisted parameters for a user, if present. Returns whether
    /// anything was loaded; shape mismatches fail without mutating.
    pub fn load_params(&self, user_id: &str) -> KhepriResult<bool> {
        let Some(blob) = self.params.get_params(user_id)? else {
            return Ok(false);
        };
        let map = crate::shgat::params::deserialize_tensor_map(&blob)?;
        let mut model = self.model.write().expect("model lock poisoned");
        model.import_params(&map)?;
        Ok(true)
    }

    /// The parameter store handle (shared with the training worker).
    pub fn param_store(&self) -> &Arc<dyn ParamStore> {
        &self.params
    }

    /// Subscribe to the live trace/event stream.
    pub fn events(&self) -> broadcast::Receiver<TraceEvent> {
        self.events_tx.subscribe()
    }

    /// The shared graph store.
    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    /// The capability catalog.
    pub fn catalog(&self) -> &Arc<CapabilityStore> {
        &self.catalog
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Rebuild the model when the hierarchy has grown past the parameter
    /// block's levels. Scorer and message-passing parameters reinitialize
    /// from the configured seed; persisted parameters for the old shape
    /// stay importable until the next save.
    fn ensure_model_levels(&self) -> KhepriResult<()> {
        let max_level = self.graph.max_level();
        let needs_rebuild = {
            let model = self.model.read().expect("model lock poisoned");
            model.params.max_level() < max_level
        };
        if needs_rebuild {
            tracing::info!(max_level, "hierarchy grew; rebuilding model parameters");
            let kernel = {
                let model = self.model.read().expect("model lock poisoned");
                Arc::clone(model.kernel())
            };
            let rebuilt = ShgatModel::new(self.config.shgat.clone(), max_level, kernel);
            *self.model.write().expect("model lock poisoned") = rebuilt;
        }
        Ok(())
    }
}

/// Wires the speculative executor to the sandbox bridge: capability
/// predictions run their snippet, bare tools run a synthesized call.
struct SandboxRunner {
    sandbox: Arc<SandboxBridge>,
    catalog: Arc<CapabilityStore>,
    graph: Arc<GraphStore>,
}

impl SpeculativeRunner for SandboxRunner {
    fn run(&self, tool_id: &str, context: &Value) -> RunFuture {
        let snippet = self
            .graph
            .capability(tool_id)
            .and_then(|c| c.snippet)
            .unwrap_or_else(|| format!("tools.{tool_id}(context.input)"));
        let tool_defs: Vec<ToolDef> = self
            .graph
            .tool_ids()
            .into_iter()
            .map(|name| {
                let server_id = self
                    .graph
                    .tool(&name)
                    .and_then(|t| t.server)
                    .unwrap_or_else(|| "local".to_string());
                ToolDef { name, server_id }
            })
            .collect();
        let capabilities = self.catalog.snippets();
        let sandbox = Arc::clone(&self.sandbox);
        let context = context.clone();
        Box::pin(async move {
            let outcome = sandbox
                .execute(&snippet, &tool_defs, context, capabilities)
                .await;
            if outcome.success {
                Ok(outcome.result.unwrap_or(Value::Null))
            } else {
                Err(SandboxError::Script {
                    message: outcome
                        .error
                        .unwrap_or_else(|| "sandbox execution failed".into()),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EngineConfig {
        EngineConfig {
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
        }
    }

    #[test]
    fn engine_rejects_zero_dimension() {
        let config = EngineConfig {
            embedding_dim: 0,
            ..small_config()
        };
        assert!(Engine::new(config).is_err());
    }

    #[test]
    fn score_intent_ranks_capabilities() {
        let engine = Engine::new(small_config()).unwrap();
        engine.register_tool("read", None, None).unwrap();
        engine.register_tool("write", None, None).unwrap();
        engine
            .register_capability(
                "io",
                CapabilityOptions {
                    members: vec!["read".into(), "write".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let intent = engine.embed("read some files");
        let scored = engine.score_intent(&intent).unwrap();
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].id, "io");
        assert!(scored[0].score.is_finite());

        // Deterministic under the scalar path.
        let again = engine.score_intent(&intent).unwrap();
        assert_eq!(scored, again);
    }

    #[test]
    fn context_scoring_uses_candidate_stats() {
        let engine = Engine::new(small_config()).unwrap();
        engine.register_tool("read", None, None).unwrap();
        engine.register_tool("write", None, None).unwrap();
        engine
            .register_capability(
                "io",
                CapabilityOptions {
                    members: vec!["read".into(), "write".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        engine.graph().record_capability_outcome("io", true).unwrap();

        let intent = engine.embed("do some io");
        let plain = engine.score_intent(&intent).unwrap();
        let contextual = engine
            .score_intent_with_context(&intent, &["read".into()])
            .unwrap();
        assert_eq!(contextual.len(), plain.len());
        assert!(contextual[0].score.is_finite());
        // The fusion adjustment moves the score away from the plain path.
        assert_ne!(contextual[0].score, plain[0].score);
    }

    #[test]
    fn params_save_and_load_round_trip() {
        let engine = Engine::new(small_config()).unwrap();
        engine.save_params("user-1").unwrap();
        assert!(engine.load_params("user-1").unwrap());
        assert!(!engine.load_params("missing-user").unwrap());
    }

    #[test]
    fn model_rebuilds_when_hierarchy_grows() {
        let engine = Engine::new(small_config()).unwrap();
        engine.register_tool("t", None, None).unwrap();
        engine
            .register_capability(
                "inner",
                CapabilityOptions {
                    members: vec!["t".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        engine
            .register_capability(
                "outer",
                CapabilityOptions {
                    members: vec!["inner".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        // Scoring after the hierarchy grew must not fail.
        let intent = engine.embed("nested work");
        let scored = engine.score_intent(&intent).unwrap();
        assert_eq!(scored.len(), 2);
    }

    #[test]
    fn trace_batch_feeds_prediction() {
        let engine = Engine::new(small_config()).unwrap();
        let events = vec![
            TraceEvent::CapabilityEnd {
                trace_id: "root".into(),
                parent_trace_id: None,
                capability_id: "flow".into(),
                timestamp_ms: 0,
                duration_ms: 100,
                success: true,
                error: None,
                provides_to: None,
            },
            TraceEvent::ToolEnd {
                trace_id: "s1".into(),
                parent_trace_id: Some("root".into()),
                tool_id: "first".into(),
                timestamp_ms: 1,
                duration_ms: 10,
                success: true,
                error: None,
                provides_to: None,
            },
            TraceEvent::ToolEnd {
                trace_id: "s2".into(),
                parent_trace_id: Some("root".into()),
                tool_id: "second".into(),
                timestamp_ms: 2,
                duration_ms: 10,
                success: true,
                error: None,
                provides_to: None,
            },
        ];
        let report = engine.process_trace_batch(&events).unwrap();
        assert_eq!(report.nodes_created, 3);

        let predictions = engine.predict_next(&["first".into()], &[]);
        assert!(predictions.iter().any(|p| p.tool_id == "second"));
    }

    #[test]
    fn emergence_payload_is_complete() {
        let engine = Engine::new(small_config()).unwrap();
        for t in ["a", "b", "c"] {
            engine.register_tool(t, None, None).unwrap();
        }
        engine
            .register_capability(
                "cap",
                CapabilityOptions {
                    members: vec!["a".into(), "b".into(), "c".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        let payload = engine.emergence().unwrap();
        assert!(payload.metrics.tensor_entropy >= 0.0);
        assert_eq!(payload.metrics.cluster_stability, 1.0);
    }
}
