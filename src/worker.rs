//! Training-worker process body: stdin JSON in, stdout JSON out.
//!
//! The worker owns its own copy of the graph structure and parameters for
//! the duration of the run and writes the final serialized parameters
//! straight to the parameter store. The controlling process only ever sees
//! the lightweight result on stdout — large tensor blobs never transit the
//! pipe. Invalid input exits non-zero with a JSON error body.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::graph::store::{GraphLimits, GraphStore};
use crate::graph::CapabilityOptions;
use crate::math;
use crate::shgat::params::serialize_tensor_map;
use crate::shgat::trainer::{HealthCheck, Trainer, TrainerOptions};
use crate::shgat::{ShgatConfig, ShgatModel, TrainingExample};
use crate::store::ParamStore;

/// A tool as shipped to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A capability as shipped to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub id: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Full training request, read from stdin as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainWorkerInput {
    pub user_id: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub capabilities: Vec<CapabilitySpec>,
    pub examples: Vec<TrainingExample>,
    #[serde(default)]
    pub options: Option<TrainerOptions>,
    #[serde(default)]
    pub config: Option<ShgatConfig>,
}

/// Lightweight result written to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainWorkerResult {
    pub success: bool,
    pub final_loss: f32,
    pub final_accuracy: f32,
    pub td_errors: Vec<f32>,
    pub saved_to_db: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrainWorkerResult {
    /// Failure result carrying only the error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            final_loss: 0.0,
            final_accuracy: 0.0,
            td_errors: Vec::new(),
            saved_to_db: false,
            health_check: None,
            error: Some(error.into()),
        }
    }
}

/// Run one training job against a private graph copy, persisting the
/// resulting parameters to the store.
///
/// On detected degradation the trainer has already rolled the model back
/// to the pre-training snapshot, so what gets persisted is that snapshot.
pub fn run_training_job(
    input: &TrainWorkerInput,
    store: &Arc<dyn ParamStore>,
) -> Result<TrainWorkerResult, TrainError> {
    let config = input.config.clone().unwrap_or_default();

    // The worker's own graph copy: nothing here aliases the serving
    // process's store.
    let graph = GraphStore::with_limits(GraphLimits {
        embedding_dim: Some(config.embedding_dim),
        ..Default::default()
    });
    for tool in &input.tools {
        graph
            .register_tool(tool.id.clone(), tool.embedding.clone())
            .map_err(|e| TrainError::InvalidInput {
                message: format!("tool {}: {e}", tool.id),
            })?;
    }
    for cap in &input.capabilities {
        graph
            .register_capability(
                cap.id.clone(),
                CapabilityOptions {
                    members: cap.members.clone(),
                    embedding: cap.embedding.clone(),
                    ..Default::default()
                },
            )
            .map_err(|e| TrainError::InvalidInput {
                message: format!("capability {}: {e}", cap.id),
            })?;
    }
    if input.capabilities.is_empty() && input.tools.is_empty() {
        return Err(TrainError::InvalidInput {
            message: "no tools or capabilities supplied".into(),
        });
    }

    let mut model = ShgatModel::new(config, graph.max_level(), math::best_kernel());
    let trainer = Trainer::new(input.options.clone().unwrap_or_default());
    let outcome = trainer.train(&mut model, &graph, &input.examples)?;

    // Params go straight to the store; stdout carries only the summary.
    let blob = serialize_tensor_map(&model.export_params());
    let saved_to_db = match store.put_params(&input.user_id, &blob) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(user = %input.user_id, error = %e, "failed to persist parameters");
            false
        }
    };

    Ok(TrainWorkerResult {
        success: true,
        final_loss: outcome.final_loss,
        final_accuracy: outcome.final_accuracy,
        td_errors: outcome.td_errors,
        saved_to_db,
        health_check: Some(outcome.health_check),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{Embedder, HashEmbedder};
    use crate::store::MemParamStore;

    fn worker_input() -> TrainWorkerInput {
        let embedder = HashEmbedder::new(8);
        let config = ShgatConfig {
            embedding_dim: 8,
            scoring_dim: 4,
            num_heads: 2,
            num_layers: 1,
            dropout: 0.0,
            ..Default::default()
        };
        TrainWorkerInput {
            user_id: "u-1".into(),
            tools: vec![
                ToolSpec { id: "read".into(), embedding: None },
                ToolSpec { id: "write".into(), embedding: None },
            ],
            capabilities: vec![
                CapabilitySpec {
                    id: "io".into(),
                    members: vec!["read".into(), "write".into()],
                    embedding: None,
                },
                CapabilitySpec {
                    id: "net".into(),
                    members: vec!["read".into()],
                    embedding: None,
                },
            ],
            examples: (0..8)
                .map(|i| {
                    let positive = if i % 2 == 0 { "io" } else { "net" };
                    let negative = if i % 2 == 0 { "net" } else { "io" };
                    TrainingExample {
                        intent_embedding: embedder.embed(&format!("intent {positive} {i}")),
                        context_tools: Vec::new(),
                        candidate_id: positive.into(),
                        outcome: 1,
                        negative_candidates: Some(vec![negative.into()]),
                        all_negatives_sorted_by_similarity: None,
                    }
                })
                .collect(),
            options: Some(TrainerOptions {
                epochs: 2,
                batch_size: 4,
            }),
            config: Some(config),
        }
    }

    #[test]
    fn job_trains_and_persists_params() {
        let store: Arc<dyn ParamStore> = Arc::new(MemParamStore::new());
        let result = run_training_job(&worker_input(), &store).unwrap();
        assert!(result.success);
        assert!(result.saved_to_db);
        assert!(result.health_check.is_some());
        // The blob landed in the store, not in the result.
        assert!(store.get_params("u-1").unwrap().is_some());
        assert!(serde_json::to_string(&result).unwrap().len() < 10_000);
    }

    #[test]
    fn empty_examples_fail_the_job() {
        let store: Arc<dyn ParamStore> = Arc::new(MemParamStore::new());
        let mut input = worker_input();
        input.examples.clear();
        assert!(matches!(
            run_training_job(&input, &store),
            Err(TrainError::InvalidInput { .. })
        ));
        // No partial parameters were persisted.
        assert!(store.get_params("u-1").unwrap().is_none());
    }

    #[test]
    fn input_round_trips_through_json() {
        let input = worker_input();
        let json = serde_json::to_string(&input).unwrap();
        let back: TrainWorkerInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.user_id, input.user_id);
        assert_eq!(back.examples.len(), input.examples.len());
    }
}
