//! Speculative executor: cancellable sandbox runs with a bounded result
//! cache.
//!
//! Single-threaded cooperative model: speculations start non-blocking and
//! run as tokio tasks until completion, timeout, or explicit abort. All
//! three exits release the task slot deterministically; only completion
//! publishes a cache entry, so an aborted or timed-out speculation can
//! never poison the cache. Timeout and abort are semantically equivalent.
//!
//! At most one speculation is in flight per tool id; duplicates are
//! silently dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::SandboxError;
use crate::speculate::manager::SpeculationManager;

use super::{CacheEntry, Prediction, SpeculationOutcome};

/// Boxed future returned by a [`SpeculativeRunner`].
pub type RunFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, SandboxError>> + Send>>;

/// Executes one predicted call inside a sandbox.
///
/// The engine wires this to the sandbox bridge; tests substitute mocks.
/// Implementations must be side-effect free — the dangerous-operation
/// filter has already run, and the sandbox enforces the rest.
pub trait SpeculativeRunner: Send + Sync {
    fn run(&self, tool_id: &str, context: &serde_json::Value) -> RunFuture;
}

/// Executor limits.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-speculation deadline.
    pub timeout_ms: u64,
    /// Concurrent sandbox executions.
    pub max_concurrent: usize,
    /// Memory budget handed to each sandbox.
    pub memory_limit_mb: usize,
    /// Cache TTL for published results.
    pub cache_ttl_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_concurrent: 3,
            memory_limit_mb: 256,
            cache_ttl_ms: 30_000,
        }
    }
}

/// Executor-side counters (the manager owns hit/miss accounting).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    pub active: usize,
    pub cached: usize,
    pub timed_out: u64,
}

struct Inner {
    config: ExecutorConfig,
    manager: Arc<SpeculationManager>,
    runner: Arc<dyn SpeculativeRunner>,
    active: DashMap<String, JoinHandle<()>>,
    cache: DashMap<String, CacheEntry>,
    timed_out: AtomicU64,
    shut_down: AtomicBool,
}

/// Confidence-gated, cancellable speculative execution.
pub struct SpeculativeExecutor {
    inner: Arc<Inner>,
}

impl SpeculativeExecutor {
    pub fn new(
        config: ExecutorConfig,
        manager: Arc<SpeculationManager>,
        runner: Arc<dyn SpeculativeRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                manager,
                runner,
                active: DashMap::new(),
                cache: DashMap::new(),
                timed_out: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start speculations for the gated subset of `predictions`.
    ///
    /// Non-blocking: tasks are spawned and the number actually started is
    /// returned. Must be called from within a tokio runtime.
    pub fn start_speculations(
        &self,
        predictions: &[Prediction],
        context: &serde_json::Value,
        last_completed_tool: Option<&str>,
    ) -> usize {
        if self.inner.shut_down.load(Ordering::Relaxed) {
            return 0;
        }
        let gated = self.inner.manager.filter_for_speculation(predictions);
        let mut started = 0;

        for prediction in gated {
            if self.inner.active.len() >= self.inner.config.max_concurrent {
                break;
            }
            if self.inner.active.contains_key(&prediction.tool_id) {
                continue;
            }
            if self.check_cache(&prediction.tool_id).is_some() {
                continue;
            }

            self.inner.manager.record_started();
            started += 1;

            let inner = Arc::clone(&self.inner);
            let tool_id = prediction.tool_id.clone();
            let confidence = prediction.confidence;
            let context = context.clone();
            let from_tool = last_completed_tool.map(str::to_string);

            let task_tool = tool_id.clone();
            let handle = tokio::spawn(async move {
                let begun = Instant::now();
                let deadline = Duration::from_millis(inner.config.timeout_ms);
                let run = inner.runner.run(&task_tool, &context);
                match tokio::time::timeout(deadline, run).await {
                    Ok(Ok(result)) => {
                        let duration_ms = begun.elapsed().as_millis() as u64;
                        inner.cache.insert(
                            task_tool.clone(),
                            CacheEntry {
                                from_tool_id: from_tool,
                                to_tool_id: task_tool.clone(),
                                result,
                                confidence,
                                created_at: Instant::now(),
                                ttl_ms: inner.config.cache_ttl_ms,
                                duration_ms,
                            },
                        );
                        tracing::debug!(tool = %task_tool, duration_ms, "speculation cached");
                    }
                    Ok(Err(error)) => {
                        // Sandbox failures never reach the main path.
                        tracing::debug!(tool = %task_tool, %error, "speculation failed; swallowed");
                    }
                    Err(_) => {
                        inner.timed_out.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            tool = %task_tool,
                            timeout_ms = inner.config.timeout_ms,
                            "speculation timed out; aborted"
                        );
                    }
                }
                inner.active.remove(&task_tool);
            });

            self.inner.active.insert(tool_id.clone(), handle);
            // The task may have already finished on a multi-threaded
            // runtime; drop the stale handle so the slot frees up.
            if let Some(entry) = self.inner.active.get(&tool_id) {
                if entry.value().is_finished() {
                    drop(entry);
                    self.inner.active.remove(&tool_id);
                }
            }
        }
        started
    }

    /// Non-consuming cache read; expired entries are dropped and read as
    /// absent.
    pub fn check_cache(&self, tool_id: &str) -> Option<serde_json::Value> {
        let expired = match self.inner.cache.get(tool_id) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Some(entry.result.clone()),
            None => return None,
        };
        if expired {
            self.inner.cache.remove(tool_id);
        }
        None
    }

    /// Consume a cached result exactly once.
    ///
    /// A fresh entry is removed atomically and reported as a hit (crediting
    /// the sandboxed execution time as saved); an absent or stale entry is
    /// reported as a miss. A second consume for the same tool id therefore
    /// always returns `None`.
    pub fn validate_and_consume(
        &self,
        tool_id: &str,
        from_tool_id: Option<&str>,
    ) -> Option<serde_json::Value> {
        let removed = self.inner.cache.remove(tool_id);
        match removed {
            Some((_, entry)) if !entry.is_expired() => {
                let outcome = SpeculationOutcome {
                    prediction_id: format!("spec-{tool_id}"),
                    tool_id: tool_id.to_string(),
                    was_correct: true,
                    execution_time_ms: entry.duration_ms,
                    confidence: entry.confidence,
                };
                let from = from_tool_id.or(entry.from_tool_id.as_deref());
                self.inner.manager.record_outcome(&outcome, from);
                Some(entry.result)
            }
            stale => {
                let (duration, confidence) = stale
                    .map(|(_, e)| (e.duration_ms, e.confidence))
                    .unwrap_or((0, 0.0));
                let outcome = SpeculationOutcome {
                    prediction_id: format!("spec-{tool_id}"),
                    tool_id: tool_id.to_string(),
                    was_correct: false,
                    execution_time_ms: duration,
                    confidence,
                };
                self.inner.manager.record_outcome(&outcome, None);
                None
            }
        }
    }

    /// Abort one in-flight speculation: stop the task, free the slot, and
    /// discard any partial result.
    pub fn abort_speculation(&self, tool_id: &str) {
        if let Some((_, handle)) = self.inner.active.remove(tool_id) {
            if !handle.is_finished() {
                handle.abort();
                self.inner.cache.remove(tool_id);
                tracing::debug!(tool = tool_id, "speculation aborted");
            }
        }
    }

    /// Abort everything in flight.
    pub fn abort_all(&self) {
        let tools: Vec<String> = self.inner.active.iter().map(|e| e.key().clone()).collect();
        for tool in tools {
            self.abort_speculation(&tool);
        }
    }

    /// Drop every cached result (e.g. on workflow failure).
    pub fn discard_cache(&self) {
        self.inner.cache.clear();
    }

    /// Abort all work and refuse new speculations.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Relaxed);
        self.abort_all();
    }

    /// Executor-side counters.
    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            active: self.inner.active.len(),
            cached: self.inner.cache.len(),
            timed_out: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }
}
