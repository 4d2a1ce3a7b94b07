//! Sandbox worker bridge: message-channel RPC between snippet and host.
//!
//! The snippet evaluator runs on a blocking worker; the host side serves
//! its tool-call RPCs, enforces the deadline, and emits trace events. The
//! channel plumbing adds well under the 100 ms RPC overhead target — the
//! cost of a call is the tool itself.
//!
//! Timeout enforcement is authoritative at the host: when the deadline
//! fires, the cancellation flag flips, the RPC channels close, and the
//! worker unwinds at its next check. `cleanup()` is idempotent and also
//! runs on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::error::SandboxError;
use crate::trace::TraceEvent;

use super::script::{self, HostCalls, ScriptEnv, ScriptResult};

/// How long a worker waits on a reply slice before re-checking cancellation.
const REPLY_POLL: Duration = Duration::from_millis(20);

/// One tool made visible inside a sandbox.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub name: String,
    /// MCP server the host routes this tool's calls to.
    pub server_id: String,
}

/// External MCP client boundary: the transport itself is out of scope.
pub trait McpClient: Send + Sync {
    /// Invoke a tool and return its result, or an error message.
    fn call_tool(&self, tool: &str, args: &[Value]) -> Result<Value, String>;
}

/// Registry of MCP clients by server id.
#[derive(Default)]
pub struct ToolRouter {
    clients: DashMap<String, Arc<dyn McpClient>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client for a server id.
    pub fn register(&self, server_id: impl Into<String>, client: Arc<dyn McpClient>) {
        self.clients.insert(server_id.into(), client);
    }

    /// Look up a client by server id.
    pub fn client(&self, server_id: &str) -> Option<Arc<dyn McpClient>> {
        self.clients.get(server_id).map(|e| Arc::clone(e.value()))
    }
}

/// Sandbox resource limits.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout_ms: u64,
    pub memory_limit_mb: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            memory_limit_mb: 256,
        }
    }
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    /// `tool_start` / `tool_end` pairs for every RPC the snippet made.
    pub traces: Vec<TraceEvent>,
}

struct RpcRequest {
    tool: String,
    args: Vec<Value>,
    reply: std::sync::mpsc::Sender<ScriptResult<Value>>,
}

/// Host side of the sandbox: builds isolates, serves their RPC, enforces
/// the deadline.
pub struct SandboxBridge {
    router: Arc<ToolRouter>,
    limits: SandboxLimits,
    trace_tx: Option<tokio::sync::broadcast::Sender<TraceEvent>>,
    /// Cancellation flag of the in-flight execution, if any.
    current: Mutex<Option<Arc<AtomicBool>>>,
    span_counter: AtomicU64,
}

impl SandboxBridge {
    pub fn new(router: Arc<ToolRouter>, limits: SandboxLimits) -> Self {
        Self {
            router,
            limits,
            trace_tx: None,
            current: Mutex::new(None),
            span_counter: AtomicU64::new(0),
        }
    }

    /// Attach a shared trace channel; every RPC start/end also goes there.
    pub fn with_trace_channel(
        mut self,
        tx: tokio::sync::broadcast::Sender<TraceEvent>,
    ) -> Self {
        self.trace_tx = Some(tx);
        self
    }

    /// Execute a snippet in an isolate.
    ///
    /// `tool_defs` names the tools visible to the snippet; `context` is its
    /// read-only input; `capability_context` maps capability names to their
    /// snippets for nested calls (depth-capped).
    pub async fn execute(
        &self,
        code: &str,
        tool_defs: &[ToolDef],
        context: Value,
        capability_context: HashMap<String, String>,
    ) -> ExecOutcome {
        let begun = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        *self.current.lock().expect("sandbox current lock") = Some(Arc::clone(&cancel));

        let traces: Arc<Mutex<Vec<TraceEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let (rpc_tx, mut rpc_rx) = tokio::sync::mpsc::unbounded_channel::<RpcRequest>();

        let tool_servers: HashMap<String, String> = tool_defs
            .iter()
            .map(|d| (d.name.clone(), d.server_id.clone()))
            .collect();

        // Worker isolate: owns only the code, its inputs, and the RPC
        // sender. Everything else is out of reach by construction.
        let worker_cancel = Arc::clone(&cancel);
        let worker_code = code.to_string();
        let memory_budget = self.limits.memory_limit_mb * 1024 * 1024;
        let memory_limit_mb = self.limits.memory_limit_mb;
        let worker = tokio::task::spawn_blocking(move || {
            let mut host = WorkerHost {
                rpc_tx,
                cancel: worker_cancel,
                budget: memory_budget,
                limit_mb: memory_limit_mb,
            };
            let mut env = ScriptEnv {
                context,
                capabilities: capability_context,
                host: &mut host,
            };
            script::evaluate(&worker_code, &mut env)
        });

        // Serve RPCs until the worker finishes or the deadline fires.
        let deadline = tokio::time::sleep(Duration::from_millis(self.limits.timeout_ms));
        tokio::pin!(deadline);
        let mut timed_out = false;
        loop {
            tokio::select! {
                request = rpc_rx.recv() => match request {
                    Some(request) => self.serve_rpc(request, &tool_servers, &traces),
                    None => break, // worker dropped its sender: done
                },
                _ = &mut deadline => {
                    cancel.store(true, Ordering::SeqCst);
                    timed_out = true;
                    break;
                }
            }
        }

        // The worker unwinds promptly once cancelled (channel closes, flag
        // checks); join it to release the isolate deterministically.
        let eval = worker.await;
        self.cleanup();

        let execution_time_ms = begun.elapsed().as_millis() as u64;
        let traces = traces.lock().expect("trace lock").clone();

        let result: ScriptResult<Value> = if timed_out {
            Err(SandboxError::Timeout {
                timeout_ms: self.limits.timeout_ms,
            })
        } else {
            match eval {
                Ok(inner) => inner,
                Err(join_error) => Err(SandboxError::Script {
                    message: format!("worker panicked: {join_error}"),
                }),
            }
        };

        match result {
            Ok(value) => ExecOutcome {
                success: true,
                result: Some(value),
                error: None,
                execution_time_ms,
                traces,
            },
            Err(error) => ExecOutcome {
                success: false,
                result: None,
                error: Some(error.to_string()),
                execution_time_ms,
                traces,
            },
        }
    }

    /// Stop the in-flight execution, if any. Safe to call repeatedly.
    pub fn cleanup(&self) {
        if let Some(cancel) = self.current.lock().expect("sandbox current lock").take() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    fn serve_rpc(
        &self,
        request: RpcRequest,
        tool_servers: &HashMap<String, String>,
        traces: &Arc<Mutex<Vec<TraceEvent>>>,
    ) {
        let Some(server_id) = tool_servers.get(&request.tool) else {
            let _ = request.reply.send(Err(SandboxError::UnknownTool {
                tool: request.tool.clone(),
            }));
            return;
        };
        let Some(client) = self.router.client(server_id) else {
            let _ = request.reply.send(Err(SandboxError::ToolCall {
                tool: request.tool.clone(),
                message: format!("no MCP client for server {server_id}"),
            }));
            return;
        };

        let span = self.span_counter.fetch_add(1, Ordering::Relaxed);
        let trace_id = format!("sbx-{span}");
        let start = TraceEvent::ToolStart {
            trace_id: trace_id.clone(),
            parent_trace_id: None,
            tool_id: request.tool.clone(),
            timestamp_ms: now_ms(),
        };
        self.emit(traces, start);

        // The client call itself may be slow; keep the select loop free so
        // the deadline can still fire.
        let traces = Arc::clone(traces);
        let trace_tx = self.trace_tx.clone();
        let tool = request.tool.clone();
        tokio::task::spawn_blocking(move || {
            let begun = Instant::now();
            let outcome = client.call_tool(&tool, &request.args);
            let duration_ms = begun.elapsed().as_millis() as u64;
            let (success, error) = match &outcome {
                Ok(_) => (true, None),
                Err(message) => (false, Some(message.clone())),
            };
            let end = TraceEvent::ToolEnd {
                trace_id,
                parent_trace_id: None,
                tool_id: tool.clone(),
                timestamp_ms: now_ms(),
                duration_ms,
                success,
                error,
                provides_to: None,
            };
            if let Ok(mut guard) = traces.lock() {
                guard.push(end.clone());
            }
            if let Some(tx) = trace_tx {
                let _ = tx.send(end);
            }
            let reply = outcome.map_err(|message| SandboxError::ToolCall { tool, message });
            let _ = request.reply.send(reply);
        });
    }

    fn emit(&self, traces: &Arc<Mutex<Vec<TraceEvent>>>, event: TraceEvent) {
        if let Ok(mut guard) = traces.lock() {
            guard.push(event.clone());
        }
        if let Some(tx) = &self.trace_tx {
            let _ = tx.send(event);
        }
    }
}

impl Drop for SandboxBridge {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Worker-side host services: RPC over the channel, cancellation checks,
/// memory budget.
struct WorkerHost {
    rpc_tx: tokio::sync::mpsc::UnboundedSender<RpcRequest>,
    cancel: Arc<AtomicBool>,
    budget: usize,
    limit_mb: usize,
}

impl HostCalls for WorkerHost {
    fn call_tool(&mut self, tool: &str, args: Vec<Value>) -> ScriptResult<Value> {
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.rpc_tx
            .send(RpcRequest {
                tool: tool.to_string(),
                args,
                reply: reply_tx,
            })
            .map_err(|_| SandboxError::ChannelClosed)?;
        loop {
            if self.cancelled() {
                return Err(SandboxError::Timeout { timeout_ms: 0 });
            }
            match reply_rx.recv_timeout(REPLY_POLL) {
                Ok(result) => return result,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(SandboxError::ChannelClosed);
                }
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn memory_budget(&self) -> usize {
        self.budget
    }

    fn charge_memory(&mut self, bytes: usize) -> ScriptResult<()> {
        if bytes > self.budget {
            return Err(SandboxError::MemoryLimit {
                limit_mb: self.limit_mb,
            });
        }
        self.budget -= bytes;
        Ok(())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
