//! Rich diagnostic error types for the khepri engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so users know exactly what
//! went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the khepri engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum KhepriError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Math(#[from] MathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Speculation(#[from] SpecError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Math errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum MathError {
    #[error("shape mismatch: {left_rows}x{left_cols} incompatible with {right_rows}x{right_cols} for {op}")]
    #[diagnostic(
        code(khepri::math::shape_mismatch),
        help(
            "The operand dimensions do not line up for this kernel. \
             Check that the inner dimensions agree (A.cols == B.rows for matmul) \
             and that vectors match the matrix side they multiply."
        )
    )]
    ShapeMismatch {
        op: &'static str,
        left_rows: usize,
        left_cols: usize,
        right_rows: usize,
        right_cols: usize,
    },

    #[error("eigensolver did not converge within {iterations} sweeps")]
    #[diagnostic(
        code(khepri::math::no_convergence),
        help(
            "The Jacobi eigensolver reached its sweep limit before off-diagonal \
             mass fell below tolerance. Increase the sweep limit, or check the \
             input matrix for NaN/Inf entries."
        )
    )]
    NoConvergence { iterations: usize },

    #[error("BLAS backend unavailable: {message}")]
    #[diagnostic(
        code(khepri::math::blas_unavailable),
        help(
            "The BLAS FFI path could not be initialized. This is non-fatal: \
             the portable scalar kernels are used instead. Build with the `blas` \
             feature and a system BLAS to enable the accelerated path."
        )
    )]
    BlasUnavailable { message: String },
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("unknown node: {id}")]
    #[diagnostic(
        code(khepri::graph::unknown_node),
        help(
            "The id does not resolve to a registered tool or capability. \
             Register it first with `register_tool` or `register_capability`, \
             or check the member list for typos."
        )
    )]
    UnknownNode { id: String },

    #[error("containment cycle detected at {node}: {}", path.join(" -> "))]
    #[diagnostic(
        code(khepri::graph::hierarchy_cycle),
        help(
            "The contains relation between capabilities must be acyclic. \
             One of the capabilities on the reported path lists an ancestor \
             as a member — remove that membership."
        )
    )]
    HierarchyCycle { node: String, path: Vec<String> },

    #[error("graph capacity exceeded: {kind} limit is {limit}")]
    #[diagnostic(
        code(khepri::graph::full),
        help(
            "The configured node or edge capacity was reached. Raise \
             `max_nodes` / `max_edges` in EngineConfig, or prune the graph."
        )
    )]
    GraphFull { kind: &'static str, limit: usize },

    #[error("embedding dimension mismatch for {id}: expected {expected}, got {actual}")]
    #[diagnostic(
        code(khepri::graph::dim_mismatch),
        help(
            "All embeddings registered in one graph must share the engine's \
             embedding dimension. Re-embed the node with the current model."
        )
    )]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },
}

// ---------------------------------------------------------------------------
// Training errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TrainError {
    #[error("invalid training input: {message}")]
    #[diagnostic(
        code(khepri::train::invalid_input),
        help(
            "Training requires a non-empty capability set and a non-empty \
             example list, with every example referencing a known candidate. \
             The worker exits non-zero and leaves the stored parameters untouched."
        )
    )]
    InvalidInput { message: String },

    #[error("parameter tensor {name} has shape {actual:?}, expected {expected:?}")]
    #[diagnostic(
        code(khepri::train::shape_mismatch),
        help(
            "The imported parameter blob does not match the model configuration. \
             Check that scoring_dim / embedding_dim / num_heads / num_layers match \
             the run that exported the parameters."
        )
    )]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("parameter tensor missing from import: {name}")]
    #[diagnostic(
        code(khepri::train::missing_tensor),
        help(
            "The serialized parameter map does not contain this tensor. \
             The blob was probably exported by an older model layout; retrain."
        )
    )]
    MissingTensor { name: String },

    #[error("parameter blob is malformed: {message}")]
    #[diagnostic(
        code(khepri::train::malformed_blob),
        help(
            "The self-describing tensor framing could not be decoded. The stored \
             blob may be truncated or from an incompatible version."
        )
    )]
    MalformedBlob { message: String },

    #[error("replay buffer is empty: cannot sample a batch")]
    #[diagnostic(
        code(khepri::train::empty_buffer),
        help("Push at least one example into the replay buffer before sampling.")
    )]
    EmptyBuffer,
}

// ---------------------------------------------------------------------------
// Speculation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SpecError {
    #[error("speculation already in flight for tool {tool_id}")]
    #[diagnostic(
        code(khepri::speculate::duplicate),
        help(
            "At most one speculation per tool id may run at a time. \
             Duplicates are normally dropped silently — seeing this error means \
             a caller bypassed `start_speculations`."
        )
    )]
    Duplicate { tool_id: String },

    #[error("speculative executor is shut down")]
    #[diagnostic(
        code(khepri::speculate::shutdown),
        help("The executor was shut down; create a new one to speculate again.")
    )]
    ShutDown,
}

// ---------------------------------------------------------------------------
// Sandbox errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SandboxError {
    #[error("sandbox execution timed out after {timeout_ms} ms")]
    #[diagnostic(
        code(khepri::sandbox::timeout),
        help(
            "The snippet exceeded the host-enforced deadline and was killed. \
             Inside speculation this is swallowed and counted; in main execution \
             it surfaces to the caller."
        )
    )]
    Timeout { timeout_ms: u64 },

    #[error("sandbox memory limit of {limit_mb} MB exceeded")]
    #[diagnostic(
        code(khepri::sandbox::memory),
        help("The snippet allocated more than the configured memory budget.")
    )]
    MemoryLimit { limit_mb: usize },

    #[error("operation not permitted in sandbox: {operation}")]
    #[diagnostic(
        code(khepri::sandbox::permission),
        help(
            "Sandboxed code has no ambient authority: no filesystem, network, \
             env, or subprocess access. Route side effects through tool calls."
        )
    )]
    Permission { operation: String },

    #[error("capability call depth exceeded limit of {limit}")]
    #[diagnostic(
        code(khepri::sandbox::capability_depth),
        help(
            "Capabilities may call other capabilities only a few levels deep. \
             Deeper chains usually indicate unintended mutual recursion — \
             flatten the composition."
        )
    )]
    CapabilityDepthExceeded { limit: u32 },

    #[error("unknown tool in sandbox call: {tool}")]
    #[diagnostic(
        code(khepri::sandbox::unknown_tool),
        help("The tool is not present in the tool definitions handed to `execute`.")
    )]
    UnknownTool { tool: String },

    #[error("unknown capability in sandbox call: {capability}")]
    #[diagnostic(
        code(khepri::sandbox::unknown_capability),
        help("The capability is not bound into this sandbox's capability context.")
    )]
    UnknownCapability { capability: String },

    #[error("script error: {message}")]
    #[diagnostic(
        code(khepri::sandbox::script),
        help(
            "The capability snippet failed to parse or evaluate. The message \
             carries the offending token or operation."
        )
    )]
    Script { message: String },

    #[error("sandbox worker channel closed unexpectedly")]
    #[diagnostic(
        code(khepri::sandbox::channel_closed),
        help(
            "The message channel to the sandbox worker dropped mid-execution. \
             The worker was probably killed; the execution is treated as failed."
        )
    )]
    ChannelClosed,

    #[error("tool call failed in sandbox: {tool}: {message}")]
    #[diagnostic(
        code(khepri::sandbox::tool_call),
        help("The host-side tool invocation returned an error to the sandbox.")
    )]
    ToolCall { tool: String, message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid config field `{field}`: {message}")]
    #[diagnostic(
        code(khepri::config::validation),
        help(
            "The speculation config failed validation. Fix the named field \
             in the YAML file; valid ranges are documented next to each field."
        )
    )]
    Validation { field: &'static str, message: String },

    #[error("failed to read config file {path}: {source}")]
    #[diagnostic(
        code(khepri::config::io),
        help("Check that the config path exists and is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {message}")]
    #[diagnostic(
        code(khepri::config::parse),
        help("The file is not valid YAML for the speculation config schema.")
    )]
    Parse { message: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(khepri::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(khepri::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption — try running with a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(khepri::store::serde),
        help(
            "Failed to serialize or deserialize stored data. This usually means \
             the stored format changed between versions; retrain or re-ingest."
        )
    )]
    Serialization { message: String },

    #[error("key not found: {key}")]
    #[diagnostic(
        code(khepri::store::not_found),
        help("The requested key does not exist in the store.")
    )]
    NotFound { key: String },
}

// ---------------------------------------------------------------------------
// Db errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DbError {
    #[error("query failed: {message}")]
    #[diagnostic(
        code(khepri::db::query),
        help(
            "The external database rejected the query. The SQL text is fixed; \
             check connectivity and schema."
        )
    )]
    Query { message: String },

    #[error("malformed row in {table}: {message}")]
    #[diagnostic(
        code(khepri::db::malformed_row),
        help("A row did not match the expected column layout or JSON shape.")
    )]
    MalformedRow { table: &'static str, message: String },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(khepri::engine::invalid_config),
        help("Check the EngineConfig fields. {message}")
    )]
    InvalidConfig { message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(khepri::engine::data_dir),
        help(
            "The data directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },
}

/// Convenience alias for functions returning khepri results.
pub type KhepriResult<T> = std::result::Result<T, KhepriError>;
