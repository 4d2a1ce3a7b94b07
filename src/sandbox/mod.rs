//! Sandboxed capability execution.
//!
//! Capability snippets run in an isolate with no ambient authority: no
//! filesystem, network, environment, subprocesses, or FFI. The only I/O is
//! a bidirectional message channel to the host ([`worker::SandboxBridge`]),
//! which routes tool calls to registered MCP clients and emits
//! `tool_start`/`tool_end` trace pairs for every RPC.
//!
//! The snippet language itself lives in [`script`]; the host-authoritative
//! timeout, the RPC plumbing, and cleanup discipline live in [`worker`].

pub mod script;
pub mod worker;

pub use script::{CAPABILITY_DEPTH_LIMIT, HostCalls, ScriptEnv, evaluate};
pub use worker::{ExecOutcome, McpClient, SandboxBridge, SandboxLimits, ToolDef, ToolRouter};
