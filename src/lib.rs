//! # khepri
//!
//! A self-learning tool & capability recommender for agent runtimes:
//! superhypergraph attention over observed tool usage, plus speculative
//! execution of the predictions it is most confident about.
//!
//! ## Architecture
//!
//! - **Math kernels** (`math`): dense f32 kernels with a BLAS FFI path
//! - **Graph core** (`graph`): tools as vertices, capabilities as nested
//!   hyperedges, typed weighted edges learned from traces
//! - **SHGAT model** (`shgat`): multi-level multi-head attention, K-head
//!   intent scoring, PER-driven training with a held-out health check
//! - **Speculation** (`speculate`): confidence-gated, cancellable sandbox
//!   runs with a TTL result cache and hit/miss accounting
//! - **Sandbox** (`sandbox`): no-ambient-authority snippet execution with
//!   message-channel tool RPC
//! - **Emergence** (`emergence`): entropy, stability, and diversity
//!   metrics over graph snapshots
//!
//! ## Library usage
//!
//! ```no_run
//! use khepri::engine::{Engine, EngineConfig};
//! use khepri::graph::CapabilityOptions;
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! engine.register_tool("fs_read", None, None).unwrap();
//! engine.register_tool("fs_write", None, None).unwrap();
//! engine
//!     .register_capability(
//!         "file_io",
//!         CapabilityOptions {
//!             members: vec!["fs_read".into(), "fs_write".into()],
//!             ..Default::default()
//!         },
//!     )
//!     .unwrap();
//! let intent = engine.embed("copy a file somewhere");
//! let ranked = engine.score_intent(&intent).unwrap();
//! assert_eq!(ranked[0].id, "file_io");
//! ```

pub mod catalog;
pub mod config;
pub mod db;
pub mod embed;
pub mod emergence;
pub mod engine;
pub mod error;
pub mod graph;
pub mod math;
pub mod predict;
pub mod sandbox;
pub mod shgat;
pub mod speculate;
pub mod store;
pub mod trace;
pub mod worker;

#[cfg(feature = "server")]
pub mod server;
