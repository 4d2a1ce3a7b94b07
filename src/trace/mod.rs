//! Execution traces: the event stream the system learns from.
//!
//! Every tool or capability invocation — real or speculative — emits a
//! start/end event pair. The [`learner::TraceLearner`] rewrites graph edges
//! from completed batches; the same serialized events feed the SSE stream.

pub mod learner;

use serde::{Deserialize, Serialize};

/// One event in an execution trace.
///
/// `trace_id` identifies the span; `parent_trace_id` links a child span to
/// the capability run that launched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    ToolStart {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_trace_id: Option<String>,
        tool_id: String,
        timestamp_ms: u64,
    },
    ToolEnd {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_trace_id: Option<String>,
        tool_id: String,
        timestamp_ms: u64,
        duration_ms: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Sibling trace id this span's output fed into, if known.
        #[serde(skip_serializing_if = "Option::is_none")]
        provides_to: Option<String>,
    },
    CapabilityStart {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_trace_id: Option<String>,
        capability_id: String,
        timestamp_ms: u64,
    },
    CapabilityEnd {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_trace_id: Option<String>,
        capability_id: String,
        timestamp_ms: u64,
        duration_ms: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        provides_to: Option<String>,
    },
    Error {
        trace_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_trace_id: Option<String>,
        message: String,
        timestamp_ms: u64,
    },
}

impl TraceEvent {
    /// The span id this event belongs to.
    pub fn trace_id(&self) -> &str {
        match self {
            TraceEvent::ToolStart { trace_id, .. }
            | TraceEvent::ToolEnd { trace_id, .. }
            | TraceEvent::CapabilityStart { trace_id, .. }
            | TraceEvent::CapabilityEnd { trace_id, .. }
            | TraceEvent::Error { trace_id, .. } => trace_id,
        }
    }

    /// The parent span id, if any.
    pub fn parent_trace_id(&self) -> Option<&str> {
        match self {
            TraceEvent::ToolStart { parent_trace_id, .. }
            | TraceEvent::ToolEnd { parent_trace_id, .. }
            | TraceEvent::CapabilityStart { parent_trace_id, .. }
            | TraceEvent::CapabilityEnd { parent_trace_id, .. }
            | TraceEvent::Error { parent_trace_id, .. } => parent_trace_id.as_deref(),
        }
    }

    /// The graph node this event refers to, for `_end` events.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            TraceEvent::ToolEnd { tool_id, .. } => Some(tool_id),
            TraceEvent::CapabilityEnd { capability_id, .. } => Some(capability_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_through_json() {
        let event = TraceEvent::ToolEnd {
            trace_id: "t-1".into(),
            parent_trace_id: Some("root".into()),
            tool_id: "fs_read".into(),
            timestamp_ms: 1000,
            duration_ms: 42,
            success: true,
            error: None,
            provides_to: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tool_end\""));
        let back: TraceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn node_id_only_for_end_events() {
        let start = TraceEvent::ToolStart {
            trace_id: "t".into(),
            parent_trace_id: None,
            tool_id: "x".into(),
            timestamp_ms: 0,
        };
        assert!(start.node_id().is_none());
    }
}
