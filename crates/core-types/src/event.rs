use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCategory, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSourceKind {
    Text,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Succeeded,
    Failed,
    Canceled,
}

/// Discriminated event payload. §4.3's event-type table, one variant each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    JobStarted {
        resume_length: usize,
        job_source: JobSourceKind,
        models_by_agent: Vec<String>,
    },
    AgentStep {
        agent_index: usize,
        agent_name: String,
        status: AgentStepStatus,
        tokens_in: u64,
        tokens_out: u64,
        thinking_tokens: u64,
        cost_micro_usd: i64,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        from_checkpoint: bool,
    },
    AgentChunk {
        agent_index: usize,
        text: String,
    },
    Insight {
        insight_id: Uuid,
        category: String,
        importance: Importance,
        message: String,
        step: usize,
    },
    Metric {
        name: String,
        value: f64,
        unit: String,
    },
    Heartbeat {
        ts: DateTime<Utc>,
    },
    Error {
        error_id: Uuid,
        category: ErrorCategory,
        r#type: ErrorKind,
        message: String,
    },
    Done {
        overall_status: OverallStatus,
        total_cost_micro_usd: i64,
        checkpoint_count: usize,
    },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::JobStarted { .. } => "job_started",
            EventPayload::AgentStep { .. } => "agent_step",
            EventPayload::AgentChunk { .. } => "agent_chunk",
            EventPayload::Insight { .. } => "insight",
            EventPayload::Metric { .. } => "metric",
            EventPayload::Heartbeat { .. } => "heartbeat",
            EventPayload::Error { .. } => "error",
            EventPayload::Done { .. } => "done",
        }
    }

    /// Invariant 1: the sequence ends with exactly one `done`/`error` event
    /// after which nothing further is appended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Done { .. } | EventPayload::Error { .. })
    }
}

/// Append-only record in the bus for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Uuid,
    pub event_id: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}
