use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const AGENT_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Analyzer,
    Strategy,
    Builder,
    Validator,
    Polisher,
}

impl AgentName {
    pub const ORDER: [AgentName; AGENT_COUNT] = [
        AgentName::Analyzer,
        AgentName::Strategy,
        AgentName::Builder,
        AgentName::Validator,
        AgentName::Polisher,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ORDER.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentName::Analyzer => "analyzer",
            AgentName::Strategy => "strategy",
            AgentName::Builder => "builder",
            AgentName::Validator => "validator",
            AgentName::Polisher => "polisher",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    pub analyzer: Option<String>,
    pub optimizer: Option<String>,
    pub implementer: Option<String>,
    pub validator: Option<String>,
    pub polish: Option<String>,
}

impl ModelOverrides {
    pub fn for_agent_index(&self, index: usize) -> Option<&str> {
        match index {
            0 => self.analyzer.as_deref(),
            1 => self.optimizer.as_deref(),
            2 => self.implementer.as_deref(),
            3 => self.validator.as_deref(),
            4 => self.polish.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobSource {
    Text(String),
    Url(String),
}

/// The submitted inputs. Immutable after acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub client_id: String,
    pub resume_text: String,
    pub job_text: Option<String>,
    pub job_url: Option<String>,
    pub linkedin_url: Option<String>,
    pub github_username: Option<String>,
    #[serde(default)]
    pub models: ModelOverrides,
}

impl RunRequest {
    /// §4.7 admission check 1: resume_text non-empty, exactly one of job_text/job_url.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.resume_text.trim().is_empty() {
            return Err("resume_text must not be empty");
        }
        match (self.job_text.is_some(), self.job_url.is_some()) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err("exactly one of job_text or job_url is required, not both"),
            (false, false) => Err("exactly one of job_text or job_url is required"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub client_id: String,
    pub status: RunStatus,
    pub current_agent: usize,
    pub total_cost_micro_usd: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(run_id: Uuid, client_id: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            client_id,
            status: RunStatus::Pending,
            current_agent: 0,
            total_cost_micro_usd: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub thinking_tokens: u64,
    pub usage_estimated: bool,
}

/// Parsed, structured output of one agent. Created exactly once per
/// `(run_id, agent_index)`; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub run_id: Uuid,
    pub agent_index: usize,
    pub agent_name: AgentName,
    pub output_json: serde_json::Value,
    pub raw_text: String,
    pub usage: TokenUsage,
    pub cost_micro_usd: i64,
    pub model_used: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

pub type AgentCheckpoint = AgentOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Durable reflection of a Run used for retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    pub run_id: Uuid,
    pub form_data: serde_json::Value,
    pub file_metadata: serde_json::Value,
    pub status: SessionStatus,
    pub completed_agents: BTreeSet<usize>,
    pub error_id: Option<Uuid>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RecoverySession {
    pub fn new(run_id: Uuid, form_data: serde_json::Value, ttl_days: i64) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            form_data,
            file_metadata: serde_json::json!({}),
            status: SessionStatus::Pending,
            completed_agents: BTreeSet::new(),
            error_id: None,
            retry_count: 0,
            created_at: now,
            expires_at: now + chrono::Duration::days(ttl_days),
        }
    }

    /// Invariant 4: eligible for automatic deletion once expired and terminal.
    pub fn is_expired_and_terminal(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
            && matches!(
                self.status,
                SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Canceled
            )
    }
}
