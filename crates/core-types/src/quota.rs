use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub client_id: String,
    pub count: u32,
    pub period_started_at: DateTime<Utc>,
}

impl QuotaCounter {
    pub fn new(client_id: String) -> Self {
        Self {
            client_id,
            count: 0,
            period_started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
}
