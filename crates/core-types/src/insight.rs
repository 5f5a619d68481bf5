use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Importance;

/// Short extracted observation attached to an ongoing step. Produced by the
/// Insight Extractor (C5), never by the main agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: Uuid,
    pub category: String,
    pub importance: Importance,
    pub message: String,
    pub step: usize,
}
