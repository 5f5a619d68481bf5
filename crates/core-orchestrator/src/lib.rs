pub mod agents;
pub mod config;
pub mod event_bus;
pub mod insight;
pub mod model_registry;
pub mod pipeline;
pub mod store;

pub use agents::AgentContext;
pub use config::{AppConfig, ConfigStore};
pub use event_bus::{EventBus, OverallStatus_, RunSnapshot, SnapshotInsight};
pub use insight::{InsightExtractor, InsightTap};
pub use model_registry::{split_qualified_id, ModelRegistry};
pub use pipeline::{JobFetcher, Orchestrator, StartRunOutcome, UnconfiguredJobFetcher};
pub use store::RecoveryStore;
