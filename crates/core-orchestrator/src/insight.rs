use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use resume_core_observability::{emit_event, ObservabilityEvent, ProcessKind};
use resume_core_providers::{generate_stream, ChatMessage, GenerateOptions, ProviderRegistry};
use resume_core_types::{EventPayload, Importance, Insight};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::Level;
use uuid::Uuid;

use crate::event_bus::EventBus;

const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Bounded drop-oldest queue of flushed text batches awaiting an insight
/// call. §4.5 backpressure: when full, the oldest batch is discarded rather
/// than blocking the producer.
struct BatchQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
    capacity: usize,
}

impl BatchQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    async fn push(&self, item: String) -> bool {
        let mut dropped = false;
        {
            let mut items = self.items.lock().await;
            if items.len() >= self.capacity {
                items.pop_front();
                dropped = true;
            }
            items.push_back(item);
        }
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> String {
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// Feeds an agent's raw token stream into the insight pipeline. `push` is
/// called once per delta chunk from the agent's `generate_stream` loop;
/// the producer side never blocks and never observes a tap failure.
pub struct InsightTap {
    tx: mpsc::UnboundedSender<String>,
    flush_task: JoinHandle<()>,
    consumer_task: JoinHandle<()>,
}

impl InsightTap {
    pub fn push(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }

    /// Best-effort join, called right before the agent's terminal event so
    /// in-flight insights have a chance to land first; never awaited
    /// indefinitely by the caller beyond this bound.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = tokio::time::timeout(Duration::from_millis(500), self.flush_task).await;
        self.consumer_task.abort();
    }
}

pub struct InsightExtractor {
    bus: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
    flush_chars: usize,
    flush_interval: Duration,
    queue_capacity: usize,
}

impl InsightExtractor {
    pub fn new(
        bus: Arc<EventBus>,
        registry: Arc<ProviderRegistry>,
        flush_chars: usize,
        flush_interval_seconds: f64,
    ) -> Self {
        Self {
            bus,
            registry,
            flush_chars,
            flush_interval: Duration::from_secs_f64(flush_interval_seconds.max(0.05)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// §4.5: attaches a tap to agents 1, 2, 3, 5 (0-indexed 0, 1, 2, 4).
    pub fn produces_insights(agent_index: usize) -> bool {
        matches!(agent_index, 0 | 1 | 2 | 4)
    }

    pub fn spawn_tap(
        self: &Arc<Self>,
        run_id: Uuid,
        agent_index: usize,
        insight_model: String,
    ) -> InsightTap {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let queue = Arc::new(BatchQueue::new(self.queue_capacity));

        let flush_chars = self.flush_chars;
        let flush_interval = self.flush_interval;
        let flush_queue = queue.clone();
        let flush_bus = self.bus.clone();
        let flush_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let mut tick = tokio::time::interval(flush_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe_text = rx.recv() => {
                        match maybe_text {
                            Some(text) => {
                                buffer.push_str(&text);
                                if buffer.chars().count() >= flush_chars {
                                    let batch = std::mem::take(&mut buffer);
                                    if flush_queue.push(batch).await {
                                        emit_drop_metric(&flush_bus, run_id).await;
                                    }
                                }
                            }
                            None => {
                                if !buffer.is_empty() {
                                    let batch = std::mem::take(&mut buffer);
                                    if flush_queue.push(batch).await {
                                        emit_drop_metric(&flush_bus, run_id).await;
                                    }
                                }
                                return;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        if !buffer.is_empty() {
                            let batch = std::mem::take(&mut buffer);
                            if flush_queue.push(batch).await {
                                emit_drop_metric(&flush_bus, run_id).await;
                            }
                        }
                    }
                }
            }
        });

        let registry = self.registry.clone();
        let bus = self.bus.clone();
        let consumer_queue = queue;
        let consumer_task = tokio::spawn(async move {
            loop {
                let batch = consumer_queue.pop().await;
                let registry = registry.clone();
                let bus = bus.clone();
                let model = insight_model.clone();
                tokio::spawn(async move {
                    process_batch(registry, bus, run_id, agent_index, model, batch).await;
                });
            }
        });

        InsightTap {
            tx,
            flush_task,
            consumer_task,
        }
    }
}

async fn emit_drop_metric(bus: &Arc<EventBus>, run_id: Uuid) {
    let _ = bus
        .publish(
            run_id,
            EventPayload::Metric {
                name: "insight_drops".into(),
                value: 1.0,
                unit: "count".into(),
            },
        )
        .await;

    let run_id_str = run_id.to_string();
    emit_event(
        Level::WARN,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "insight_dropped",
            component: "insight_extractor",
            run_id: Some(&run_id_str),
            status: Some("dropped"),
            ..Default::default()
        },
    );
}

/// Fire-and-forget: an upstream failure here is logged as a metric and the
/// main agent is never informed, per §4.5 and §9.
async fn process_batch(
    registry: Arc<ProviderRegistry>,
    bus: Arc<EventBus>,
    run_id: Uuid,
    agent_index: usize,
    model_id: String,
    batch: String,
) {
    let messages = vec![
        ChatMessage {
            role: "system".into(),
            content: "Extract at most one short, structured insight (category, importance low|medium|high, one-sentence message) from this excerpt of an in-progress AI agent's output. Respond as a single JSON object: {\"category\":...,\"importance\":...,\"message\":...}. If nothing notable, respond with {}.".into(),
        },
        ChatMessage {
            role: "user".into(),
            content: batch,
        },
    ];

    let (provider_id, bare_model_id) = crate::model_registry::split_qualified_id(&model_id);
    let mut stream = Box::pin(generate_stream(
        &registry,
        Some(provider_id),
        Some(bare_model_id),
        messages,
        GenerateOptions {
            temperature: Some(0.2),
            max_tokens: Some(120),
            ..Default::default()
        },
        Duration::from_secs(15),
    ));

    let mut text = String::new();
    let mut saw_error = false;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(resume_core_providers::GenerateChunk::DeltaText(t)) => text.push_str(&t),
            Ok(_) => {}
            Err(_) => {
                saw_error = true;
                break;
            }
        }
    }

    if saw_error {
        let _ = bus
            .publish(
                run_id,
                EventPayload::Metric {
                    name: "insight_errors".into(),
                    value: 1.0,
                    unit: "count".into(),
                },
            )
            .await;
        return;
    }

    if let Some(insight) = parse_insight(&text, agent_index) {
        let _ = bus
            .publish(
                run_id,
                EventPayload::Insight {
                    insight_id: insight.insight_id,
                    category: insight.category,
                    importance: insight.importance,
                    message: insight.message,
                    step: insight.step,
                },
            )
            .await;
    }
}

fn parse_insight(text: &str, step: usize) -> Option<Insight> {
    #[derive(serde::Deserialize)]
    struct Raw {
        category: String,
        importance: String,
        message: String,
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &text[start..=end];
    let raw: Raw = serde_json::from_str(candidate).ok()?;
    if raw.message.trim().is_empty() {
        return None;
    }
    let importance = match raw.importance.trim().to_ascii_lowercase().as_str() {
        "high" => Importance::High,
        "low" => Importance::Low,
        _ => Importance::Medium,
    };

    Some(Insight {
        insight_id: Uuid::new_v4(),
        category: raw.category,
        importance,
        message: raw.message,
        step,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_insights_covers_agents_1_2_3_5() {
        assert!(InsightExtractor::produces_insights(0));
        assert!(InsightExtractor::produces_insights(1));
        assert!(InsightExtractor::produces_insights(2));
        assert!(!InsightExtractor::produces_insights(3));
        assert!(InsightExtractor::produces_insights(4));
    }

    #[test]
    fn parse_insight_extracts_json_object_from_prose() {
        let text = "Here is the finding:\n{\"category\":\"ats\",\"importance\":\"high\",\"message\":\"Missing keyword: FastAPI\"}\nDone.";
        let insight = parse_insight(text, 1).unwrap();
        assert_eq!(insight.category, "ats");
        assert_eq!(insight.message, "Missing keyword: FastAPI");
    }

    #[test]
    fn parse_insight_rejects_empty_object() {
        assert!(parse_insight("{}", 0).is_none());
    }

    #[tokio::test]
    async fn batch_queue_drops_oldest_past_capacity() {
        let queue = BatchQueue::new(2);
        assert!(!queue.push("a".into()).await);
        assert!(!queue.push("b".into()).await);
        assert!(queue.push("c".into()).await);
        assert_eq!(queue.pop().await, "b");
        assert_eq!(queue.pop().await, "c");
    }
}
