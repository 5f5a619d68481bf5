use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use resume_core_types::{
    AgentStepStatus, CoreError, Event, EventPayload, Importance, OverallStatus,
};
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::store::RecoveryStore;

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const TERMINAL_GRACE: Duration = Duration::from_secs(2);

struct RunChannel {
    tx: broadcast::Sender<Event>,
    heartbeat: JoinHandle<()>,
}

/// Per-run ordered event log (C3): a durable journal (the Recovery Store)
/// plus in-memory fanout to live subscribers. `EventBus` is the single
/// source of truth for `snapshot()` — every derived view is a fold over the
/// journaled events, nothing is tracked redundantly.
pub struct EventBus {
    store: Arc<RecoveryStore>,
    publish_locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    channels: RwLock<HashMap<Uuid, Arc<RunChannel>>>,
}

impl EventBus {
    pub fn new(store: Arc<RecoveryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            publish_locks: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.publish_locks.read().await.get(&run_id) {
            return lock.clone();
        }
        let mut guard = self.publish_locks.write().await;
        guard
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn channel_for(self: &Arc<Self>, run_id: Uuid) -> Arc<RunChannel> {
        if let Some(channel) = self.channels.read().await.get(&run_id) {
            return channel.clone();
        }
        let mut guard = self.channels.write().await;
        if let Some(channel) = guard.get(&run_id) {
            return channel.clone();
        }
        let (tx, _rx) = broadcast::channel(SUBSCRIBER_QUEUE_DEPTH);
        let heartbeat = spawn_heartbeat(self.clone(), run_id);
        let channel = Arc::new(RunChannel { tx, heartbeat });
        guard.insert(run_id, channel.clone());
        channel
    }

    /// §4.3 `publish`: assigns the next `event_id`, stamps `ts`, persists,
    /// then fans out. Holds the per-run lock only across the id-assign and
    /// journal append.
    pub async fn publish(
        self: &Arc<Self>,
        run_id: Uuid,
        payload: EventPayload,
    ) -> Result<Event, CoreError> {
        let lock = self.lock_for(run_id).await;
        let event = {
            let _guard = lock.lock().await;
            let next_id = self.store.latest_event_id(run_id).await? + 1;
            let event = Event {
                run_id,
                event_id: next_id,
                ts: Utc::now(),
                payload,
            };
            self.store.record_event(&event).await?;
            event
        };

        let channel = self.channel_for(run_id).await;
        let _ = channel.tx.send(event.clone());

        if event.payload.is_terminal() {
            let bus = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(TERMINAL_GRACE).await;
                bus.close(run_id).await;
            });
        }

        Ok(event)
    }

    async fn close(&self, run_id: Uuid) {
        if let Some(channel) = self.channels.write().await.remove(&run_id) {
            channel.heartbeat.abort();
        }
    }

    /// §4.3 `subscribe`: replays journaled history after `after_event_id`,
    /// then tails live events. The seam between replay and live is seamless
    /// — callers never see a gap or a duplicate id.
    pub async fn subscribe(
        self: &Arc<Self>,
        run_id: Uuid,
        after_event_id: u64,
    ) -> Result<Pin<Box<dyn Stream<Item = Event> + Send>>, CoreError> {
        let backlog = self.store.read_events_after(run_id, after_event_id).await?;
        let mut cursor = backlog.last().map(|e| e.event_id).unwrap_or(after_event_id);
        let channel = self.channel_for(run_id).await;
        let mut rx = channel.tx.subscribe();

        let stream = async_stream::stream! {
            for event in backlog {
                let terminal = event.payload.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.event_id <= cursor {
                            continue;
                        }
                        cursor = event.event_id;
                        let terminal = event.payload.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // A slow consumer missed events; §5 says drop the
                        // subscriber, not the producer.
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// §4.3 `snapshot`: the derived view, computed by folding the journal.
    pub async fn snapshot(&self, run_id: Uuid) -> Result<RunSnapshot, CoreError> {
        let events = self.store.read_events_after(run_id, 0).await?;
        Ok(fold_snapshot(run_id, &events))
    }
}

fn spawn_heartbeat(bus: Arc<EventBus>, run_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if bus
                .publish(run_id, EventPayload::Heartbeat { ts: Utc::now() })
                .await
                .is_err()
            {
                return;
            }
        }
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInsight {
    pub insight_id: Uuid,
    pub category: String,
    pub importance: Importance,
    pub message: String,
    pub step: usize,
}

/// §4.3 `snapshot`: `{status, current_step, completed_steps, metrics,
/// insights[], last_event_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub status: OverallStatus_,
    pub current_step: Option<usize>,
    pub completed_steps: Vec<usize>,
    pub metrics: HashMap<String, f64>,
    pub insights: Vec<SnapshotInsight>,
    pub last_event_id: u64,
    pub total_cost_micro_usd: i64,
}

/// `snapshot.status` extends `OverallStatus` with the non-terminal states a
/// run can be folded into before `done`/`error` is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus_ {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

fn fold_snapshot(run_id: Uuid, events: &[Event]) -> RunSnapshot {
    let mut status = OverallStatus_::Pending;
    let mut current_step = None;
    let mut completed_steps = Vec::new();
    let mut metrics = HashMap::new();
    let mut insights = Vec::new();
    let mut last_event_id = 0;
    let mut total_cost_micro_usd = 0;

    for event in events {
        last_event_id = event.event_id;
        match &event.payload {
            EventPayload::JobStarted { .. } => {
                status = OverallStatus_::Running;
            }
            EventPayload::AgentStep {
                agent_index,
                status: step_status,
                cost_micro_usd,
                ..
            } => {
                current_step = Some(*agent_index);
                match step_status {
                    AgentStepStatus::Completed => {
                        if !completed_steps.contains(agent_index) {
                            completed_steps.push(*agent_index);
                        }
                        total_cost_micro_usd += cost_micro_usd;
                    }
                    AgentStepStatus::Started | AgentStepStatus::Failed => {}
                }
            }
            EventPayload::Insight {
                insight_id,
                category,
                importance,
                message,
                step,
            } => insights.push(SnapshotInsight {
                insight_id: *insight_id,
                category: category.clone(),
                importance: *importance,
                message: message.clone(),
                step: *step,
            }),
            EventPayload::Metric { name, value, .. } => {
                metrics.insert(name.clone(), *value);
            }
            EventPayload::Done {
                overall_status,
                total_cost_micro_usd: total,
                ..
            } => {
                total_cost_micro_usd = *total;
                status = match overall_status {
                    OverallStatus::Succeeded => OverallStatus_::Succeeded,
                    OverallStatus::Failed => OverallStatus_::Failed,
                    OverallStatus::Canceled => OverallStatus_::Canceled,
                };
            }
            EventPayload::Error { .. } => {
                status = OverallStatus_::Failed;
            }
            EventPayload::AgentChunk { .. } | EventPayload::Heartbeat { .. } => {}
        }
    }

    completed_steps.sort_unstable();

    RunSnapshot {
        run_id,
        status,
        current_step,
        completed_steps,
        metrics,
        insights,
        last_event_id,
        total_cost_micro_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn bus() -> (tempfile::TempDir, Arc<EventBus>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecoveryStore::new(dir.path()).await.unwrap());
        (dir, EventBus::new(store))
    }

    #[tokio::test]
    async fn publish_assigns_gapless_increasing_ids() {
        let (_dir, bus) = bus().await;
        let run_id = Uuid::new_v4();
        let e1 = bus
            .publish(
                run_id,
                EventPayload::Metric {
                    name: "x".into(),
                    value: 1.0,
                    unit: "count".into(),
                },
            )
            .await
            .unwrap();
        let e2 = bus
            .publish(
                run_id,
                EventPayload::Metric {
                    name: "x".into(),
                    value: 2.0,
                    unit: "count".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(e1.event_id, 1);
        assert_eq!(e2.event_id, 2);
    }

    #[tokio::test]
    async fn subscribe_replays_then_tails_seamlessly() {
        let (_dir, bus) = bus().await;
        let run_id = Uuid::new_v4();
        for i in 0..3 {
            bus.publish(
                run_id,
                EventPayload::Metric {
                    name: "x".into(),
                    value: i as f64,
                    unit: "count".into(),
                },
            )
            .await
            .unwrap();
        }

        let mut stream = bus.subscribe(run_id, 1).await.unwrap();
        let next = stream.next().await.unwrap();
        assert_eq!(next.event_id, 2);

        bus.publish(
            run_id,
            EventPayload::Done {
                overall_status: OverallStatus::Succeeded,
                total_cost_micro_usd: 0,
                checkpoint_count: 5,
            },
        )
        .await
        .unwrap();

        let rest: Vec<_> = stream.collect().await;
        let ids: Vec<_> = rest.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn snapshot_folds_completed_steps_and_cost() {
        let (_dir, bus) = bus().await;
        let run_id = Uuid::new_v4();
        bus.publish(
            run_id,
            EventPayload::AgentStep {
                agent_index: 0,
                agent_name: "analyzer".into(),
                status: AgentStepStatus::Completed,
                tokens_in: 10,
                tokens_out: 20,
                thinking_tokens: 0,
                cost_micro_usd: 500,
                duration_ms: 10,
                from_checkpoint: false,
            },
        )
        .await
        .unwrap();

        let snapshot = bus.snapshot(run_id).await.unwrap();
        assert_eq!(snapshot.completed_steps, vec![0]);
        assert_eq!(snapshot.total_cost_micro_usd, 500);
    }
}
