use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use resume_core_types::{
    AgentOutput, CoreError, ErrorKind, ErrorRecord, Event, QuotaCounter, QuotaDecision,
    RecoverySession, SessionStatus,
};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// File-based JSON/JSONL persistence for recovery sessions, checkpoints,
/// error logs, the run event journal, and the quota counter (C4). One
/// subdirectory per `run_id` under a state root; every write goes through
/// `atomic_write` (temp file + rename), the same shape the reference
/// implementation's orchestrator store uses for its own run state — no
/// external database dependency (§4.4).
pub struct RecoveryStore {
    base_dir: PathBuf,
    run_locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RecoveryStore {
    pub async fn new(state_root: &Path) -> Result<Self, CoreError> {
        let base_dir = state_root.join("runs");
        fs::create_dir_all(&base_dir).await?;
        fs::create_dir_all(state_root.join("quota")).await?;
        Ok(Self {
            base_dir,
            run_locks: RwLock::new(HashMap::new()),
        })
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.base_dir.join(run_id.to_string())
    }

    fn quota_dir(&self) -> PathBuf {
        self.base_dir
            .parent()
            .expect("base_dir always has a parent")
            .join("quota")
    }

    async fn lock_for(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.run_locks.read().await.get(&run_id) {
            return lock.clone();
        }
        let mut guard = self.run_locks.write().await;
        guard
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- recovery sessions ---------------------------------------------

    pub async fn create_session(
        &self,
        run_id: Uuid,
        form_data: serde_json::Value,
        ttl_days: i64,
    ) -> Result<RecoverySession, CoreError> {
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;
        let session = RecoverySession::new(run_id, form_data, ttl_days);
        self.write_session(&session).await?;
        Ok(session)
    }

    pub async fn get_session(&self, run_id: Uuid) -> Result<Option<RecoverySession>, CoreError> {
        let path = self.run_dir(run_id).join("session.json");
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub async fn update_session(&self, session: &RecoverySession) -> Result<(), CoreError> {
        let lock = self.lock_for(session.run_id).await;
        let _guard = lock.lock().await;
        self.write_session(session).await
    }

    async fn write_session(&self, session: &RecoverySession) -> Result<(), CoreError> {
        let dir = self.run_dir(session.run_id);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_string_pretty(session)?;
        atomic_write(&dir.join("session.json"), &content).await
    }

    // -- checkpoints ------------------------------------------------------

    /// Idempotent on `(run_id, agent_index)`: a second call for the same pair
    /// replaces the row only while the session is not yet `completed`
    /// (§4.4 consistency requirement).
    pub async fn save_checkpoint(&self, output: AgentOutput) -> Result<(), CoreError> {
        let lock = self.lock_for(output.run_id).await;
        let _guard = lock.lock().await;

        if let Some(session) = self.get_session(output.run_id).await? {
            if session.status == SessionStatus::Completed {
                return Ok(());
            }
        }

        let dir = self.run_dir(output.run_id).join("checkpoints");
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", output.agent_index));
        let content = serde_json::to_string_pretty(&output)?;
        atomic_write(&path, &content).await
    }

    pub async fn get_checkpoints(&self, run_id: Uuid) -> Result<Vec<AgentOutput>, CoreError> {
        let dir = self.run_dir(run_id).join("checkpoints");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let content = fs::read_to_string(entry.path()).await?;
            out.push(serde_json::from_str::<AgentOutput>(&content)?);
        }
        out.sort_by_key(|o| o.agent_index);
        Ok(out)
    }

    pub async fn get_checkpoint(
        &self,
        run_id: Uuid,
        agent_index: usize,
    ) -> Result<Option<AgentOutput>, CoreError> {
        let path = self
            .run_dir(run_id)
            .join("checkpoints")
            .join(format!("{}.json", agent_index));
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// User-initiated discard via `DELETE /recovery-session/{id}`.
    pub async fn delete_session(&self, run_id: Uuid) -> Result<bool, CoreError> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).await?;
        Ok(true)
    }

    // -- error log ----------------------------------------------------------

    pub async fn log_error(&self, record: ErrorRecord) -> Result<Uuid, CoreError> {
        let error_id = record.error_id;
        let run_id = record.run_id.unwrap_or_else(Uuid::nil);
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).await?;
        append_jsonl(&dir.join("errors.jsonl"), &record).await?;
        Ok(error_id)
    }

    // -- event journal --------------------------------------------------

    /// Durably assigns the event its id by reading the current high-water
    /// mark before append; the Bus calls this inside its per-run publish
    /// lock so ids remain gapless (§4.4 consistency requirement).
    pub async fn record_event(&self, event: &Event) -> Result<(), CoreError> {
        let dir = self.run_dir(event.run_id);
        fs::create_dir_all(&dir).await?;
        append_jsonl(&dir.join("events.jsonl"), event).await
    }

    pub async fn latest_event_id(&self, run_id: Uuid) -> Result<u64, CoreError> {
        let events = self.read_events_after(run_id, 0).await?;
        Ok(events.last().map(|e| e.event_id).unwrap_or(0))
    }

    pub async fn read_events_after(
        &self,
        run_id: Uuid,
        event_id: u64,
    ) -> Result<Vec<Event>, CoreError> {
        let path = self.run_dir(run_id).join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path).await?;
        let mut events: Vec<Event> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Event>(l).ok())
            .filter(|e| e.event_id > event_id)
            .collect();
        events.sort_by_key(|e| e.event_id);
        Ok(events)
    }

    // -- quota ------------------------------------------------------------

    /// Atomic read-compare-increment: the whole-file lock for this
    /// `client_id` is the critical section (§4.4). Callers must never
    /// mutate the counter any other way.
    pub async fn increment_and_check_quota(
        &self,
        client_id: &str,
        cap: u32,
    ) -> Result<QuotaDecision, CoreError> {
        let lock = self.lock_for(quota_pseudo_run_id(client_id)).await;
        let _guard = lock.lock().await;

        let path = self.quota_path(client_id);
        let mut counter = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str::<QuotaCounter>(&content)
                .unwrap_or_else(|_| QuotaCounter::new(client_id.to_string()))
        } else {
            QuotaCounter::new(client_id.to_string())
        };

        if counter.count >= cap {
            return Ok(QuotaDecision {
                allowed: false,
                remaining: 0,
            });
        }

        counter.count += 1;
        let content = serde_json::to_string_pretty(&counter)?;
        atomic_write(&path, &content).await?;

        Ok(QuotaDecision {
            allowed: true,
            remaining: cap - counter.count,
        })
    }

    fn quota_path(&self, client_id: &str) -> PathBuf {
        self.quota_dir().join(format!("{}.json", quota_key(client_id)))
    }

    // -- expiry -----------------------------------------------------------

    /// Invariant 4: sessions past `expires_at` with a terminal status are
    /// eligible for deletion. Returns the run ids removed.
    pub async fn cleanup_expired(&self) -> Result<Vec<Uuid>, CoreError> {
        let mut removed = Vec::new();
        if !self.base_dir.exists() {
            return Ok(removed);
        }
        let now = Utc::now();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(run_id) = entry.file_name().to_string_lossy().parse::<Uuid>() else {
                continue;
            };
            let Some(session) = self.get_session(run_id).await? else {
                continue;
            };
            if session.is_expired_and_terminal(now) {
                fs::remove_dir_all(entry.path()).await?;
                removed.push(run_id);
            }
        }
        Ok(removed)
    }
}

fn quota_pseudo_run_id(client_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, client_id.as_bytes())
}

fn quota_key(client_id: &str) -> String {
    client_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

async fn atomic_write(path: &Path, content: &str) -> Result<(), CoreError> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn append_jsonl<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), CoreError> {
    use tokio::io::AsyncWriteExt;
    let line = serde_json::to_string(value)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Convenience used by the Orchestrator when logging an error without an
/// existing `CoreError` (e.g. a fetch timeout captured as a plain string).
pub fn internal_error_record(run_id: Uuid, message: impl Into<String>) -> ErrorRecord {
    CoreError::new(ErrorKind::Internal, message)
        .with_run(run_id)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use resume_core_types::AgentName;

    async fn store() -> (tempfile::TempDir, RecoveryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    fn output(run_id: Uuid, agent_index: usize) -> AgentOutput {
        AgentOutput {
            run_id,
            agent_index,
            agent_name: AgentName::from_index(agent_index).unwrap(),
            output_json: serde_json::json!({ "ok": true }),
            raw_text: "raw".into(),
            usage: resume_core_types::TokenUsage {
                tokens_in: 10,
                tokens_out: 20,
                thinking_tokens: 0,
                usage_estimated: false,
            },
            cost_micro_usd: 42,
            model_used: "openai::gpt-4o-mini".into(),
            duration_ms: 100,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_checkpoint_is_idempotent() {
        let (_dir, store) = store().await;
        let run_id = Uuid::new_v4();
        store.save_checkpoint(output(run_id, 0)).await.unwrap();
        store.save_checkpoint(output(run_id, 0)).await.unwrap();
        let checkpoints = store.get_checkpoints(run_id).await.unwrap();
        assert_eq!(checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn checkpoints_load_ordered_by_agent_index() {
        let (_dir, store) = store().await;
        let run_id = Uuid::new_v4();
        store.save_checkpoint(output(run_id, 2)).await.unwrap();
        store.save_checkpoint(output(run_id, 0)).await.unwrap();
        store.save_checkpoint(output(run_id, 1)).await.unwrap();
        let checkpoints = store.get_checkpoints(run_id).await.unwrap();
        assert_eq!(
            checkpoints.iter().map(|c| c.agent_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn events_append_and_query_since() {
        let (_dir, store) = store().await;
        let run_id = Uuid::new_v4();
        for seq in 1..=5u64 {
            let event = Event {
                run_id,
                event_id: seq,
                ts: Utc::now(),
                payload: resume_core_types::EventPayload::Metric {
                    name: "x".into(),
                    value: seq as f64,
                    unit: "count".into(),
                },
            };
            store.record_event(&event).await.unwrap();
        }
        assert_eq!(store.latest_event_id(run_id).await.unwrap(), 5);
        let since_three = store.read_events_after(run_id, 3).await.unwrap();
        assert_eq!(since_three.len(), 2);
        assert_eq!(since_three[0].event_id, 4);
    }

    #[tokio::test]
    async fn quota_increments_atomically_and_denies_past_cap() {
        let (_dir, store) = store().await;
        for expected_remaining in (0..3).rev() {
            let decision = store.increment_and_check_quota("client-a", 3).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = store.increment_and_check_quota("client-a", 3).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_terminal_expired_sessions() {
        let (_dir, store) = store().await;
        let run_id = Uuid::new_v4();
        let mut session = store
            .create_session(run_id, serde_json::json!({}), -1)
            .await
            .unwrap();
        session.status = SessionStatus::Completed;
        store.update_session(&session).await.unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, vec![run_id]);
        assert!(store.get_session(run_id).await.unwrap().is_none());
    }
}
