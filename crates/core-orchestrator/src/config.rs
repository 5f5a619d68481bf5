use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

/// Effective, typed configuration for one process: the merged view of
/// defaults < `config.json` < environment < CLI, per §6's "Configuration"
/// table. `ConfigStore` keeps the raw JSON layers around so `get()` can
/// be recomputed after a CLI override is applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub default_model: String,
    pub analyzer_model: Option<String>,
    pub optimizer_model: Option<String>,
    pub implementer_model: Option<String>,
    pub validator_model: Option<String>,
    pub polish_model: Option<String>,
    pub profile_model: Option<String>,
    pub insight_model: Option<String>,
    pub max_free_runs: u32,
    pub dev_mode: bool,
    pub agent_timeout_seconds: u64,
    pub run_timeout_seconds: u64,
    pub insight_flush_chars: usize,
    pub insight_flush_seconds: f64,
    pub session_ttl_days: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: "openai::gpt-4o-mini".into(),
            analyzer_model: None,
            optimizer_model: None,
            implementer_model: None,
            validator_model: None,
            polish_model: None,
            profile_model: None,
            insight_model: None,
            max_free_runs: 5,
            dev_mode: false,
            agent_timeout_seconds: 300,
            run_timeout_seconds: 1800,
            insight_flush_chars: 400,
            insight_flush_seconds: 1.0,
            session_ttl_days: 7,
        }
    }
}

/// Layered config store, the same deep-merge shape the reference
/// implementation's `ConfigStore` uses, narrowed to the keys this core
/// actually recognizes (§6's Configuration table).
#[derive(Clone)]
pub struct ConfigStore {
    file_path: PathBuf,
}

impl ConfigStore {
    /// `file_path` is the on-disk `config.json`; missing is treated as empty.
    pub async fn new(file_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file_path = file_path.as_ref().to_path_buf();
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self { file_path })
    }

    pub async fn load(&self, cli_overrides: Option<Value>) -> anyhow::Result<AppConfig> {
        let mut merged = defaults_layer();
        deep_merge(&mut merged, &self.read_file_layer().await?);
        deep_merge(&mut merged, &env_layer());
        if let Some(cli) = cli_overrides {
            deep_merge(&mut merged, &cli);
        }
        Ok(serde_json::from_value(merged)?)
    }

    async fn read_file_layer(&self) -> anyhow::Result<Value> {
        if !self.file_path.exists() {
            return Ok(empty_object());
        }
        let raw = fs::read_to_string(&self.file_path).await?;
        Ok(serde_json::from_str(&raw).unwrap_or_else(|_| empty_object()))
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn defaults_layer() -> Value {
    serde_json::to_value(AppConfig::default()).expect("AppConfig defaults always serialize")
}

/// Secrets (provider API keys) are read only from the process environment in
/// `resume_core_providers::providers_impl`, never through this config layer,
/// so nothing here ever holds a key that could round-trip back to disk.
fn env_layer() -> Value {
    let mut root = empty_object();
    set_str(&mut root, "default_model", "DEFAULT_MODEL");
    set_str(&mut root, "analyzer_model", "ANALYZER_MODEL");
    set_str(&mut root, "optimizer_model", "OPTIMIZER_MODEL");
    set_str(&mut root, "implementer_model", "IMPLEMENTER_MODEL");
    set_str(&mut root, "validator_model", "VALIDATOR_MODEL");
    set_str(&mut root, "polish_model", "POLISH_MODEL");
    set_str(&mut root, "profile_model", "PROFILE_MODEL");
    set_str(&mut root, "insight_model", "INSIGHT_MODEL");
    set_num(&mut root, "max_free_runs", "MAX_FREE_RUNS");
    set_bool(&mut root, "dev_mode", "DEV_MODE");
    set_num(&mut root, "agent_timeout_seconds", "AGENT_TIMEOUT_SECONDS");
    set_num(&mut root, "run_timeout_seconds", "RUN_TIMEOUT_SECONDS");
    set_num(&mut root, "insight_flush_chars", "INSIGHT_FLUSH_CHARS");
    set_num(&mut root, "insight_flush_seconds", "INSIGHT_FLUSH_SECONDS");
    set_num(&mut root, "session_ttl_days", "SESSION_TTL_DAYS");
    root
}

fn set_str(root: &mut Value, key: &str, env: &str) {
    if let Ok(v) = std::env::var(env) {
        if !v.trim().is_empty() {
            deep_merge(root, &json!({ key: v }));
        }
    }
}

fn set_num(root: &mut Value, key: &str, env: &str) {
    if let Ok(v) = std::env::var(env) {
        if let Ok(n) = v.trim().parse::<f64>() {
            deep_merge(root, &json!({ key: n }));
        }
    }
}

fn set_bool(root: &mut Value, key: &str, env: &str) {
    if let Ok(v) = std::env::var(env) {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => deep_merge(root, &json!({ key: true })),
            "0" | "false" | "no" | "off" => deep_merge(root, &json!({ key: false })),
            _ => {}
        }
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_layer_overrides_defaults_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"default_model": "from-file", "max_free_runs": 9}"#)
            .await
            .unwrap();

        std::env::set_var("MAX_FREE_RUNS", "3");
        let store = ConfigStore::new(&path).await.unwrap();
        let config = store.load(None).await.unwrap();
        std::env::remove_var("MAX_FREE_RUNS");

        assert_eq!(config.default_model, "from-file");
        assert_eq!(config.max_free_runs, 3);
    }

    #[tokio::test]
    async fn cli_overrides_win_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path).await.unwrap();
        let config = store
            .load(Some(json!({ "dev_mode": true })))
            .await
            .unwrap();
        assert!(config.dev_mode);
    }
}
