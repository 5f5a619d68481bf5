use std::collections::HashMap;

use resume_core_types::ModelInfo;

use crate::config::AppConfig;

/// Static catalog of `provider::model_name` → capabilities and pricing.
/// §4.1: `lookup`, `default_model_for`, and `ModelInfo::price` are the only
/// pricing surface the rest of the core touches.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        let mut models = HashMap::new();
        for m in builtin_models() {
            models.insert(m.qualified_id(), m);
        }
        Self { models }
    }

    pub fn lookup(&self, id: &str) -> Option<&ModelInfo> {
        self.models.get(id)
    }

    /// §4.1: `DEFAULT_MODEL` plus the per-agent `*_MODEL` overrides, in that
    /// precedence order (agent-specific wins).
    pub fn default_model_for(&self, agent_index: usize, config: &AppConfig) -> String {
        let specific = match agent_index {
            0 => &config.analyzer_model,
            1 => &config.optimizer_model,
            2 => &config.implementer_model,
            3 => &config.validator_model,
            4 => &config.polish_model,
            _ => &None,
        };
        specific
            .clone()
            .unwrap_or_else(|| config.default_model.clone())
    }

    pub fn insight_model(&self, config: &AppConfig) -> String {
        config
            .insight_model
            .clone()
            .unwrap_or_else(|| config.default_model.clone())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a qualified `provider::model_name` id into its two halves for the
/// Provider Façade, which selects providers and models independently.
pub fn split_qualified_id(id: &str) -> (&str, &str) {
    id.split_once("::").unwrap_or((id, id))
}

fn builtin_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            provider: "openai".into(),
            model_name: "gpt-4o-mini".into(),
            context_length: 128_000,
            input_cost_per_million: 150_000,
            output_cost_per_million: 600_000,
            thinking_cost_per_million: 600_000,
            supports_streaming: true,
            supports_files: false,
            supports_images: true,
            supports_reasoning_budget: false,
            thinking_bills_as_output: false,
            fallback_model_id: Some("openai::gpt-4o-mini".into()),
        },
        ModelInfo {
            provider: "openai".into(),
            model_name: "gpt-5.2".into(),
            context_length: 256_000,
            input_cost_per_million: 2_000_000,
            output_cost_per_million: 8_000_000,
            thinking_cost_per_million: 8_000_000,
            supports_streaming: true,
            supports_files: true,
            supports_images: true,
            supports_reasoning_budget: true,
            thinking_bills_as_output: true,
            fallback_model_id: Some("openai::gpt-4o-mini".into()),
        },
        ModelInfo {
            provider: "anthropic".into(),
            model_name: "claude-sonnet-4-6".into(),
            context_length: 200_000,
            input_cost_per_million: 3_000_000,
            output_cost_per_million: 15_000_000,
            thinking_cost_per_million: 15_000_000,
            supports_streaming: true,
            supports_files: true,
            supports_images: true,
            supports_reasoning_budget: true,
            thinking_bills_as_output: true,
            fallback_model_id: Some("openai::gpt-4o-mini".into()),
        },
        ModelInfo {
            provider: "groq".into(),
            model_name: "llama-3.1-8b-instant".into(),
            context_length: 128_000,
            input_cost_per_million: 50_000,
            output_cost_per_million: 80_000,
            thinking_cost_per_million: 80_000,
            supports_streaming: true,
            supports_files: false,
            supports_images: false,
            supports_reasoning_budget: false,
            thinking_bills_as_output: false,
            fallback_model_id: None,
        },
        ModelInfo {
            provider: "ollama".into(),
            model_name: "llama3.1:8b".into(),
            context_length: 128_000,
            input_cost_per_million: 0,
            output_cost_per_million: 0,
            thinking_cost_per_million: 0,
            supports_streaming: true,
            supports_files: false,
            supports_images: false,
            supports_reasoning_budget: false,
            thinking_bills_as_output: false,
            fallback_model_id: None,
        },
        ModelInfo {
            provider: "local".into(),
            model_name: "echo".into(),
            context_length: 8_000,
            input_cost_per_million: 0,
            output_cost_per_million: 0,
            thinking_cost_per_million: 0,
            supports_streaming: true,
            supports_files: false,
            supports_images: false,
            supports_reasoning_budget: false,
            thinking_bills_as_output: false,
            fallback_model_id: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_qualified_id() {
        let reg = ModelRegistry::new();
        assert!(reg.lookup("openai::gpt-4o-mini").is_some());
        assert!(reg.lookup("nope::nope").is_none());
    }

    #[test]
    fn split_qualified_id_separates_provider_and_model() {
        assert_eq!(split_qualified_id("openai::gpt-4o-mini"), ("openai", "gpt-4o-mini"));
    }

    #[test]
    fn default_model_for_prefers_agent_override() {
        let reg = ModelRegistry::new();
        let mut config = AppConfig::default();
        config.default_model = "local::echo".into();
        config.validator_model = Some("openai::gpt-4o-mini".into());
        assert_eq!(reg.default_model_for(3, &config), "openai::gpt-4o-mini");
        assert_eq!(reg.default_model_for(0, &config), "local::echo");
    }
}
