use serde::{Deserialize, Serialize};

/// Catalog entry: `provider::model_name` → capabilities and unit pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
    pub context_length: u64,
    /// USD per million input tokens, stored as micro-usd-per-token-million to
    /// stay integer-exact in `price()`.
    pub input_cost_per_million: i64,
    pub output_cost_per_million: i64,
    pub thinking_cost_per_million: i64,
    pub supports_streaming: bool,
    pub supports_files: bool,
    pub supports_images: bool,
    pub supports_reasoning_budget: bool,
    /// If true, thinking tokens bill at the output rate alongside tokens_out
    /// rather than having their own rate applied separately.
    pub thinking_bills_as_output: bool,
    /// Fallback model id the Orchestrator may retry a RECOVERABLE error with.
    pub fallback_model_id: Option<String>,
}

impl ModelInfo {
    pub fn qualified_id(&self) -> String {
        format!("{}::{}", self.provider, self.model_name)
    }

    /// §4.1 pricing formula.
    pub fn price(&self, tokens_in: u64, tokens_out: u64, thinking_tokens: u64) -> i64 {
        let input_cost = (tokens_in as i128 * self.input_cost_per_million as i128) / 1_000_000;
        let output_cost = if self.thinking_bills_as_output {
            ((tokens_out + thinking_tokens) as i128 * self.output_cost_per_million as i128)
                / 1_000_000
        } else {
            let out = (tokens_out as i128 * self.output_cost_per_million as i128) / 1_000_000;
            let thinking =
                (thinking_tokens as i128 * self.thinking_cost_per_million as i128) / 1_000_000;
            out + thinking
        };
        (input_cost + output_cost) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelInfo {
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
            fallback_model_id: None,
        }
    }

    #[test]
    fn qualified_id_joins_provider_and_model() {
        assert_eq!(model().qualified_id(), "openai::gpt-4o-mini");
    }

    #[test]
    fn price_scales_linearly_with_tokens() {
        let m = model();
        assert_eq!(m.price(1_000_000, 0, 0), 150_000);
        assert_eq!(m.price(0, 1_000_000, 0), 600_000);
    }

    #[test]
    fn price_folds_thinking_into_output_rate_when_marked() {
        let mut m = model();
        m.thinking_bills_as_output = true;
        m.output_cost_per_million = 1_000_000;
        assert_eq!(m.price(0, 500_000, 500_000), 1_000_000);
    }
}
