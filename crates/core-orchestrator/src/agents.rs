use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use resume_core_observability::{emit_event, ObservabilityEvent, ProcessKind};
use resume_core_providers::{
    generate_stream, ChatMessage, GenerateChunk, GenerateOptions, ProviderRegistry,
};
use resume_core_types::{
    AgentName, AgentOutput, AgentStepStatus, CoreError, ErrorKind, EventPayload, TokenUsage,
};
use serde::{Deserialize, Serialize};
use tracing::Level;
use uuid::Uuid;

use crate::event_bus::EventBus;
use crate::insight::InsightTap;
use crate::model_registry::{split_qualified_id, ModelRegistry};

/// Shared context every agent runner needs; cheap to clone (all fields are
/// already `Arc`-backed).
#[derive(Clone)]
pub struct AgentContext {
    pub registry: Arc<ProviderRegistry>,
    pub bus: Arc<EventBus>,
    pub models: Arc<ModelRegistry>,
}

// -- per-agent structured outputs (§4.6) --------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub must_have: Vec<String>,
    #[serde(default)]
    pub nice_to_have: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSignals {
    pub seniority: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAnalysis {
    pub job_title: String,
    #[serde(default)]
    pub company: Option<String>,
    pub requirements: Requirements,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub role_signals: RoleSignals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub sections_to_modify: Vec<String>,
    #[serde(default)]
    pub keyword_plan: Vec<String>,
    #[serde(default)]
    pub experience_mapping: Vec<String>,
    #[serde(default)]
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOutput {
    pub strategy: Strategy,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeChange {
    pub section: String,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderOutput {
    pub optimized_resume_text: String,
    #[serde(default)]
    pub changes: Vec<ResumeChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorScores {
    pub requirements_match: i32,
    pub ats_optimization: i32,
    pub cultural_fit: i32,
    pub presentation_quality: i32,
    pub competitive_positioning: i32,
    pub overall_score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorOutput {
    pub scores: ValidatorScores,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolisherOutput {
    pub polished_resume_text: String,
    pub export_artifact: serde_json::Value,
}

// -- prompts (grounded in the reference implementation's prompt-builder style) --

fn analyzer_prompt(job_text: &str) -> String {
    format!(
        r#"You are a Job Analyzer agent for a resume-tailoring pipeline.

## Job Posting
{job_text}

## Output Format
Output ONLY a JSON object:
```json
{{
  "job_title": "...",
  "company": "...",
  "requirements": {{"must_have": ["..."], "nice_to_have": ["..."]}},
  "keywords": ["..."],
  "role_signals": {{"seniority": "...", "tech_stack": ["..."], "domain": "..."}}
}}
```
Be concise. Output ONLY the JSON object, no other text."#,
        job_text = job_text,
    )
}

fn strategy_prompt(resume_text: &str, job_analysis: &JobAnalysis) -> String {
    format!(
        r#"You are a Strategy Planner agent for a resume-tailoring pipeline.

## Resume
{resume_text}

## Job Analysis
{job_analysis}

## Output Format
Output ONLY a JSON object:
```json
{{
  "strategy": {{
    "sections_to_modify": ["..."],
    "keyword_plan": ["..."],
    "experience_mapping": ["..."],
    "highlights": ["..."]
  }},
  "rationale": "..."
}}
```
Output ONLY the JSON object, no other text."#,
        resume_text = resume_text,
        job_analysis = serde_json::to_string(job_analysis).unwrap_or_default(),
    )
}

fn builder_prompt(original_resume: &str, strategy: &StrategyOutput, job_analysis: &JobAnalysis) -> String {
    format!(
        r#"You are a Resume Builder agent for a resume-tailoring pipeline.

## Original Resume
{original_resume}

## Strategy
{strategy}

## Job Analysis
{job_analysis}

## Output Format
Output ONLY a JSON object:
```json
{{
  "optimized_resume_text": "...",
  "changes": [{{"section": "...", "before": "...", "after": "...", "reason": "..."}}]
}}
```
Output ONLY the JSON object, no other text."#,
        original_resume = original_resume,
        strategy = serde_json::to_string(strategy).unwrap_or_default(),
        job_analysis = serde_json::to_string(job_analysis).unwrap_or_default(),
    )
}

fn validator_prompt(original_resume: &str, optimized_resume_text: &str, job_analysis: &JobAnalysis) -> String {
    format!(
        r#"You are a Validator agent for a resume-tailoring pipeline.

## Original Resume
{original_resume}

## Optimized Resume
{optimized_resume_text}

## Job Analysis
{job_analysis}

## Your Job
Score the optimized resume against the job on five dimensions, each an
integer 0-100: requirements_match, ats_optimization, cultural_fit,
presentation_quality, competitive_positioning. Also list red_flags and
recommendations.

## Output Format
Emit the structured scores between the literal sentinels below, with
nothing else between them:

BEGIN_VALIDATION_SCORES_JSON
{{"scores": {{"requirements_match": 0, "ats_optimization": 0, "cultural_fit": 0, "presentation_quality": 0, "competitive_positioning": 0}}, "red_flags": ["..."], "recommendations": ["..."]}}
END_VALIDATION_SCORES_JSON"#,
        original_resume = original_resume,
        optimized_resume_text = optimized_resume_text,
        job_analysis = serde_json::to_string(job_analysis).unwrap_or_default(),
    )
}

fn polisher_prompt(optimized_resume_text: &str, validation: &ValidatorOutput) -> String {
    format!(
        r#"You are a Polisher agent for a resume-tailoring pipeline.

## Optimized Resume
{optimized_resume_text}

## Validation
{validation}

## Output Format
Output ONLY a JSON object:
```json
{{
  "polished_resume_text": "...",
  "export_artifact": {{"format": "docx-spec", "sections": [...]}}
}}
```
`export_artifact` is a self-contained specification an external renderer
will turn into a DOCX file; do not attempt to render it yourself. Output
ONLY the JSON object, no other text."#,
        optimized_resume_text = optimized_resume_text,
        validation = serde_json::to_string(validation).unwrap_or_default(),
    )
}

// -- parsing (two-tier: strict JSON, then prose-tolerant fallback) -----------

fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();
    for marker in ["```json", "```JSON", "```"] {
        if let Some(start) = output.find(marker) {
            let after = &output[start + marker.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    out.push(block.to_string());
                }
            }
        }
    }
    if let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) {
        if start <= end {
            out.push(output[start..=end].to_string());
        }
    }
    out
}

/// §4.6: "Parser tolerates both fenced JSON and JSON-with-prose; if both
/// fail, the agent fails with `type=AGENT_PARSE` in category RECOVERABLE."
fn parse_structured<T: serde::de::DeserializeOwned>(output: &str) -> Result<T, CoreError> {
    if let Ok(value) = serde_json::from_str::<T>(output.trim()) {
        return Ok(value);
    }
    for candidate in json_candidates(output) {
        if let Ok(value) = serde_json::from_str::<T>(&candidate) {
            return Ok(value);
        }
    }
    Err(CoreError::new(
        ErrorKind::AgentParse,
        "agent response did not match the required JSON schema",
    )
    .with_detail(output.chars().take(2000).collect::<String>()))
}

/// §4.6 Agent 4: scores are extracted only from the sentinel-delimited
/// block, regardless of entry point (see the resolved "streaming vs.
/// per-agent endpoints" open question).
fn extract_validator_scores(output: &str) -> Result<ValidatorOutput, CoreError> {
    const BEGIN: &str = "BEGIN_VALIDATION_SCORES_JSON";
    const END: &str = "END_VALIDATION_SCORES_JSON";

    let start = output.find(BEGIN).ok_or_else(|| {
        CoreError::new(
            ErrorKind::ValidatorScoreMissing,
            "validator output did not contain the score sentinel block",
        )
    })?;
    let after_begin = start + BEGIN.len();
    let end = output[after_begin..].find(END).ok_or_else(|| {
        CoreError::new(
            ErrorKind::ValidatorScoreMissing,
            "validator output's score sentinel block was not closed",
        )
    })?;
    let block = output[after_begin..after_begin + end].trim();

    #[derive(Deserialize)]
    struct RawScores {
        requirements_match: i32,
        ats_optimization: i32,
        cultural_fit: i32,
        presentation_quality: i32,
        competitive_positioning: i32,
        #[serde(default)]
        overall_score: Option<i32>,
    }
    #[derive(Deserialize)]
    struct RawOutput {
        scores: RawScores,
        #[serde(default)]
        red_flags: Vec<String>,
        #[serde(default)]
        recommendations: Vec<String>,
    }

    let raw: RawOutput = serde_json::from_str(block).map_err(|e| {
        CoreError::new(
            ErrorKind::ValidatorScoreMissing,
            "validator score block was not valid JSON",
        )
        .with_detail(e.to_string())
    })?;

    let overall = raw.scores.overall_score.unwrap_or_else(|| {
        let sum = raw.scores.requirements_match
            + raw.scores.ats_optimization
            + raw.scores.cultural_fit
            + raw.scores.presentation_quality
            + raw.scores.competitive_positioning;
        ((sum as f64) / 5.0).round() as i32
    });

    Ok(ValidatorOutput {
        scores: ValidatorScores {
            requirements_match: raw.scores.requirements_match,
            ats_optimization: raw.scores.ats_optimization,
            cultural_fit: raw.scores.cultural_fit,
            presentation_quality: raw.scores.presentation_quality,
            competitive_positioning: raw.scores.competitive_positioning,
            overall_score: overall,
        },
        red_flags: raw.red_flags,
        recommendations: raw.recommendations,
    })
}

// -- the runner contract (§4.6) -----------------------------------------

struct StreamResult {
    raw_text: String,
    usage: TokenUsage,
}

async fn stream_agent(
    ctx: &AgentContext,
    run_id: Uuid,
    agent_index: usize,
    model_id: &str,
    prompt: String,
    insight_tap: Option<&InsightTap>,
) -> Result<StreamResult, CoreError> {
    let (provider_id, bare_model_id) = split_qualified_id(model_id);
    let messages = vec![ChatMessage {
        role: "user".into(),
        content: prompt,
    }];

    let mut stream = Box::pin(generate_stream(
        &ctx.registry,
        Some(provider_id),
        Some(bare_model_id),
        messages,
        GenerateOptions {
            temperature: Some(0.3),
            ..Default::default()
        },
        Duration::from_secs(300),
    ));

    let mut raw_text = String::new();
    let mut usage = TokenUsage {
        tokens_in: 0,
        tokens_out: 0,
        thinking_tokens: 0,
        usage_estimated: false,
    };

    while let Some(chunk) = stream.next().await {
        match chunk? {
            GenerateChunk::DeltaText(text) => {
                if let Some(tap) = insight_tap {
                    tap.push(&text);
                }
                let _ = ctx
                    .bus
                    .publish(
                        run_id,
                        EventPayload::AgentChunk {
                            agent_index,
                            text: text.clone(),
                        },
                    )
                    .await;
                raw_text.push_str(&text);
            }
            GenerateChunk::UsageUpdate { usage: u, estimated } => {
                usage.tokens_in += u.prompt_tokens;
                usage.tokens_out += u.completion_tokens;
                usage.usage_estimated = usage.usage_estimated || estimated;
            }
            GenerateChunk::FinishReason(_) => {}
        }
    }

    Ok(StreamResult { raw_text, usage })
}

async fn run_common(
    ctx: &AgentContext,
    run_id: Uuid,
    agent_index: usize,
    model_id: &str,
    prompt: String,
    insight_tap: Option<&InsightTap>,
) -> Result<(StreamResult, Duration, i64), CoreError> {
    let _ = ctx
        .bus
        .publish(
            run_id,
            EventPayload::AgentStep {
                agent_index,
                agent_name: AgentName::from_index(agent_index).unwrap().as_str().to_string(),
                status: AgentStepStatus::Started,
                tokens_in: 0,
                tokens_out: 0,
                thinking_tokens: 0,
                cost_micro_usd: 0,
                duration_ms: 0,
                from_checkpoint: false,
            },
        )
        .await;

    let run_id_str = run_id.to_string();
    let agent_index_str = agent_index.to_string();
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "agent_started",
            component: "agent_runner",
            run_id: Some(&run_id_str),
            agent_index: Some(&agent_index_str),
            model_id: Some(model_id),
            status: Some("started"),
            ..Default::default()
        },
    );

    let start = Instant::now();
    let result = stream_agent(ctx, run_id, agent_index, model_id, prompt, insight_tap).await?;
    let duration = start.elapsed();

    let cost = ctx
        .models
        .lookup(model_id)
        .map(|m| m.price(result.usage.tokens_in, result.usage.tokens_out, result.usage.thinking_tokens))
        .unwrap_or(0);

    Ok((result, duration, cost))
}

async fn finish_ok(
    ctx: &AgentContext,
    run_id: Uuid,
    agent_index: usize,
    model_id: &str,
    output_json: serde_json::Value,
    raw_text: String,
    usage: TokenUsage,
    cost_micro_usd: i64,
    duration: Duration,
) -> AgentOutput {
    let _ = ctx
        .bus
        .publish(
            run_id,
            EventPayload::AgentStep {
                agent_index,
                agent_name: AgentName::from_index(agent_index).unwrap().as_str().to_string(),
                status: AgentStepStatus::Completed,
                tokens_in: usage.tokens_in,
                tokens_out: usage.tokens_out,
                thinking_tokens: usage.thinking_tokens,
                cost_micro_usd,
                duration_ms: duration.as_millis() as u64,
                from_checkpoint: false,
            },
        )
        .await;

    let run_id_str = run_id.to_string();
    let agent_index_str = agent_index.to_string();
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        ObservabilityEvent {
            event: "agent_completed",
            component: "agent_runner",
            run_id: Some(&run_id_str),
            agent_index: Some(&agent_index_str),
            model_id: Some(model_id),
            status: Some("completed"),
            ..Default::default()
        },
    );

    AgentOutput {
        run_id,
        agent_index,
        agent_name: AgentName::from_index(agent_index).unwrap(),
        output_json,
        raw_text,
        usage,
        cost_micro_usd,
        model_used: model_id.to_string(),
        duration_ms: duration.as_millis() as u64,
        created_at: Utc::now(),
    }
}

pub async fn run_analyzer(
    ctx: &AgentContext,
    run_id: Uuid,
    model_id: &str,
    job_text: &str,
    insight_tap: Option<&InsightTap>,
) -> Result<AgentOutput, CoreError> {
    let prompt = analyzer_prompt(job_text);
    let (result, duration, cost) = run_common(ctx, run_id, 0, model_id, prompt, insight_tap).await?;
    let analysis: JobAnalysis = parse_structured(&result.raw_text)?;
    let output_json = serde_json::to_value(&analysis)?;
    Ok(finish_ok(ctx, run_id, 0, model_id, output_json, result.raw_text, result.usage, cost, duration).await)
}

pub async fn run_strategy(
    ctx: &AgentContext,
    run_id: Uuid,
    model_id: &str,
    resume_text: &str,
    job_analysis: &JobAnalysis,
    insight_tap: Option<&InsightTap>,
) -> Result<AgentOutput, CoreError> {
    let prompt = strategy_prompt(resume_text, job_analysis);
    let (result, duration, cost) = run_common(ctx, run_id, 1, model_id, prompt, insight_tap).await?;
    let strategy: StrategyOutput = parse_structured(&result.raw_text)?;
    let output_json = serde_json::to_value(&strategy)?;
    Ok(finish_ok(ctx, run_id, 1, model_id, output_json, result.raw_text, result.usage, cost, duration).await)
}

pub async fn run_builder(
    ctx: &AgentContext,
    run_id: Uuid,
    model_id: &str,
    original_resume: &str,
    strategy: &StrategyOutput,
    job_analysis: &JobAnalysis,
    insight_tap: Option<&InsightTap>,
) -> Result<AgentOutput, CoreError> {
    let prompt = builder_prompt(original_resume, strategy, job_analysis);
    let (result, duration, cost) = run_common(ctx, run_id, 2, model_id, prompt, insight_tap).await?;
    let builder: BuilderOutput = parse_structured(&result.raw_text)?;
    let output_json = serde_json::to_value(&builder)?;
    Ok(finish_ok(ctx, run_id, 2, model_id, output_json, result.raw_text, result.usage, cost, duration).await)
}

pub async fn run_validator(
    ctx: &AgentContext,
    run_id: Uuid,
    model_id: &str,
    original_resume: &str,
    optimized_resume_text: &str,
    job_analysis: &JobAnalysis,
) -> Result<AgentOutput, CoreError> {
    // Agent 4 is not in the insight-producing set (§4.5).
    let prompt = validator_prompt(original_resume, optimized_resume_text, job_analysis);
    let (result, duration, cost) = run_common(ctx, run_id, 3, model_id, prompt, None).await?;
    let validation = extract_validator_scores(&result.raw_text)?;
    let output_json = serde_json::to_value(&validation)?;
    Ok(finish_ok(ctx, run_id, 3, model_id, output_json, result.raw_text, result.usage, cost, duration).await)
}

pub async fn run_polisher(
    ctx: &AgentContext,
    run_id: Uuid,
    model_id: &str,
    optimized_resume_text: &str,
    validation: &ValidatorOutput,
    insight_tap: Option<&InsightTap>,
) -> Result<AgentOutput, CoreError> {
    let prompt = polisher_prompt(optimized_resume_text, validation);
    let (result, duration, cost) = run_common(ctx, run_id, 4, model_id, prompt, insight_tap).await?;
    let polished: PolisherOutput = parse_structured(&result.raw_text)?;
    let output_json = serde_json::to_value(&polished)?;
    Ok(finish_ok(ctx, run_id, 4, model_id, output_json, result.raw_text, result.usage, cost, duration).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_structured_tolerates_fenced_json_with_prose() {
        let output = "Here is the analysis:\n```json\n{\"job_title\":\"Senior Engineer\",\"requirements\":{\"must_have\":[\"Python\"],\"nice_to_have\":[]},\"keywords\":[\"python\"],\"role_signals\":{\"seniority\":\"senior\",\"tech_stack\":[\"python\"]}}\n```\nDone.";
        let parsed: JobAnalysis = parse_structured(output).unwrap();
        assert_eq!(parsed.job_title, "Senior Engineer");
    }

    #[test]
    fn parse_structured_fails_on_garbage() {
        let result: Result<JobAnalysis, CoreError> = parse_structured("not json at all");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::AgentParse);
    }

    #[test]
    fn extract_validator_scores_backfills_missing_overall() {
        let output = "Evaluation follows.\nBEGIN_VALIDATION_SCORES_JSON\n{\"scores\":{\"requirements_match\":80,\"ats_optimization\":90,\"cultural_fit\":70,\"presentation_quality\":80,\"competitive_positioning\":80},\"red_flags\":[],\"recommendations\":[]}\nEND_VALIDATION_SCORES_JSON\nThanks.";
        let parsed = extract_validator_scores(output).unwrap();
        assert_eq!(parsed.scores.overall_score, 80);
    }

    #[test]
    fn extract_validator_scores_rejects_missing_sentinels() {
        let output = "{\"scores\":{\"requirements_match\":80}}";
        let err = extract_validator_scores(output).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidatorScoreMissing);
    }
}
