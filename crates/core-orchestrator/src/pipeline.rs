use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resume_core_observability::{emit_event, short_hash, ObservabilityEvent, ProcessKind};
use resume_core_types::{
    retry_policy, AgentOutput, CoreError, ErrorKind, EventPayload, JobSourceKind, OverallStatus,
    RecoverySession, RetryDecision, RunRequest, SessionStatus,
};
use tracing::{warn, Level};
use uuid::Uuid;

use crate::agents::{self, AgentContext, JobAnalysis, StrategyOutput, ValidatorOutput};
use crate::config::AppConfig;
use crate::event_bus::EventBus;
use crate::insight::InsightExtractor;
use crate::model_registry::ModelRegistry;
use crate::store::{internal_error_record, RecoveryStore};

/// External collaborator (§6): resolves a `job_url` to plain text. Out of
/// scope for this core beyond the call signature; production wiring plugs
/// in whatever HTTP client and readability extraction the deployment uses.
#[async_trait]
pub trait JobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, CoreError>;
}

/// Used wherever a deployment has not wired a real fetcher (e.g. smoke
/// tests); always fails `JOB_FETCH_FAILED`, matching E6.
pub struct UnconfiguredJobFetcher;

#[async_trait]
impl JobFetcher for UnconfiguredJobFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, CoreError> {
        Err(CoreError::new(
            ErrorKind::JobFetchFailed,
            "no job fetcher is configured for this deployment",
        ))
    }
}

const AGENT_RETRY_BACKOFF_SECS: [u64; 3] = [2, 4, 8];
const JOB_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Orchestrator {
    pub store: Arc<RecoveryStore>,
    pub bus: Arc<EventBus>,
    pub models: Arc<ModelRegistry>,
    pub insights: Arc<InsightExtractor>,
    pub ctx: AgentContext,
    pub job_fetcher: Arc<dyn JobFetcher>,
    pub config: AppConfig,
}

pub struct StartRunOutcome {
    pub run_id: Uuid,
    pub quota_remaining: u32,
}

impl Orchestrator {
    /// §4.7 Admission. On success, spawns the sequencing loop as a
    /// background task and returns immediately with `pending`.
    pub async fn start_run(self: &Arc<Self>, request: RunRequest) -> Result<StartRunOutcome, CoreError> {
        request
            .validate()
            .map_err(|msg| CoreError::new(ErrorKind::BadRequest, msg))?;

        let job_text = match (&request.job_text, &request.job_url) {
            (Some(text), None) => text.clone(),
            (None, Some(url)) => {
                tokio::time::timeout(JOB_FETCH_TIMEOUT, self.job_fetcher.fetch(url))
                    .await
                    .map_err(|_| {
                        CoreError::new(ErrorKind::JobFetchFailed, "job posting fetch timed out")
                    })??
            }
            _ => unreachable!("RunRequest::validate enforces exactly one of job_text/job_url"),
        };

        let decision = self
            .store
            .increment_and_check_quota(&request.client_id, self.config.max_free_runs)
            .await?;
        if !decision.allowed && !self.config.dev_mode {
            return Err(CoreError::new(
                ErrorKind::QuotaExceeded,
                "free run quota exhausted for this client",
            ));
        }
        if !decision.allowed && self.config.dev_mode {
            warn!(client_id = %request.client_id, count = self.config.max_free_runs, "quota exceeded, bypassed by dev mode");
        }

        let run_id = Uuid::new_v4();
        let form_data = serde_json::json!({
            "client_id": request.client_id,
            "resume_text": request.resume_text,
            "job_text": job_text,
            "linkedin_url": request.linkedin_url,
            "github_username": request.github_username,
            "models": request.models,
        });
        self.store
            .create_session(run_id, form_data, self.config.session_ttl_days)
            .await?;

        let client_hash = short_hash(&request.client_id);
        let run_id_str = run_id.to_string();
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "run_admitted",
                component: "orchestrator",
                run_id: Some(&run_id_str),
                client_id_hash: Some(&client_hash),
                status: Some("pending"),
                ..Default::default()
            },
        );

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_pipeline(run_id).await;
        });

        Ok(StartRunOutcome {
            run_id,
            quota_remaining: decision.remaining,
        })
    }

    /// Resumes a failed session from its last completed checkpoint, per
    /// `POST /optimize-retry`. Returns 409-worthy `BadRequest` once a caller
    /// has exhausted manual retries.
    pub async fn retry_run(self: &Arc<Self>, run_id: Uuid, max_retries: u32) -> Result<(), CoreError> {
        let mut session = self
            .store
            .get_session(run_id)
            .await?
            .ok_or_else(|| CoreError::new(ErrorKind::BadRequest, "no recovery session for run"))?;

        if session.retry_count >= max_retries {
            return Err(CoreError::new(
                ErrorKind::BadRequest,
                "retry_count has reached the maximum for this session",
            ));
        }

        session.retry_count += 1;
        session.status = SessionStatus::Running;
        self.store.update_session(&session).await?;

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_pipeline(run_id).await;
        });

        Ok(())
    }

    async fn run_pipeline(self: Arc<Self>, run_id: Uuid) {
        let run_budget = Duration::from_secs(self.config.run_timeout_seconds);
        match tokio::time::timeout(run_budget, self.run_pipeline_inner(run_id)).await {
            Ok(()) => {}
            Err(_) => {
                let err = CoreError::new(ErrorKind::Timeout, "run exceeded its wall-clock budget")
                    .with_run(run_id);
                self.fail_run(run_id, err).await;
            }
        }
    }

    async fn run_pipeline_inner(self: &Arc<Self>, run_id: Uuid) {
        let Ok(Some(mut session)) = self.store.get_session(run_id).await else {
            return;
        };

        session.status = SessionStatus::Running;
        if self.store.update_session(&session).await.is_err() {
            return;
        }

        let resume_text = session.form_data["resume_text"].as_str().unwrap_or("").to_string();
        let job_text = session.form_data["job_text"].as_str().unwrap_or("").to_string();
        let models: resume_core_types::ModelOverrides =
            serde_json::from_value(session.form_data["models"].clone()).unwrap_or_default();

        let models_by_agent: Vec<String> = (0..resume_core_types::AGENT_COUNT)
            .map(|i| {
                models
                    .for_agent_index(i)
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| self.models.default_model_for(i, &self.config))
            })
            .collect();

        let _ = self
            .bus
            .publish(
                run_id,
                EventPayload::JobStarted {
                    resume_length: resume_text.chars().count(),
                    job_source: if session.form_data.get("job_text").is_some() {
                        JobSourceKind::Text
                    } else {
                        JobSourceKind::Url
                    },
                    models_by_agent: models_by_agent.clone(),
                },
            )
            .await;

        let mut job_analysis: Option<JobAnalysis> = None;
        let mut strategy: Option<StrategyOutput> = None;
        let mut optimized_resume_text: Option<String> = None;
        let mut validation: Option<ValidatorOutput> = None;

        for agent_index in 0..resume_core_types::AGENT_COUNT {
            if session.completed_agents.contains(&agent_index) {
                if let Ok(Some(checkpoint)) = self.store.get_checkpoint(run_id, agent_index).await {
                    self.replay_checkpoint_state(
                        agent_index,
                        &checkpoint,
                        &mut job_analysis,
                        &mut strategy,
                        &mut optimized_resume_text,
                        &mut validation,
                    );
                    let _ = self
                        .bus
                        .publish(
                            run_id,
                            EventPayload::AgentStep {
                                agent_index,
                                agent_name: resume_core_types::AgentName::from_index(agent_index)
                                    .unwrap()
                                    .as_str()
                                    .to_string(),
                                status: resume_core_types::AgentStepStatus::Completed,
                                tokens_in: checkpoint.usage.tokens_in,
                                tokens_out: checkpoint.usage.tokens_out,
                                thinking_tokens: checkpoint.usage.thinking_tokens,
                                cost_micro_usd: checkpoint.cost_micro_usd,
                                duration_ms: 0,
                                from_checkpoint: true,
                            },
                        )
                        .await;
                    continue;
                }
            }

            let model_id = models_by_agent[agent_index].clone();
            let output = match self
                .run_agent_with_retry(
                    run_id,
                    agent_index,
                    &model_id,
                    &resume_text,
                    &job_text,
                    &job_analysis,
                    &strategy,
                    &optimized_resume_text,
                    &validation,
                )
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    self.fail_run(run_id, err).await;
                    return;
                }
            };

            self.replay_checkpoint_state(
                agent_index,
                &output,
                &mut job_analysis,
                &mut strategy,
                &mut optimized_resume_text,
                &mut validation,
            );

            if let Err(err) = self.store.save_checkpoint(output).await {
                self.fail_run(run_id, err).await;
                return;
            }

            let run_id_str = run_id.to_string();
            let agent_index_str = agent_index.to_string();
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "checkpoint_saved",
                    component: "orchestrator",
                    run_id: Some(&run_id_str),
                    agent_index: Some(&agent_index_str),
                    status: Some("completed"),
                    ..Default::default()
                },
            );

            session.completed_agents.insert(agent_index);
            let _ = self.store.update_session(&session).await;
        }

        self.complete_run(run_id, &mut session).await;
    }

    fn replay_checkpoint_state(
        &self,
        agent_index: usize,
        output: &AgentOutput,
        job_analysis: &mut Option<JobAnalysis>,
        strategy: &mut Option<StrategyOutput>,
        optimized_resume_text: &mut Option<String>,
        validation: &mut Option<ValidatorOutput>,
    ) {
        match agent_index {
            0 => *job_analysis = serde_json::from_value(output.output_json.clone()).ok(),
            1 => *strategy = serde_json::from_value(output.output_json.clone()).ok(),
            2 => {
                *optimized_resume_text = output.output_json["optimized_resume_text"]
                    .as_str()
                    .map(|s| s.to_string());
            }
            3 => *validation = serde_json::from_value(output.output_json.clone()).ok(),
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_agent_with_retry(
        self: &Arc<Self>,
        run_id: Uuid,
        agent_index: usize,
        model_id: &str,
        resume_text: &str,
        job_text: &str,
        job_analysis: &Option<JobAnalysis>,
        strategy: &Option<StrategyOutput>,
        optimized_resume_text: &Option<String>,
        validation: &Option<ValidatorOutput>,
    ) -> Result<AgentOutput, CoreError> {
        let mut current_model = model_id.to_string();
        let mut attempt = 0u32;
        let mut used_fallback = false;
        let agent_budget = Duration::from_secs(self.config.agent_timeout_seconds);

        loop {
            let insight_tap = if InsightExtractor::produces_insights(agent_index) {
                Some(
                    self.insights
                        .spawn_tap(run_id, agent_index, self.models.insight_model(&self.config)),
                )
            } else {
                None
            };

            let result = tokio::time::timeout(
                agent_budget,
                self.dispatch_agent(
                    run_id,
                    agent_index,
                    &current_model,
                    resume_text,
                    job_text,
                    job_analysis,
                    strategy,
                    optimized_resume_text,
                    validation,
                    insight_tap.as_ref(),
                ),
            )
            .await;

            if let Some(tap) = insight_tap {
                tap.finish().await;
            }

            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(CoreError::new(
                    ErrorKind::Timeout,
                    "agent exceeded its wall-clock budget",
                )
                .with_run(run_id)),
            };

            let err = match outcome {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let error_id = self
                .store
                .log_error(err.clone().with_run(run_id).into())
                .await
                .unwrap_or(err.error_id);
            let _ = self
                .bus
                .publish(
                    run_id,
                    EventPayload::Error {
                        error_id,
                        category: err.category(),
                        r#type: err.kind,
                        message: resume_core_types::sanitize_message(&err.message),
                    },
                )
                .await;
            let _ = self
                .bus
                .publish(
                    run_id,
                    EventPayload::AgentStep {
                        agent_index,
                        agent_name: resume_core_types::AgentName::from_index(agent_index)
                            .unwrap()
                            .as_str()
                            .to_string(),
                        status: resume_core_types::AgentStepStatus::Failed,
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
            let kind_str = format!("{:?}", err.kind);
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "agent_failed",
                    component: "orchestrator",
                    run_id: Some(&run_id_str),
                    agent_index: Some(&agent_index_str),
                    status: Some("failed"),
                    error_code: Some(&kind_str),
                    ..Default::default()
                },
            );

            match retry_policy(err.category()) {
                RetryDecision::RetryInPlace => {
                    if (attempt as usize) >= AGENT_RETRY_BACKOFF_SECS.len() {
                        return Err(err);
                    }
                    emit_event(
                        Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "retry_scheduled",
                            component: "orchestrator",
                            run_id: Some(&run_id_str),
                            agent_index: Some(&agent_index_str),
                            status: Some("retry_in_place"),
                            ..Default::default()
                        },
                    );
                    tokio::time::sleep(Duration::from_secs(
                        AGENT_RETRY_BACKOFF_SECS[attempt as usize],
                    ))
                    .await;
                    attempt += 1;
                }
                RetryDecision::RetryWithFallbackModel => {
                    if used_fallback {
                        return Err(err);
                    }
                    match self.models.lookup(&current_model).and_then(|m| m.fallback_model_id.clone()) {
                        Some(fallback) => {
                            emit_event(
                                Level::INFO,
                                ProcessKind::Engine,
                                ObservabilityEvent {
                                    event: "retry_scheduled",
                                    component: "orchestrator",
                                    run_id: Some(&run_id_str),
                                    agent_index: Some(&agent_index_str),
                                    status: Some("retry_with_fallback_model"),
                                    model_id: Some(&fallback),
                                    ..Default::default()
                                },
                            );
                            current_model = fallback;
                            used_fallback = true;
                        }
                        None => return Err(err),
                    }
                }
                RetryDecision::Fail => return Err(err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_agent(
        &self,
        run_id: Uuid,
        agent_index: usize,
        model_id: &str,
        resume_text: &str,
        job_text: &str,
        job_analysis: &Option<JobAnalysis>,
        strategy: &Option<StrategyOutput>,
        optimized_resume_text: &Option<String>,
        validation: &Option<ValidatorOutput>,
        insight_tap: Option<&crate::insight::InsightTap>,
    ) -> Result<AgentOutput, CoreError> {
        match agent_index {
            0 => agents::run_analyzer(&self.ctx, run_id, model_id, job_text, insight_tap).await,
            1 => {
                let analysis = job_analysis.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "strategy step ran without an analysis")
                })?;
                agents::run_strategy(&self.ctx, run_id, model_id, resume_text, analysis, insight_tap).await
            }
            2 => {
                let plan = strategy.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "builder step ran without a strategy")
                })?;
                let analysis = job_analysis.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "builder step ran without an analysis")
                })?;
                agents::run_builder(&self.ctx, run_id, model_id, resume_text, plan, analysis, insight_tap).await
            }
            3 => {
                let optimized = optimized_resume_text.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "validator step ran without a built resume")
                })?;
                let analysis = job_analysis.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "validator step ran without an analysis")
                })?;
                agents::run_validator(&self.ctx, run_id, model_id, resume_text, optimized, analysis).await
            }
            4 => {
                let optimized = optimized_resume_text.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "polisher step ran without a built resume")
                })?;
                let validation = validation.as_ref().ok_or_else(|| {
                    CoreError::new(ErrorKind::Internal, "polisher step ran without validation")
                })?;
                agents::run_polisher(&self.ctx, run_id, model_id, optimized, validation, insight_tap).await
            }
            _ => unreachable!("AGENT_COUNT is 5"),
        }
    }

    async fn complete_run(&self, run_id: Uuid, session: &mut RecoverySession) {
        let checkpoints = self.store.get_checkpoints(run_id).await.unwrap_or_default();
        let total_cost_micro_usd: i64 = checkpoints.iter().map(|c| c.cost_micro_usd).sum();

        session.status = SessionStatus::Completed;
        let _ = self.store.update_session(session).await;

        let _ = self
            .bus
            .publish(
                run_id,
                EventPayload::Metric {
                    name: "total_cost_micro_usd".into(),
                    value: total_cost_micro_usd as f64,
                    unit: "micro_usd".into(),
                },
            )
            .await;

        let _ = self
            .bus
            .publish(
                run_id,
                EventPayload::Done {
                    overall_status: OverallStatus::Succeeded,
                    total_cost_micro_usd,
                    checkpoint_count: checkpoints.len(),
                },
            )
            .await;
    }

    async fn fail_run(&self, run_id: Uuid, err: CoreError) {
        if let Ok(Some(mut session)) = self.store.get_session(run_id).await {
            session.status = SessionStatus::Failed;
            session.error_id = Some(err.error_id);
            let _ = self.store.update_session(&session).await;
        }

        let error_id = self
            .store
            .log_error(err.clone().with_run(run_id).into())
            .await
            .unwrap_or(err.error_id);

        let _ = self
            .bus
            .publish(
                run_id,
                EventPayload::Error {
                    error_id,
                    category: err.category(),
                    r#type: err.kind,
                    message: resume_core_types::sanitize_message(&err.message),
                },
            )
            .await;
    }
}

/// Used by `cleanup_expired`'s caller to log a non-`CoreError` failure, e.g.
/// a filesystem sweep hitting a permission error outside the store's own
/// error path.
pub async fn log_internal(store: &RecoveryStore, run_id: Uuid, message: impl Into<String>) {
    let _ = store.log_error(internal_error_record(run_id, message)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use resume_core_providers::ProviderRegistry;

    struct StaticJobFetcher(String);

    #[async_trait]
    impl JobFetcher for StaticJobFetcher {
        async fn fetch(&self, _url: &str) -> Result<String, CoreError> {
            Ok(self.0.clone())
        }
    }

    async fn orchestrator() -> (tempfile::TempDir, Arc<Orchestrator>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecoveryStore::new(dir.path()).await.unwrap());
        let bus = EventBus::new(store.clone());
        let config = AppConfig::default();
        let registry = Arc::new(ProviderRegistry::new(resume_core_providers::AppConfig {
            providers: Default::default(),
            default_provider: None,
        }));
        let models = Arc::new(ModelRegistry::new());
        let insights = InsightExtractor::new(bus.clone(), registry.clone(), 400, 1.0);
        let ctx = AgentContext {
            registry,
            bus: bus.clone(),
            models: models.clone(),
        };
        let orchestrator = Arc::new(Orchestrator {
            store,
            bus,
            models,
            insights: Arc::new(insights),
            ctx,
            job_fetcher: Arc::new(StaticJobFetcher("a job posting".into())),
            config,
        });
        (dir, orchestrator)
    }

    #[tokio::test]
    async fn start_run_rejects_malformed_request() {
        let (_dir, orch) = orchestrator().await;
        let request = RunRequest {
            client_id: "c1".into(),
            resume_text: "".into(),
            job_text: Some("job".into()),
            job_url: None,
            linkedin_url: None,
            github_username: None,
            models: Default::default(),
        };
        let err = orch.start_run(request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn start_run_denies_past_quota_cap() {
        let (_dir, orch) = orchestrator().await;
        for _ in 0..orch.config.max_free_runs {
            orch.store
                .increment_and_check_quota("c1", orch.config.max_free_runs)
                .await
                .unwrap();
        }
        let request = RunRequest {
            client_id: "c1".into(),
            resume_text: "resume".into(),
            job_text: Some("job".into()),
            job_url: None,
            linkedin_url: None,
            github_username: None,
            models: Default::default(),
        };
        let err = orch.start_run(request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
    }
}
