use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{FlowConfig, GenerationConfig, PromptsConfig, Settings};
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::chat::{
    ActionType, AnswerResult, ContactData, FlowState, SessionId, SourceRef, UserType,
};
use crate::services::conversation::{
    flow, ConversationMemory, PromptBuilder, SessionOrigin, SessionSnapshot, TurnStart,
};
use crate::services::providers::{
    EmbeddingProvider, GenerationProvider, GenerationRequest, RetrievalProvider,
};
use crate::services::query_analyzer::{MessageAnalysis, QueryAnalyzer};
use crate::services::response_cache::{CacheKey, ResponseCache};
use crate::services::sanitizer::OutputSanitizer;
use crate::utils::error::{BackendError, ChatError};
use crate::utils::limiters::{Backend, BackendLimiters};

const SYSTEM_MODEL_ID: &str = "system";

/// The three external backends the orchestrator talks to.
#[derive(Clone)]
pub struct Backends {
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub retriever: Arc<dyn RetrievalProvider>,
    pub generator: Arc<dyn GenerationProvider>,
}

/// What `answer` hands back to the transport layer.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub session_id: SessionId,
    pub answer: Arc<AnswerResult>,
    pub next_flow_state: FlowState,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub flow_state: FlowState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub recorded: bool,
    pub flow_state: FlowState,
}

/// Rolls a started turn back unless its answer gets recorded, so a request
/// dropped while the backends are running leaves no counted turn behind.
struct PendingTurn<'a> {
    memory: &'a ConversationMemory,
    turn: &'a TurnStart,
    recorded: bool,
}

impl<'a> PendingTurn<'a> {
    fn new(memory: &'a ConversationMemory, turn: &'a TurnStart) -> Self {
        Self {
            memory,
            turn,
            recorded: false,
        }
    }

    fn record(mut self, user_text: &str, assistant_text: &str) -> bool {
        self.recorded = true;
        self.memory
            .complete_turn(&self.turn.snapshot.session_id, user_text, assistant_text)
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.memory.abandon_turn(self.turn);
        }
    }
}

/// How an answer body was produced.
enum BodyOutcome {
    Generated,
    Cached,
    Filtered,
    Fallback(BackendError),
}

pub struct ResponseOrchestrator {
    memory: Arc<ConversationMemory>,
    cache: Arc<ResponseCache>,
    prompt_builder: PromptBuilder,
    sanitizer: OutputSanitizer,
    backends: Backends,
    limiters: BackendLimiters,
    activity: ActivityLogger,
    flow: FlowConfig,
    generation: GenerationConfig,
    prompts: PromptsConfig,
    top_k: usize,
    max_message_chars: usize,
}

impl ResponseOrchestrator {
    pub fn new(settings: &Settings, backends: Backends, activity: ActivityLogger) -> Self {
        Self {
            memory: Arc::new(ConversationMemory::new(&settings.memory)),
            cache: Arc::new(ResponseCache::new(&settings.cache)),
            prompt_builder: PromptBuilder::new(&settings.prompts, &settings.retrieval),
            sanitizer: OutputSanitizer::new(&settings.sanitizer),
            backends,
            limiters: BackendLimiters::new(&settings.backend),
            activity,
            flow: settings.flow.clone(),
            generation: settings.generation.clone(),
            prompts: settings.prompts.clone(),
            top_k: settings.retrieval.top_k,
            max_message_chars: settings.server.max_message_chars,
        }
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn flow_configuration(&self) -> &FlowConfig {
        &self.flow
    }

    /// Single entry point for a user turn.
    ///
    /// Backend failures and content-safety blocks are answered with fixed
    /// replies; only validation and invariant errors reach the caller.
    pub async fn answer(
        &self,
        session_id: Option<&str>,
        message: &str,
        user_type: UserType,
    ) -> Result<TurnReply, ChatError> {
        let started = Instant::now();
        let question = self.validate(message)?;

        let session_id = match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("session-{}", uuid::Uuid::new_v4()),
        };

        let analysis = QueryAnalyzer::analyze(question);
        self.activity.log(
            ActivityLog::builder(&session_id, ActivityType::RequestReceived)
                .status(ActivityStatus::Info)
                .user_type(user_type)
                .message(question)
                .analysis(&analysis)
                .build(),
        );

        let turn = self.memory.begin_turn(&session_id, user_type, &self.flow)?;
        let pending = PendingTurn::new(&self.memory, &turn);
        self.log_session_origin(&session_id, &turn);

        let action = turn.decision.action;
        debug!(
            "Session {} turn {}: action={} score={:.2}",
            session_id,
            turn.snapshot.message_count,
            action.as_str(),
            turn.snapshot.engagement_score
        );
        self.activity.log(
            ActivityLog::builder(&session_id, ActivityType::ActionDecided)
                .status(ActivityStatus::Info)
                .action(action)
                .engagement(turn.snapshot.engagement_score)
                .custom_field(
                    "flow_data",
                    serde_json::to_value(&turn.decision.flow_data).unwrap_or_default(),
                )
                .build(),
        );

        let (answer, outcome) = match action {
            ActionType::ShowWelcome => (
                Arc::new(self.fixed_answer(&self.flow.welcome_message, action, false)),
                BodyOutcome::Generated,
            ),
            ActionType::NormalAnswer => self.cached_body(question, user_type, &turn).await,
            ActionType::RequestDataCapture => {
                let (body, outcome) = self.generated_body(question, user_type, &turn).await;
                (
                    Arc::new(Self::with_follow_up(&body, &self.flow.capture_prompt, action)),
                    outcome,
                )
            }
            ActionType::RequestConsent => {
                let (body, outcome) = self.generated_body(question, user_type, &turn).await;
                (
                    Arc::new(Self::with_follow_up(&body, &self.flow.consent_prompt, action)),
                    outcome,
                )
            }
        };

        pending.record(question, &answer.text);

        let cached = matches!(outcome, BodyOutcome::Cached);
        self.log_outcome(&session_id, &answer, &outcome, &analysis, started);

        Ok(TurnReply {
            session_id,
            answer,
            next_flow_state: turn.next_flow_state,
            cached,
        })
    }

    fn validate<'a>(&self, message: &'a str) -> Result<&'a str, ChatError> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if trimmed.chars().count() > self.max_message_chars {
            return Err(ChatError::MessageTooLong(self.max_message_chars));
        }
        Ok(trimmed)
    }

    /// Normal answers go through the cache; concurrent misses on one key
    /// wait for the first caller and then re-read.
    async fn cached_body(
        &self,
        question: &str,
        user_type: UserType,
        turn: &TurnStart,
    ) -> (Arc<AnswerResult>, BodyOutcome) {
        let key = CacheKey::new(user_type, question);
        if let Some(hit) = self.cache.get(&key) {
            debug!("Cache hit for '{}'", key.question());
            return (hit, BodyOutcome::Cached);
        }

        let _flight = self.cache.single_flight(&key).await;
        if let Some(hit) = self.cache.get(&key) {
            debug!("Cache filled by a concurrent request for '{}'", key.question());
            return (hit, BodyOutcome::Cached);
        }

        let (body, outcome) = self.generated_body(question, user_type, turn).await;
        let body = Arc::new(body);
        if matches!(outcome, BodyOutcome::Generated) {
            self.cache.put(key, body.clone());
        }
        (body, outcome)
    }

    /// Embed, retrieve, build, generate, sanitize. Never fails: backend
    /// errors become the fixed deflection.
    async fn generated_body(
        &self,
        question: &str,
        user_type: UserType,
        turn: &TurnStart,
    ) -> (AnswerResult, BodyOutcome) {
        match self.generate(question, user_type, turn).await {
            Ok(Some(answer)) => (answer, BodyOutcome::Generated),
            Ok(None) => (
                self.fixed_answer(
                    &self.prompts.content_filtered_reply,
                    ActionType::NormalAnswer,
                    true,
                ),
                BodyOutcome::Filtered,
            ),
            Err(e) => {
                error!("Backend failure ({}): {}", e.op(), e);
                (
                    self.fixed_answer(
                        &self.prompts.backend_unavailable_reply,
                        ActionType::NormalAnswer,
                        false,
                    ),
                    BodyOutcome::Fallback(e),
                )
            }
        }
    }

    /// `Ok(None)` when the generation backend refused on safety grounds.
    async fn generate(
        &self,
        question: &str,
        user_type: UserType,
        turn: &TurnStart,
    ) -> Result<Option<AnswerResult>, BackendError> {
        let embedding = self
            .limiters
            .run(Backend::Embedding, self.backends.embedder.embed(question))
            .await?;

        let chunks = self
            .limiters
            .run(
                Backend::Retrieval,
                self.backends.retriever.search(&embedding, self.top_k),
            )
            .await?;

        let prompt = self
            .prompt_builder
            .build(question, &chunks, &turn.history, user_type);

        let request = GenerationRequest {
            prompt: prompt.text,
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            max_tokens: self.generation.max_tokens,
        };
        let generation = self
            .limiters
            .run(Backend::Generation, self.backends.generator.complete(request))
            .await?;

        if generation.safety_blocked {
            warn!(
                "Content filter triggered for session {} (substitutions applied: {})",
                turn.snapshot.session_id,
                prompt.substitutions.len()
            );
            return Ok(None);
        }

        let text = self.sanitizer.sanitize(&generation.text);
        if text.is_empty() {
            return Err(BackendError::Unavailable {
                op: Backend::Generation.as_str(),
                detail: "completion was empty after sanitizing".to_string(),
            });
        }

        Ok(Some(AnswerResult {
            text,
            sources: chunks
                .iter()
                .map(|c| SourceRef::from_chunk(&c.text, &c.metadata))
                .collect(),
            model_id: self.backends.generator.model_id(),
            action_type: ActionType::NormalAnswer,
            content_filtered: false,
        }))
    }

    fn fixed_answer(&self, text: &str, action: ActionType, content_filtered: bool) -> AnswerResult {
        AnswerResult {
            text: text.trim().to_string(),
            sources: Vec::new(),
            model_id: SYSTEM_MODEL_ID.to_string(),
            action_type: action,
            content_filtered,
        }
    }

    /// The question is still answered; the prompt is appended, not substituted.
    fn with_follow_up(body: &AnswerResult, follow_up: &str, action: ActionType) -> AnswerResult {
        AnswerResult {
            text: format!("{}\n\n{}", body.text, follow_up.trim()),
            sources: body.sources.clone(),
            model_id: body.model_id.clone(),
            action_type: action,
            content_filtered: body.content_filtered,
        }
    }

    pub fn record_data_capture(
        &self,
        session_id: &str,
        contact: ContactData,
    ) -> Result<RecordOutcome, ChatError> {
        let recorded = self.memory.record_data_capture(session_id, contact)?;
        if recorded {
            info!("Contact data captured for session {}", session_id);
            self.activity
                .log(ActivityLog::builder(session_id, ActivityType::DataCaptured).build());
        }
        Ok(RecordOutcome {
            recorded,
            flow_state: self.flow_state(session_id)?.flow_state,
        })
    }

    pub fn record_consent(
        &self,
        session_id: &str,
        consent_types: Vec<String>,
    ) -> Result<RecordOutcome, ChatError> {
        let types = consent_types.join(",");
        let recorded = self.memory.record_consent(session_id, consent_types)?;
        if recorded {
            info!("Consent recorded for session {} ({})", session_id, types);
            self.activity.log(
                ActivityLog::builder(session_id, ActivityType::ConsentRecorded)
                    .custom_field("consent_types", serde_json::Value::from(types))
                    .build(),
            );
        }
        Ok(RecordOutcome {
            recorded,
            flow_state: self.flow_state(session_id)?.flow_state,
        })
    }

    pub fn flow_state(&self, session_id: &str) -> Result<FlowStatus, ChatError> {
        let session = self
            .memory
            .snapshot(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;

        Ok(FlowStatus {
            flow_state: flow::flow_state(&session),
            session,
        })
    }

    /// Background reclamation; the lazy per-turn check covers the rest.
    pub fn sweep_idle(&self) -> usize {
        let removed = self.memory.sweep_idle(Instant::now());
        for session_id in &removed {
            self.activity.log(
                ActivityLog::builder(session_id, ActivityType::SessionExpired)
                    .status(ActivityStatus::Info)
                    .build(),
            );
        }
        removed.len()
    }

    fn log_session_origin(&self, session_id: &str, turn: &TurnStart) {
        let activity_type = match turn.origin {
            SessionOrigin::Existing => return,
            SessionOrigin::Created => ActivityType::SessionCreated,
            SessionOrigin::Expired => ActivityType::SessionExpired,
        };
        info!("Session {}: {}", session_id, activity_type.as_str());
        self.activity.log(
            ActivityLog::builder(session_id, activity_type)
                .status(ActivityStatus::Info)
                .user_type(turn.snapshot.user_type)
                .build(),
        );
    }

    fn log_outcome(
        &self,
        session_id: &str,
        answer: &AnswerResult,
        outcome: &BodyOutcome,
        analysis: &MessageAnalysis,
        started: Instant,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let builder = match outcome {
            BodyOutcome::Generated => ActivityLog::builder(session_id, ActivityType::MessageAnswered),
            BodyOutcome::Cached => {
                ActivityLog::builder(session_id, ActivityType::CacheHit).cached(true)
            }
            BodyOutcome::Filtered => ActivityLog::builder(session_id, ActivityType::ContentFiltered)
                .status(ActivityStatus::Warning),
            BodyOutcome::Fallback(e) => ActivityLog::builder(session_id, ActivityType::BackendFallback)
                .error(e.op(), e.to_string()),
        };

        self.activity.log(
            builder
                .action(answer.action_type)
                .response(answer.text.clone())
                .analysis(analysis)
                .processing_time(elapsed_ms)
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LoggerConfig, TracingActivitySink};
    use crate::services::providers::{
        Generation, MockEmbeddingProvider, MockGenerationProvider, MockRetrievalProvider,
        RetrievedChunk,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 0.0;
        settings.backend.call_timeout_seconds = 1;
        settings
    }

    fn logger() -> ActivityLogger {
        ActivityLogger::new(Arc::new(TracingActivitySink), LoggerConfig::default())
    }

    fn chunk(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            text: text.to_string(),
            metadata: HashMap::new(),
            score: 0.8,
        }
    }

    /// Mocks that expect exactly `rounds` full backend rounds.
    fn backends(rounds: usize, generation: Generation) -> Backends {
        let mut embedder = MockEmbeddingProvider::new();
        embedder
            .expect_embed()
            .times(rounds)
            .returning(|_| Ok(vec![0.1, 0.2]));

        let mut retriever = MockRetrievalProvider::new();
        retriever
            .expect_search()
            .times(rounds)
            .returning(|_, _| Ok(vec![chunk("Ten years building data platforms.")]));

        let mut generator = MockGenerationProvider::new();
        generator
            .expect_complete()
            .times(rounds)
            .returning(move |_| Ok(generation.clone()));
        generator
            .expect_model_id()
            .returning(|| "mock-model".to_string());

        Backends {
            embedder: Arc::new(embedder),
            retriever: Arc::new(retriever),
            generator: Arc::new(generator),
        }
    }

    /// Answers after `delay` and counts its calls.
    struct SlowGenerator {
        delay: Duration,
        reply: String,
        calls: AtomicUsize,
    }

    impl SlowGenerator {
        fn new(delay: Duration, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                delay,
                reply: reply.to_string(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl GenerationProvider for SlowGenerator {
        async fn complete(&self, _request: GenerationRequest) -> Result<Generation, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(answered(&self.reply))
        }

        fn model_id(&self) -> String {
            "slow-model".to_string()
        }
    }

    /// Instant embedder and retriever in front of `generator`.
    fn with_generator(rounds: usize, generator: Arc<dyn GenerationProvider>) -> Backends {
        let mut embedder = MockEmbeddingProvider::new();
        embedder
            .expect_embed()
            .times(rounds)
            .returning(|_| Ok(vec![0.1, 0.2]));

        let mut retriever = MockRetrievalProvider::new();
        retriever
            .expect_search()
            .times(rounds)
            .returning(|_, _| Ok(vec![chunk("Ten years building data platforms.")]));

        Backends {
            embedder: Arc::new(embedder),
            retriever: Arc::new(retriever),
            generator,
        }
    }

    fn answered(text: &str) -> Generation {
        Generation {
            text: text.to_string(),
            safety_blocked: false,
        }
    }

    #[tokio::test]
    async fn test_scenario_welcome_then_capture() {
        let orchestrator = ResponseOrchestrator::new(
            &settings(),
            backends(2, answered("I design data platforms.")),
            logger(),
        );

        let mut actions = Vec::new();
        for message in ["hi", "what do you do?", "ok send me info"] {
            let reply = orchestrator
                .answer(Some("s1"), message, UserType::Other)
                .await
                .unwrap();
            actions.push(reply.answer.action_type);
        }

        assert_eq!(
            actions,
            vec![
                ActionType::ShowWelcome,
                ActionType::RequestDataCapture,
                ActionType::RequestDataCapture,
            ]
        );
    }

    #[tokio::test]
    async fn test_capture_prompt_is_appended() {
        let settings = settings();
        let orchestrator = ResponseOrchestrator::new(
            &settings,
            backends(1, answered("I design data platforms.")),
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();
        let reply = orchestrator
            .answer(Some("s"), "what do you do?", UserType::Other)
            .await
            .unwrap();

        assert!(reply.answer.text.starts_with("I design data platforms."));
        assert!(reply.answer.text.ends_with(settings.flow.capture_prompt.trim()));
        assert_eq!(reply.next_flow_state, FlowState::DataCapturePending);
        assert_eq!(reply.answer.sources.len(), 1);
        assert!(!reply.cached);
    }

    #[tokio::test]
    async fn test_identical_question_is_served_from_cache() {
        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 2.0;
        // One backend round for two identical questions.
        let orchestrator = ResponseOrchestrator::new(
            &settings,
            backends(1, answered("Rust, Python and Go.")),
            logger(),
        );

        orchestrator.answer(Some("a"), "hello", UserType::Client).await.unwrap();
        let first = orchestrator
            .answer(Some("a"), "Which languages?", UserType::Client)
            .await
            .unwrap();
        let second = orchestrator
            .answer(Some("b-other-session"), "  which LANGUAGES? ", UserType::Client)
            .await;

        // The second session's first turn is a welcome, not a cached answer.
        assert_eq!(second.unwrap().answer.action_type, ActionType::ShowWelcome);
        let second = orchestrator
            .answer(Some("b-other-session"), "  which LANGUAGES? ", UserType::Client)
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.answer.text, second.answer.text);
        assert_eq!(orchestrator.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_deflected_and_not_cached() {
        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 2.0;

        let mut embedder = MockEmbeddingProvider::new();
        embedder
            .expect_embed()
            .times(2)
            .returning(|_| Err(BackendError::unavailable("embedding", "connection refused")));
        let mut retriever = MockRetrievalProvider::new();
        retriever.expect_search().never();
        let mut generator = MockGenerationProvider::new();
        generator.expect_complete().never();

        let orchestrator = ResponseOrchestrator::new(
            &settings,
            Backends {
                embedder: Arc::new(embedder),
                retriever: Arc::new(retriever),
                generator: Arc::new(generator),
            },
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();
        for _ in 0..2 {
            let reply = orchestrator
                .answer(Some("s"), "what stack?", UserType::Other)
                .await
                .unwrap();
            assert_eq!(
                reply.answer.text,
                settings.prompts.backend_unavailable_reply.trim()
            );
            assert!(!reply.answer.text.contains("connection refused"));
            assert!(!reply.cached);
        }
        assert!(orchestrator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_safety_block_returns_polite_reply() {
        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 2.0;
        let orchestrator = ResponseOrchestrator::new(
            &settings,
            backends(
                1,
                Generation {
                    text: String::new(),
                    safety_blocked: true,
                },
            ),
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();
        let reply = orchestrator
            .answer(Some("s"), "tell me something edgy", UserType::Other)
            .await
            .unwrap();

        assert!(reply.answer.content_filtered);
        assert_eq!(reply.answer.text, settings.prompts.content_filtered_reply.trim());
        assert!(orchestrator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_backend_call() {
        let mut embedder = MockEmbeddingProvider::new();
        embedder.expect_embed().never();
        let mut retriever = MockRetrievalProvider::new();
        retriever.expect_search().never();
        let mut generator = MockGenerationProvider::new();
        generator.expect_complete().never();

        let orchestrator = ResponseOrchestrator::new(
            &settings(),
            Backends {
                embedder: Arc::new(embedder),
                retriever: Arc::new(retriever),
                generator: Arc::new(generator),
            },
            logger(),
        );

        let empty = orchestrator.answer(Some("s"), "   ", UserType::Other).await;
        assert!(matches!(empty, Err(ChatError::EmptyMessage)));

        let long = "x".repeat(601);
        let too_long = orchestrator.answer(Some("s"), &long, UserType::Other).await;
        assert!(matches!(too_long, Err(ChatError::MessageTooLong(600))));

        assert_eq!(orchestrator.memory().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_missing_session_id_is_generated() {
        let orchestrator =
            ResponseOrchestrator::new(&settings(), backends(0, answered("unused")), logger());

        let reply = orchestrator.answer(None, "hi", UserType::Other).await.unwrap();
        assert!(reply.session_id.starts_with("session-"));
        assert_eq!(reply.answer.action_type, ActionType::ShowWelcome);
        assert_eq!(reply.answer.model_id, SYSTEM_MODEL_ID);
    }

    #[tokio::test]
    async fn test_consent_follows_capture() {
        let orchestrator = ResponseOrchestrator::new(
            &settings(),
            backends(2, answered("Sure.")),
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();
        orchestrator.answer(Some("s"), "projects?", UserType::Other).await.unwrap();

        let contact = ContactData {
            email: "jane@example.com".to_string(),
            company: Some("Acme".to_string()),
            role: None,
        };
        assert!(orchestrator.record_data_capture("s", contact.clone()).unwrap().recorded);
        assert!(!orchestrator.record_data_capture("s", contact).unwrap().recorded);

        let reply = orchestrator.answer(Some("s"), "and skills?", UserType::Other).await.unwrap();
        assert_eq!(reply.answer.action_type, ActionType::RequestConsent);
        assert_eq!(reply.next_flow_state, FlowState::ConsentPending);

        let outcome = orchestrator
            .record_consent("s", vec!["analytics".to_string()])
            .unwrap();
        assert!(outcome.recorded);
        assert_eq!(outcome.flow_state, FlowState::ConversationActive);
    }

    #[tokio::test]
    async fn test_flow_state_of_unknown_session() {
        let orchestrator =
            ResponseOrchestrator::new(&settings(), backends(0, answered("unused")), logger());
        assert!(matches!(
            orchestrator.flow_state("nobody"),
            Err(ChatError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_generated_text_is_not_rewritten_by_substitutions() {
        const MODEL_TEXT: &str =
            "I built ML pipelines with YAML configs and HTML dashboards; great results.";

        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 2.0;

        let mut generator = MockGenerationProvider::new();
        generator
            .expect_complete()
            .withf(|request| request.prompt.contains("QUESTION: What results in ML?"))
            .times(1)
            .returning(|_| Ok(answered(MODEL_TEXT)));
        generator
            .expect_model_id()
            .returning(|| "mock-model".to_string());

        let orchestrator = ResponseOrchestrator::new(
            &settings,
            with_generator(1, Arc::new(generator)),
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();
        let reply = orchestrator
            .answer(Some("s"), "What achievements in Machine Learning?", UserType::Other)
            .await
            .unwrap();

        assert_eq!(reply.answer.text, MODEL_TEXT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_turn_rolls_back_count_and_attempt() {
        let mut settings = settings();
        settings.backend.call_timeout_seconds = 30;
        let generator = SlowGenerator::new(Duration::from_secs(3600), "too late");
        let orchestrator = ResponseOrchestrator::new(
            &settings,
            with_generator(1, generator.clone()),
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();

        // The caller goes away while generation is still running.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.answer(Some("s"), "what do you do?", UserType::Other),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(generator.calls(), 1);

        let snapshot = orchestrator.memory().snapshot("s").unwrap();
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.capture_attempts, 0);
        assert_eq!(snapshot.history_pairs, snapshot.message_count as usize);
        assert_eq!(
            orchestrator.flow_state("s").unwrap().flow_state,
            FlowState::ConversationActive
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_turns_on_one_session_are_all_counted() {
        let mut settings = settings();
        settings.memory.history_pairs = 32;
        // Every turn but the welcome reaches the backends once.
        let orchestrator = Arc::new(ResponseOrchestrator::new(
            &settings,
            backends(7, answered("Sure.")),
            logger(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    orchestrator
                        .answer(Some("shared"), &format!("question {}", i), UserType::Other)
                        .await
                })
            })
            .collect();

        let mut welcomes = 0;
        for handle in handles {
            let reply = handle.await.unwrap().unwrap();
            if reply.answer.action_type == ActionType::ShowWelcome {
                welcomes += 1;
            }
        }

        let snapshot = orchestrator.memory().snapshot("shared").unwrap();
        assert_eq!(welcomes, 1);
        assert_eq!(snapshot.message_count, 8);
        assert_eq!(snapshot.history_pairs, 8);
        assert_eq!(snapshot.capture_attempts, settings.flow.max_capture_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_identical_questions_share_one_backend_round() {
        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 2.0;
        let generator = SlowGenerator::new(Duration::from_millis(200), "Rust and Go.");
        let orchestrator = ResponseOrchestrator::new(
            &settings,
            with_generator(1, generator.clone()),
            logger(),
        );

        for session in ["a", "b"] {
            orchestrator.answer(Some(session), "hi", UserType::Client).await.unwrap();
        }

        let (first, second) = tokio::join!(
            orchestrator.answer(Some("a"), "Which languages?", UserType::Client),
            orchestrator.answer(Some("b"), "which languages? ", UserType::Client),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(generator.calls(), 1);
        assert_eq!(first.answer.text, "Rust and Go.");
        assert_eq!(first.answer.text, second.answer.text);
        assert!(first.cached != second.cached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_timeout_is_deflected_and_not_cached() {
        let mut settings = Settings::default();
        settings.flow.engagement_threshold = 2.0;
        settings.backend.call_timeout_seconds = 1;
        let generator = SlowGenerator::new(Duration::from_secs(5), "too late");
        let orchestrator = ResponseOrchestrator::new(
            &settings,
            with_generator(2, generator.clone()),
            logger(),
        );

        orchestrator.answer(Some("s"), "hi", UserType::Other).await.unwrap();
        for _ in 0..2 {
            let reply = orchestrator
                .answer(Some("s"), "what stack?", UserType::Other)
                .await
                .unwrap();
            assert_eq!(
                reply.answer.text,
                settings.prompts.backend_unavailable_reply.trim()
            );
            assert!(!reply.cached);
        }

        assert_eq!(generator.calls(), 2);
        assert!(orchestrator.cache().is_empty());
        let snapshot = orchestrator.memory().snapshot("s").unwrap();
        assert_eq!(snapshot.message_count, 3);
        assert_eq!(snapshot.history_pairs, 3);
    }
}
