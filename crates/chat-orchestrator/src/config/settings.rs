use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub flow: FlowConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub sanitizer: SanitizerConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Messages longer than this (in chars) are rejected before any backend call.
    pub max_message_chars: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_chars: 600,
        }
    }
}

/// Conversation memory: sliding window and idle reclamation.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of user/assistant pairs kept per session.
    pub history_pairs: usize,
    pub session_timeout_minutes: u64,
    /// Background sweep period. 0 disables the ticker (lazy checks still run).
    pub sweep_interval_seconds: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_pairs: 5,
            session_timeout_minutes: 60,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub ttl_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 100,
            ttl_minutes: 60,
        }
    }
}

/// Engagement flow thresholds and prompt texts.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct FlowConfig {
    pub data_capture_after_messages: u32,
    pub engagement_threshold: f64,
    pub max_capture_attempts: u32,
    pub max_consent_attempts: u32,
    pub welcome_message: String,
    pub capture_prompt: String,
    pub consent_prompt: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            data_capture_after_messages: 2,
            engagement_threshold: 0.6,
            max_capture_attempts: 3,
            max_consent_attempts: 3,
            welcome_message: "Hi! I'm a virtual assistant. I can tell you about professional \
                experience, technical skills and projects. What would you like to know?"
                .to_string(),
            capture_prompt: "By the way, would you like to leave your contact details so we \
                can follow up with you?"
                .to_string(),
            consent_prompt: "Before we continue, please confirm you agree to the processing of \
                your contact data for the purposes described in our privacy policy."
                .to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Token budget for the rendered context block.
    pub max_context_tokens: usize,
    /// JSON file of pre-embedded chunks produced by the ingestion pipeline.
    pub index_path: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            max_context_tokens: 3_000,
            index_path: "data/knowledge_index.json".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            model: "gemini-2.0-flash".to_string(),
            api_key: None,
            temperature: 0.7,
            top_p: 0.3,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8082".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
        }
    }
}

/// Per-call timeouts and concurrency permits for the three backends.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub call_timeout_seconds: u64,
    pub embedding_concurrency: usize,
    pub retrieval_concurrency: usize,
    pub generation_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            call_timeout_seconds: 30,
            embedding_concurrency: 16,
            retrieval_concurrency: 32,
            generation_concurrency: 8,
            acquire_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SanitizerConfig {
    pub max_response_chars: usize,
    pub url_placeholder: String,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_response_chars: 2_000,
            url_placeholder: "[URL]".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PromptsConfig {
    /// Persona/policy preamble placed at the top of every prompt.
    pub persona_preamble: String,
    /// Answer when the generation backend refuses on content-safety grounds.
    pub content_filtered_reply: String,
    /// Answer when any backend is down or times out.
    pub backend_unavailable_reply: String,
    /// Ordered question rewrites applied before generation.
    pub term_substitutions: Vec<TermSubstitution>,
    /// Answer-style hints appended after the context when the question
    /// mentions one of their keywords.
    pub style_hints: Vec<StyleHint>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TermSubstitution {
    pub from: String,
    pub to: String,
}

impl TermSubstitution {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StyleHint {
    /// Lowercase keywords matched as substrings of the lowercased question.
    pub keywords: Vec<String>,
    pub hint: String,
}

impl StyleHint {
    pub fn new(keywords: &[&str], hint: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            hint: hint.to_string(),
        }
    }
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            persona_preamble: r#"You are the professional digital twin of the portfolio owner.
Answer in first person, in the same language as the QUESTION.

Guidelines:
- Base the answer ONLY on the CONTEXT below; never invent companies, dates or technologies
- If the context is partial, use what is there and say what is missing
- Keep answers to 2-4 sentences unless a project needs detail
- Politely redirect non-professional topics back to professional experience
- If nothing relevant is in the context, suggest contacting the owner directly"#
                .to_string(),
            content_filtered_reply: "For this specific topic, please contact me directly. \
                Is there anything else I can help you with?"
                .to_string(),
            backend_unavailable_reply: "I can't look that up right now. For more detail it \
                would be best to contact me directly. Can I help with another question?"
                .to_string(),
            term_substitutions: vec![
                TermSubstitution::new("Machine Learning", "ML"),
                TermSubstitution::new("Neural Networks", "neural nets"),
                TermSubstitution::new("challenges", "complex aspects"),
                TermSubstitution::new("overcame", "resolved"),
                TermSubstitution::new("achievements", "results"),
                TermSubstitution::new("non-technical stakeholders", "business stakeholders"),
            ],
            style_hints: vec![
                StyleHint::new(
                    &["experience", "years"],
                    "Describe the experience as a trajectory: 'Over my career...', \
                     'I have had the chance to...'",
                ),
                StyleHint::new(
                    &["project", "challenge"],
                    "Structure the answer as project, main challenge, then the solution \
                     that was implemented.",
                ),
                StyleHint::new(
                    &["technology", "tools"],
                    "Group technologies by area: backend, frontend, DevOps.",
                ),
                StyleHint::new(
                    &["motivation", "philosophy"],
                    "A more personal tone fits here: 'What motivates me is...'",
                ),
            ],
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_engagement_policy() {
        let settings = Settings::default();
        assert_eq!(settings.memory.history_pairs, 5);
        assert_eq!(settings.memory.session_timeout_minutes, 60);
        assert_eq!(settings.retrieval.top_k, 3);
        assert_eq!(settings.flow.data_capture_after_messages, 2);
        assert!((settings.flow.engagement_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(settings.flow.max_capture_attempts, 3);
        assert_eq!(settings.sanitizer.max_response_chars, 2_000);
    }

    #[test]
    fn test_partial_source_fills_defaults() {
        let config = Config::builder()
            .set_override("cache.max_entries", 7i64)
            .unwrap()
            .set_override("flow.engagement_threshold", 0.0)
            .unwrap()
            .build()
            .unwrap();

        let settings: Settings = config.try_deserialize().unwrap();
        assert_eq!(settings.cache.max_entries, 7);
        assert!(settings.cache.enabled);
        assert_eq!(settings.flow.engagement_threshold, 0.0);
        assert_eq!(settings.flow.max_consent_attempts, 3);
        assert!(!settings.prompts.term_substitutions.is_empty());
    }
}
