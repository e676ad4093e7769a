pub mod conversation;
pub mod embedding_service;
pub mod llm_service;
pub mod orchestrator;
pub mod providers;
pub mod query_analyzer;
pub mod response_cache;
pub mod sanitizer;
pub mod vector_index;

pub use embedding_service::EmbeddingService;
pub use llm_service::LlmService;
pub use orchestrator::{Backends, ResponseOrchestrator, TurnReply};
pub use vector_index::VectorIndex;
