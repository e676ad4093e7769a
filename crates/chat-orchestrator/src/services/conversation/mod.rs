//! Per-session conversation state: bounded memory, engagement flow and
//! prompt assembly.

pub mod context_builder;
pub mod flow;
pub mod memory;
pub mod types;

pub use context_builder::{BuiltPrompt, PromptBuilder};
pub use flow::{FlowData, FlowDecision};
pub use memory::{ConversationMemory, SessionOrigin, TurnStart};
pub use types::{SessionSnapshot, SessionState};
