use tracing::{debug, info};

use crate::config::{PromptsConfig, RetrievalConfig, StyleHint, TermSubstitution};
use crate::models::chat::UserType;
use crate::services::providers::RetrievedChunk;
use crate::utils::token_estimator::{estimate_tokens, would_exceed_limit};

/// A rendered prompt plus what was done to the question on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltPrompt {
    pub text: String,
    /// Question after term substitution.
    pub question: String,
    /// Substitutions actually applied, in application order. Kept for
    /// logging; the generated answer is never rewritten with them.
    pub substitutions: Vec<TermSubstitution>,
    pub hints_applied: usize,
    pub chunks_used: usize,
    pub context_tokens: usize,
}

/// Renders the retrieval-augmented prompt. No I/O.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    preamble: String,
    substitutions: Vec<TermSubstitution>,
    style_hints: Vec<StyleHint>,
    top_k: usize,
    max_context_tokens: usize,
}

impl PromptBuilder {
    pub fn new(prompts: &PromptsConfig, retrieval: &RetrievalConfig) -> Self {
        Self {
            preamble: prompts.persona_preamble.clone(),
            substitutions: prompts.term_substitutions.clone(),
            style_hints: prompts.style_hints.clone(),
            top_k: retrieval.top_k,
            max_context_tokens: retrieval.max_context_tokens,
        }
    }

    /// Applies the ordered substitution table (exact, case-sensitive matches).
    pub fn substitute_terms(&self, question: &str) -> (String, Vec<TermSubstitution>) {
        let mut rewritten = question.to_string();
        let mut applied = Vec::new();

        for sub in &self.substitutions {
            if sub.from.is_empty() || !rewritten.contains(&sub.from) {
                continue;
            }
            rewritten = rewritten.replace(&sub.from, &sub.to);
            info!("Term substitution applied: '{}' -> '{}'", sub.from, sub.to);
            applied.push(sub.clone());
        }

        (rewritten, applied)
    }

    /// Hints whose keywords occur in the question, in table order.
    fn matching_hints(&self, question: &str) -> Vec<&str> {
        let lowered = question.to_lowercase();
        self.style_hints
            .iter()
            .filter(|h| h.keywords.iter().any(|k| !k.is_empty() && lowered.contains(k.as_str())))
            .map(|h| h.hint.as_str())
            .collect()
    }

    pub fn build(
        &self,
        question: &str,
        chunks: &[RetrievedChunk],
        history: &str,
        user_type: UserType,
    ) -> BuiltPrompt {
        let (rewritten, substitutions) = self.substitute_terms(question);
        let (context, chunks_used, context_tokens) = self.render_context(chunks);
        let hints = self.matching_hints(question);

        let mut text = String::new();
        if !history.trim().is_empty() {
            text.push_str("Conversation history:\n");
            text.push_str(history);
            text.push_str("\n\n");
        }

        text.push_str(&self.preamble);
        text.push('\n');
        text.push_str(user_type.prompt_hint());
        text.push_str("\n\nCONTEXT:\n");
        text.push_str(&context);
        for hint in &hints {
            text.push_str("\n\nHINT: ");
            text.push_str(hint);
        }
        text.push_str("\n\nQUESTION: ");
        text.push_str(&rewritten);
        text.push_str("\n\nANSWER:");

        debug!(
            "Built prompt: {} chunks ({} tokens), history {} chars, {} substitutions, {} hints",
            chunks_used,
            context_tokens,
            history.len(),
            substitutions.len(),
            hints.len()
        );

        BuiltPrompt {
            text,
            question: rewritten,
            hints_applied: hints.len(),
            substitutions,
            chunks_used,
            context_tokens,
        }
    }

    /// Top-K chunks in rank order until the token budget would be exceeded.
    fn render_context(&self, chunks: &[RetrievedChunk]) -> (String, usize, usize) {
        let mut parts: Vec<&str> = Vec::new();
        let mut tokens = 0;

        for chunk in chunks.iter().take(self.top_k) {
            let text = chunk.text.trim();
            if text.is_empty() {
                continue;
            }
            if would_exceed_limit(tokens, text, self.max_context_tokens) {
                debug!("Context budget of {} tokens reached", self.max_context_tokens);
                break;
            }
            tokens += estimate_tokens(text);
            parts.push(text);
        }

        if parts.is_empty() {
            return ("No relevant context was found.".to_string(), 0, 0);
        }

        (parts.join("\n\n"), parts.len(), tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(&PromptsConfig::default(), &RetrievalConfig::default())
    }

    fn chunk(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            text: text.to_string(),
            metadata: HashMap::new(),
            score: 0.9,
        }
    }

    #[test]
    fn test_layout() {
        let prompt = builder().build(
            "What projects did you lead?",
            &[chunk("Led the payments rewrite."), chunk("Built a RAG assistant.")],
            "Human: hi\nAssistant: hello\n\n",
            UserType::Recruiter,
        );

        assert!(prompt.text.starts_with("Conversation history:\nHuman: hi\nAssistant: hello"));
        assert!(prompt.text.contains(UserType::Recruiter.prompt_hint()));
        assert!(prompt
            .text
            .contains("CONTEXT:\nLed the payments rewrite.\n\nBuilt a RAG assistant."));
        assert!(prompt
            .text
            .ends_with("QUESTION: What projects did you lead?\n\nANSWER:"));
        assert_eq!(prompt.chunks_used, 2);
    }

    #[test]
    fn test_no_history_no_prefix() {
        let prompt = builder().build("q", &[], "", UserType::Other);
        assert!(!prompt.text.contains("Conversation history"));
        assert!(prompt.text.contains("No relevant context was found."));
        assert_eq!(prompt.chunks_used, 0);
    }

    #[test]
    fn test_substitutions_are_recorded_in_order() {
        let question = "What challenges in Machine Learning you overcame?";
        let prompt = builder().build(question, &[], "", UserType::Other);

        assert_eq!(
            prompt.question,
            "What complex aspects in ML you resolved?"
        );
        assert_eq!(
            prompt.substitutions,
            vec![
                TermSubstitution::new("Machine Learning", "ML"),
                TermSubstitution::new("challenges", "complex aspects"),
                TermSubstitution::new("overcame", "resolved"),
            ]
        );
        assert!(prompt.text.contains("QUESTION: What complex aspects in ML you resolved?"));
    }

    #[test]
    fn test_style_hints_follow_context() {
        let prompt = builder().build(
            "Which TOOLS did you use on that project?",
            &[chunk("Kafka and Postgres.")],
            "",
            UserType::Other,
        );

        assert_eq!(prompt.hints_applied, 2);
        let context_at = prompt.text.find("Kafka and Postgres.").unwrap();
        let hint_at = prompt.text.find("\n\nHINT: Structure the answer").unwrap();
        let question_at = prompt.text.find("QUESTION:").unwrap();
        assert!(context_at < hint_at && hint_at < question_at);
        assert!(prompt.text.contains("HINT: Group technologies by area"));
    }

    #[test]
    fn test_no_hint_without_keyword() {
        let prompt = builder().build("Where are you based?", &[], "", UserType::Other);
        assert_eq!(prompt.hints_applied, 0);
        assert!(!prompt.text.contains("HINT:"));
    }

    #[test]
    fn test_context_respects_top_k_and_budget() {
        let retrieval = RetrievalConfig {
            top_k: 2,
            max_context_tokens: 20,
            ..RetrievalConfig::default()
        };
        let builder = PromptBuilder::new(&PromptsConfig::default(), &retrieval);

        // 5 words -> 12 tokens each; only one fits in 20.
        let chunks = [
            chunk("one two three four five"),
            chunk("six seven eight nine ten"),
            chunk("never reached by top k"),
        ];
        let prompt = builder.build("q", &chunks, "", UserType::Other);
        assert_eq!(prompt.chunks_used, 1);
        assert_eq!(prompt.context_tokens, 12);
        assert!(!prompt.text.contains("six"));
    }
}
