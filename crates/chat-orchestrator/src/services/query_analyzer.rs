//! Message analytics.
//! Detects mentioned technologies and the broad intent of a user message,
//! attached to activity events for the persistence collaborator.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageAnalysis {
    pub technologies: Vec<String>,
    pub intents: Vec<String>,
}

fn category(name: &'static str, words: &[&str]) -> (&'static str, Regex) {
    let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
    (name, Regex::new(&pattern).expect("category pattern is valid"))
}

static TECHNOLOGY_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        category("python", &["python", "django", "flask", "fastapi"]),
        category(
            "javascript",
            &["javascript", r"node\.?js", "react", "vue", "angular"],
        ),
        category("java", &["java", "spring", "maven", "gradle"]),
        category("rust", &["rust", "tokio", "cargo"]),
        category("cloud", &["gcp", "aws", "azure", "cloud", "kubernetes"]),
        category(
            "ai",
            &["ai", "machine learning", "deep learning", "llm", "rag"],
        ),
        category("database", &["postgresql", "mysql", "mongodb", "redis"]),
        category("devops", &["docker", "ci/cd", "jenkins", "terraform"]),
    ]
});

static INTENT_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        category(
            "experience",
            &["experience", "years", "worked", "company", "project", "projects"],
        ),
        category(
            "skills",
            &["skills", "knowledge", "technologies", "stack", "programming"],
        ),
        category(
            "education",
            &["studies", "university", "degree", "education", "certification"],
        ),
        category(
            "availability",
            &["availability", "available", "hire", "hiring", "opportunity", "salary"],
        ),
    ]
});

pub struct QueryAnalyzer;

impl QueryAnalyzer {
    /// One entry per matching category, in table order.
    pub fn analyze(message: &str) -> MessageAnalysis {
        let analysis = MessageAnalysis {
            technologies: Self::matching(&TECHNOLOGY_PATTERNS, message),
            intents: Self::matching(&INTENT_PATTERNS, message),
        };

        if !analysis.technologies.is_empty() || !analysis.intents.is_empty() {
            debug!(
                "Detected technologies={:?} intents={:?}",
                analysis.technologies, analysis.intents
            );
        }

        analysis
    }

    fn matching(patterns: &[(&'static str, Regex)], message: &str) -> Vec<String> {
        patterns
            .iter()
            .filter(|(_, regex)| regex.is_match(message))
            .map(|(name, _)| name.to_string())
            .collect()
    }
}
