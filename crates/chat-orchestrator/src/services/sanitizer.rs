use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::SanitizerConfig;

static SCRIPT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script.*?</script>").expect("script pattern is valid")
});

static HTTP_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("link pattern is valid"));

/// Cleans generated text before it is cached or returned.
#[derive(Debug, Clone)]
pub struct OutputSanitizer {
    max_chars: usize,
    url_placeholder: String,
}

impl OutputSanitizer {
    pub fn new(config: &SanitizerConfig) -> Self {
        Self {
            max_chars: config.max_response_chars,
            url_placeholder: config.url_placeholder.clone(),
        }
    }

    /// Drops script blocks, masks links, caps the length (in chars) with a
    /// trailing ellipsis, then trims.
    pub fn sanitize(&self, text: &str) -> String {
        let without_scripts = SCRIPT_BLOCK.replace_all(text, "");
        let masked = HTTP_LINK.replace_all(&without_scripts, self.url_placeholder.as_str());

        let capped = if masked.chars().count() > self.max_chars {
            let mut head: String = masked.chars().take(self.max_chars).collect();
            head.push_str("...");
            head
        } else {
            masked.into_owned()
        };

        capped.trim().to_string()
    }
}
