use std::time::Duration;

use crate::sampling::SamplingSpec;

pub(crate) const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";
pub(crate) const DEFAULT_MODEL: &str = "qwen2.5-vl-32b-instruct";
pub(crate) const DEFAULT_SYSTEM_PROMPT: &str =
    "You caption videos for dataset creation. Respond with ONLY the caption.";
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Where and how to reach the chat-completions endpoint.
#[derive(Debug, Clone)]
pub(crate) struct EndpointConfig {
    pub(crate) base_url: String,
    pub(crate) default_model: String,
    pub(crate) timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            default_model: DEFAULT_MODEL.to_owned(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl EndpointConfig {
    pub(crate) fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// The requested model, or the configured default when none was given.
    pub(crate) fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        let requested = requested.trim();
        if requested.is_empty() {
            &self.default_model
        } else {
            requested
        }
    }
}

/// Per-request captioning parameters shared by single-file and batch mode.
#[derive(Debug, Clone)]
pub(crate) struct CaptionSettings {
    pub(crate) system_prompt: String,
    /// Empty means "use the endpoint's default model".
    pub(crate) model: String,
    pub(crate) prefill: String,
    pub(crate) sampling: SamplingSpec,
}
