//! Generation and compression parameters.

use serde::{Deserialize, Serialize};

/// Generation parameters sent with every request.
///
/// A session may carry its own copy which then takes precedence over the
/// global one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default = "ModelConfig::default_temperature")]
    pub temperature: f32,
    #[serde(default = "ModelConfig::default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "ModelConfig::default_top_p")]
    pub top_p: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: Self::default_temperature(),
            max_tokens: Self::default_max_tokens(),
            presence_penalty: 0.0,
            top_p: Self::default_top_p(),
        }
    }
}

impl ModelConfig {
    const fn default_temperature() -> f32 {
        0.7
    }

    const fn default_max_tokens() -> usize {
        2000
    }

    const fn default_top_p() -> f32 {
        1.0
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Thresholds that decide when older turns get folded into the memory prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Finalized messages allowed in the uncompressed tail
    #[serde(default = "CompressionConfig::default_max_tail_messages")]
    pub max_tail_messages: usize,
    /// Estimated tokens allowed in the uncompressed tail
    #[serde(default = "CompressionConfig::default_max_tail_tokens")]
    pub max_tail_tokens: usize,
    /// Most recent messages that always stay verbatim
    #[serde(default = "CompressionConfig::default_keep_recent_messages")]
    pub keep_recent_messages: usize,
    /// Word budget given to the summarizer
    #[serde(default = "CompressionConfig::default_summary_max_words")]
    pub summary_max_words: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_tail_messages: Self::default_max_tail_messages(),
            max_tail_tokens: Self::default_max_tail_tokens(),
            keep_recent_messages: Self::default_keep_recent_messages(),
            summary_max_words: Self::default_summary_max_words(),
        }
    }
}

impl CompressionConfig {
    const fn default_max_tail_messages() -> usize {
        20
    }

    const fn default_max_tail_tokens() -> usize {
        1000
    }

    /// One exchange stays verbatim
    const fn default_keep_recent_messages() -> usize {
        2
    }

    const fn default_summary_max_words() -> usize {
        200
    }

    #[must_use]
    pub const fn with_max_tail_messages(mut self, max: usize) -> Self {
        self.max_tail_messages = max;
        self
    }

    #[must_use]
    pub const fn with_max_tail_tokens(mut self, max: usize) -> Self {
        self.max_tail_tokens = max;
        self
    }

    #[must_use]
    pub const fn with_keep_recent_messages(mut self, keep: usize) -> Self {
        self.keep_recent_messages = keep;
        self
    }
}
