//! Channel context — per-deployment assistant configuration.
//!
//! A channel carries the system-prompt template, personality label, an optional
//! topic scope that activates the strict context guard, and provider selection.
//! It is read-only to the generation pipeline.

use serde::{Deserialize, Serialize};

/// Placeholder substituted with the personality label in a system prompt.
pub const PERSONALITY_PLACEHOLDER: &str = "{personality_name}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelContext {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Custom system text; may contain `{personality_name}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality_name: Option<String>,

    /// Topic scope; when set the assistant refuses anything outside it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_description: Option<String>,

    /// Named provider to route this channel's generations to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model override used when the request asks for "default"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChannelContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The scope string, if non-blank.
    pub fn scope(&self) -> Option<&str> {
        self.context.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn personality(&self) -> Option<&str> {
        self.personality_name.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn custom_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_fields_read_as_unset() {
        let channel = ChannelContext {
            context: Some("   ".into()),
            personality_name: Some("".into()),
            system_prompt: Some("\n".into()),
            ..ChannelContext::new("c1")
        };
        assert!(channel.scope().is_none());
        assert!(channel.personality().is_none());
        assert!(channel.custom_prompt().is_none());
    }

    #[test]
    fn deserializes_with_defaults() {
        let channel: ChannelContext =
            serde_json::from_str(r#"{"id":"support","context":"billing"}"#).unwrap();
        assert_eq!(channel.scope(), Some("billing"));
        assert!(channel.provider.is_none());
    }
}
