//! Generation request and response envelopes.
//!
//! The request body and both response shapes follow the OpenAI chat
//! completion wire format so existing client SDKs keep working.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::provider::Usage;

/// Model name meaning "use the configured default".
pub const DEFAULT_MODEL_ALIAS: &str = "default";

/// A chat completion request as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default = "default_model")]
    pub model: String,

    pub messages: Vec<Message>,

    /// Unset means the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default = "default_tool_choice")]
    pub tool_choice: Value,

    /// Caller-chosen generation id; reusing it resumes instead of regenerating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

fn default_model() -> String {
    DEFAULT_MODEL_ALIAS.into()
}

fn default_tool_choice() -> Value {
    Value::String("auto".into())
}

fn check_range(name: &str, value: Option<f32>, min: f32, max: f32) -> Result<()> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(Error::Validation(format!(
            "{name} must be between {min} and {max}, got {v}"
        ))),
        _ => Ok(()),
    }
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: default_model(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            stream: false,
            tool_choice: default_tool_choice(),
            stream_id: None,
            session_id: None,
            channel_id: None,
        }
    }

    /// Reject empty message lists and out-of-range sampling parameters.
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(Error::Validation("messages must contain at least one message".into()));
        }
        check_range("temperature", self.temperature, 0.0, 2.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        if let Some(max) = self.max_tokens {
            if !(1..=128_000).contains(&max) {
                return Err(Error::Validation(format!(
                    "max_tokens must be between 1 and 128000, got {max}"
                )));
            }
        }
        if self.model.trim().is_empty() {
            return Err(Error::Validation("model must not be empty".into()));
        }
        Ok(())
    }

    pub fn uses_default_model(&self) -> bool {
        self.model == DEFAULT_MODEL_ALIAS
    }

    /// Content of the last user-role message, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Non-streaming response (`chat.completion`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

impl ChatCompletion {
    pub fn new(id: impl Into<String>, model: impl Into<String>, content: impl Into<String>, usage: Option<Usage>) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".into(),
            created: Utc::now().timestamp(),
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".into(),
            }],
            usage,
        }
    }

    pub fn content(&self) -> &str {
        self.choices.first().map(|c| c.message.content.as_str()).unwrap_or_default()
    }
}

/// Streaming delta envelope (`chat.completion.chunk`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    /// A content delta.
    pub fn delta(id: impl Into<String>, model: impl Into<String>, content: impl Into<String>) -> Self {
        Self::build(id.into(), model.into(), Some(content.into()), None)
    }

    /// The closing envelope with `finish_reason: "stop"`.
    pub fn finish(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self::build(id.into(), model.into(), None, Some("stop".into()))
    }

    fn build(id: String, model: String, content: Option<String>, finish_reason: Option<String>) -> Self {
        Self {
            id,
            object: "chat.completion.chunk".into(),
            created: Utc::now().timestamp(),
            model,
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { content },
                finish_reason,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> GenerationRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn request_defaults() {
        let req = parse(r#"{"messages":[{"role":"user","content":"hi"}]}"#);
        assert_eq!(req.model, "default");
        assert!(req.uses_default_model());
        assert!(req.temperature.is_none());
        assert_eq!(req.tool_choice, serde_json::json!("auto"));
        assert!(!req.stream);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn empty_messages_rejected() {
        let err = parse(r#"{"messages":[]}"#).validate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn out_of_range_parameters_rejected() {
        let base = r#"{"role":"user","content":"hi"}"#;
        for extra in [
            r#""temperature":2.5"#,
            r#""top_p":1.5"#,
            r#""presence_penalty":-3.0"#,
            r#""frequency_penalty":2.1"#,
            r#""max_tokens":0"#,
            r#""max_tokens":200000"#,
        ] {
            let req = parse(&format!(r#"{{"messages":[{base}],{extra}}}"#));
            assert!(req.validate().is_err(), "{extra} should be rejected");
        }
    }

    #[test]
    fn last_user_message_skips_other_roles() {
        let req = GenerationRequest::new(vec![
            Message::user("first"),
            Message::user("second"),
            Message::assistant("reply"),
        ]);
        assert_eq!(req.last_user_message(), Some("second"));
    }

    #[test]
    fn chunk_envelope_shape() {
        let json = serde_json::to_value(ChatCompletionChunk::delta("abc", "m", "Hel")).unwrap();
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["content"], "Hel");
        assert!(json["choices"][0]["finish_reason"].is_null());

        let json = serde_json::to_value(ChatCompletionChunk::finish("abc", "m")).unwrap();
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["choices"][0]["delta"].get("content").is_none());
    }

    #[test]
    fn completion_envelope_shape() {
        let completion = ChatCompletion::new("id1", "m", "Hello", None);
        assert_eq!(completion.content(), "Hello");
        let json = serde_json::to_value(&completion).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    }
}
