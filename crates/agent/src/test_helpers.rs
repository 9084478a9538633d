//! Shared test helpers for orchestrator tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Mutex;
use streamweave_core::error::{ProviderError, ToolError};
use streamweave_core::message::{Message, MessageToolCall};
use streamweave_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta, Usage,
};
use streamweave_core::tool::{Tool, ToolArguments};
use tokio::sync::mpsc;

/// One scripted model reply.
pub enum Reply {
    Text(String),
    Tools { content: String, calls: Vec<MessageToolCall> },
    Fail(ProviderError),
    /// Streams `content`, then fails; `complete` just fails.
    BreakAfter { content: String, error: ProviderError },
}

/// A provider that plays back scripted replies in order and records every
/// request it receives.
///
/// Streaming splits content into three-character deltas and each tool call
/// into two fragments, so accumulation is exercised.
pub struct ScriptedProvider {
    name: String,
    replies: Mutex<Vec<Reply>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self::named("mock", replies)
    }

    pub fn named(name: &str, mut replies: Vec<Reply>) -> Self {
        replies.reverse();
        Self {
            name: name.into(),
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self, request: ProviderRequest) -> Result<Reply, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))
    }

    fn next(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_reply(request)? {
            Reply::Text(text) => Ok(response(Message::assistant(text))),
            Reply::Tools { content, calls } => Ok(response(Message::assistant_with_tools(content, calls))),
            Reply::Fail(e) | Reply::BreakAfter { error: e, .. } => Err(e),
        }
    }
}

fn response(message: Message) -> ProviderResponse {
    ProviderResponse {
        message,
        usage: Some(usage()),
        model: "mock-model".into(),
        finish_reason: Some("stop".into()),
    }
}

pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.next(request)
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let response = match self.next_reply(request)? {
            Reply::Text(text) => response(Message::assistant(text)),
            Reply::Tools { content, calls } => response(Message::assistant_with_tools(content, calls)),
            Reply::Fail(e) => return Err(e),
            Reply::BreakAfter { content, error } => {
                let (tx, rx) = mpsc::channel(2);
                let _ = tx.send(Ok(StreamChunk { content: Some(content), ..StreamChunk::default() })).await;
                let _ = tx.send(Err(error)).await;
                return Ok(rx);
            }
        };
        let mut chunks = Vec::new();

        let chars: Vec<char> = response.message.content.chars().collect();
        for piece in chars.chunks(3) {
            chunks.push(StreamChunk {
                content: Some(piece.iter().collect()),
                ..StreamChunk::default()
            });
        }
        for (index, call) in response.message.tool_calls.iter().enumerate() {
            let (head, tail) = call.function.arguments.split_at(call.function.arguments.len() / 2);
            chunks.push(StreamChunk {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: Some(call.id.clone()),
                    name: Some(call.function.name.clone()),
                    arguments: Some(head.to_string()),
                }],
                ..StreamChunk::default()
            });
            chunks.push(StreamChunk {
                tool_calls: vec![ToolCallDelta {
                    index,
                    arguments: Some(tail.to_string()),
                    ..ToolCallDelta::default()
                }],
                ..StreamChunk::default()
            });
        }
        chunks.push(StreamChunk {
            done: true,
            usage: response.usage,
            ..StreamChunk::default()
        });

        let (tx, rx) = mpsc::channel(chunks.len());
        for chunk in chunks {
            let _ = tx.send(Ok(chunk)).await;
        }
        Ok(rx)
    }
}

/// Echoes its `text` argument back as `{"echo": text}`.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        Ok(json!({ "echo": arguments.str("text").unwrap_or_default() }))
    }
}

pub fn tool_call(id: &str, name: &str, args: Value) -> MessageToolCall {
    MessageToolCall::new(id, name, args.to_string())
}
