//! Tool trait — named capabilities the model may invoke mid-generation.
//!
//! The registry resolves calls by name, filters arguments against each tool's
//! declared schema, and converts every outcome (success or failure) into a
//! tool-role message so a failing tool never aborts the generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

use crate::error::ToolError;
use crate::message::{Message, MessageToolCall};
use crate::provider::ToolDefinition;

/// A request to execute a tool, with arguments already parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: Value,
}

impl ToolCall {
    /// Parse a model-produced call. Unparseable argument strings become `{}`.
    pub fn from_message(call: &MessageToolCall) -> Self {
        let arguments = match serde_json::from_str::<Value>(&call.function.arguments) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::Object(Map::new()),
        };
        Self {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments,
        }
    }
}

/// Arguments validated against a tool's schema.
///
/// Only keys declared under `properties` survive, and every `required` key is
/// present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArguments(Map<String, Value>);

impl ToolArguments {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Filter raw arguments to the schema's declared properties.
    pub fn from_schema(schema: &Value, raw: &Value) -> Result<Self, ToolError> {
        let raw = raw.as_object().cloned().unwrap_or_default();
        let filtered = match schema.get("properties").and_then(Value::as_object) {
            Some(props) => raw.into_iter().filter(|(k, _)| props.contains_key(k)).collect(),
            None => Map::new(),
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            let missing: Vec<&str> = required
                .iter()
                .filter_map(Value::as_str)
                .filter(|key| !filtered.contains_key(*key))
                .collect();
            if !missing.is_empty() {
                return Err(ToolError::InvalidArguments(format!(
                    "missing required argument(s): {}",
                    missing.join(", ")
                )));
            }
        }

        Ok(Self(filtered))
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "get_current_datetime").
    fn name(&self) -> &str;

    /// A one-line description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Internal tools are callable but hidden from public listings.
    fn internal(&self) -> bool {
        false
    }

    /// Execute the tool with schema-filtered arguments.
    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Result of one tool invocation, success or failure.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub result: Result<Value, ToolError>,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Payload sent back to the model: the output, or `{"error": "..."}`.
    pub fn payload(&self) -> Value {
        match &self.result {
            Ok(value) => value.clone(),
            Err(e) => json!({ "error": e.to_string() }),
        }
    }

    pub fn into_message(self) -> Message {
        let content = self.payload().to_string();
        Message::tool_result(self.call_id, self.tool_name, content)
    }
}

/// A registry of available tools.
///
/// The orchestrator uses this to:
/// 1. Get tool definitions to send to the model
/// 2. Look up and execute tools when the model requests them
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn lookup(&self, name: &str) -> Result<&dyn Tool, ToolError> {
        self.tools
            .get(name)
            .map(|t| t.as_ref())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    fn sorted(&self) -> Vec<&dyn Tool> {
        let mut tools: Vec<&dyn Tool> = self.tools.values().map(|t| t.as_ref()).collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// All tool definitions, ordered by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.sorted().into_iter().map(|t| t.to_definition()).collect()
    }

    /// Definitions of non-internal tools, ordered by name.
    pub fn public_definitions(&self) -> Vec<ToolDefinition> {
        self.sorted()
            .into_iter()
            .filter(|t| !t.internal())
            .map(|t| t.to_definition())
            .collect()
    }

    /// `(name, description)` pairs for prompt assembly, ordered by name.
    pub fn catalog(&self) -> Vec<(String, String)> {
        self.sorted()
            .into_iter()
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect()
    }

    /// Execute a tool call. Never fails; errors land in the outcome.
    pub async fn invoke(&self, call: &ToolCall) -> ToolOutcome {
        let result = match self.lookup(&call.name) {
            Ok(tool) => match ToolArguments::from_schema(&tool.parameters_schema(), &call.arguments) {
                Ok(args) => tool.execute(args).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        ToolOutcome {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result,
        }
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
