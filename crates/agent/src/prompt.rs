//! System prompt assembly.
//!
//! Layout, top to bottom:
//! 1. a guard block: the strict context guard when the channel names a scope,
//!    else the knowledge-only guard when knowledge exists, else nothing
//! 2. the identity text: the channel's custom prompt, the configured global
//!    prompt, or a fallback identity line
//! 3. the tool catalog
//!
//! Pure: the caller resolves knowledge presence beforehand.

use streamweave_core::channel::{ChannelContext, PERSONALITY_PLACEHOLDER};

/// Used in place of an identity when a scoped channel has no custom prompt;
/// the context guard already says who the assistant is.
const SCOPED_DEFAULT_PROMPT: &str = "Answer the user's questions helpfully and informatively.";

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    assistant_name: String,
    global_prompt: Option<String>,
}

impl PromptAssembler {
    pub fn new(assistant_name: impl Into<String>) -> Self {
        Self {
            assistant_name: assistant_name.into(),
            global_prompt: None,
        }
    }

    /// System text used when a channel has none of its own.
    pub fn with_global_prompt(mut self, prompt: Option<String>) -> Self {
        self.global_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    /// Whether `build` will consult knowledge presence for this channel.
    pub fn needs_knowledge_check(channel: Option<&ChannelContext>) -> bool {
        channel.and_then(ChannelContext::scope).is_none()
    }

    /// Assemble the system prompt.
    ///
    /// `tools` is the `(name, description)` catalog, already ordered.
    pub fn build(
        &self,
        channel: Option<&ChannelContext>,
        has_knowledge: bool,
        tools: &[(String, String)],
    ) -> String {
        let scope = channel.and_then(ChannelContext::scope);
        let mut prompt = String::new();

        if let Some(scope) = scope {
            let description = channel.and_then(|c| c.context_description.as_deref());
            prompt.push_str(&context_guard(scope, description));
            prompt.push_str("\n\n");
        } else if has_knowledge {
            prompt.push_str(KNOWLEDGE_GUARD);
            prompt.push_str("\n\n");
        }

        prompt.push_str(&self.identity(channel, scope.is_some()));

        if !tools.is_empty() {
            prompt.push_str("\n\nYou have access to the following tools:\n");
            for (name, description) in tools {
                prompt.push_str(&format!("- {name}: {description}\n"));
            }
            prompt.push_str("\nUse the tools when they would help answer the user's question.");
        }

        prompt
    }

    fn identity(&self, channel: Option<&ChannelContext>, scoped: bool) -> String {
        let personality = channel.and_then(ChannelContext::personality);

        let mut text = match channel.and_then(ChannelContext::custom_prompt) {
            Some(custom) => custom.replace(
                PERSONALITY_PLACEHOLDER,
                personality.unwrap_or(&self.assistant_name),
            ),
            None if scoped => SCOPED_DEFAULT_PROMPT.to_string(),
            None => match &self.global_prompt {
                Some(global) => global.clone(),
                None => format!(
                    "You are {}, a helpful AI assistant. You are helpful, harmless, and honest.",
                    self.assistant_name
                ),
            },
        };

        // A scoped channel takes its identity from the guard
        if let (Some(label), false) = (personality, scoped) {
            text.push_str(&format!("\n\nYour name/personality is: {label}"));
        }
        text
    }
}

fn context_guard(scope: &str, description: Option<&str>) -> String {
    let mut guard = format!("## IDENTITY & BOUNDARIES\n\nYou are the assistant for: {scope}");
    if let Some(description) = description.map(str::trim).filter(|d| !d.is_empty()) {
        guard.push_str(&format!("\n\nDescription: {description}"));
    }
    guard.push_str(&format!(
        r#"

## STRICT RULES (MANDATORY):

0. **IMPORTANT: You MUST always respond to EVERY question. Never stay silent or leave a question unanswered.**

1. You may ONLY answer questions RELATED to {scope}.
2. Do NOT answer questions outside that scope, INCLUDING:
   - General questions (weather, news, world facts, gossip, etc.)
   - Requests for stories, poems, songs, code, or general creative work
   - Personal questions about yourself as an AI
   - Politics, religion, or other sensitive topics
   - Celebrities, entertainment, or pop culture
   - Requests to play games, solve riddles, or tell jokes
   - Anything NOT related to {scope}

3. If the user asks something out of scope:
   - Decline POLITELY and FIRMLY
   - Say that you are the assistant for {scope}
   - Offer help that IS relevant to {scope}
   - NEVER answer the question even if the user insists

4. If a question IS relevant to {scope} but the specific information is NOT in the knowledge base:
   - Say HONESTLY that the information is not available in the system yet
   - NEVER make information up
   - Offer to help with another related question

5. Never break character or admit that you are restricted. Stay professional.

## EXAMPLE RESPONSES:

**Relevant question, information missing:**
- "That information isn't available in our system yet. Is there anything else about {scope} I can help with?"

**Out-of-scope question:**
- "Sorry, I'm the assistant for {scope}. I can only help with questions about {scope}. Is there something about {scope} I can help you with?""#
    ));
    guard
}

const KNOWLEDGE_GUARD: &str = r#"## KNOWLEDGE BOUNDARIES

You have access to a knowledge base that has been provided for you.

## RULES:

0. **IMPORTANT: You MUST always respond to EVERY question. Never stay silent or leave a question unanswered.**

1. Prefer answering from the information in the knowledge base.
2. If a question is NOT covered by the knowledge base or the information is unavailable:
   - Say HONESTLY that the information is not available in the system
   - OFFER help with other questions
   - NEVER make information up
3. Stay friendly and helpful even when you cannot answer specifically.

## EXAMPLE RESPONSES:
- "Sorry, that information isn't in my database yet. Is there anything else I can help with?"
- "I don't have data on that yet. Feel free to ask something else or contact the relevant team.""#;
