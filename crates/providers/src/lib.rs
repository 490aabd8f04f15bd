//! The language-model worker abstraction.
//!
//! The core only needs one operation from a provider: a chat completion
//! with usage metrics. Wire protocols, streaming, and model routing live
//! outside the core; adapters implement [`ChatProvider`] and are plugged
//! in at bootstrap.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use coda_domain::tool::{Message, ToolCall, ToolDefinition};
use coda_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// The conversation messages to send.
    pub messages: Vec<Message>,
    /// Tool definitions the model may invoke.
    pub tools: Vec<ToolDefinition>,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
}

/// Token usage for one completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A provider-agnostic chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Textual content of the response.
    pub content: String,
    /// Tool calls emitted by the model. Empty means the text is final.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    /// The model that actually produced the response.
    pub model: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single operation the core requires from a language-model worker.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a chat completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Placeholder wired in when no real adapter is configured. Every call
/// fails with a provider error, which subagent runs surface as a normal
/// run failure.
pub struct UnconfiguredProvider;

#[async_trait]
impl ChatProvider for UnconfiguredProvider {
    async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
        Err(Error::Provider {
            provider: "unconfigured".into(),
            message: "no language-model provider configured".into(),
        })
    }

    fn provider_id(&self) -> &str {
        "unconfigured"
    }
}

/// Replays a fixed script of responses and records every request it saw.
/// The workhorse of subagent-loop tests.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ChatResponse>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text-only (final) response.
    pub fn push_text(&self, text: &str, input_tokens: u64, output_tokens: u64) {
        self.script.lock().push_back(Ok(ChatResponse {
            content: text.to_string(),
            tool_calls: Vec::new(),
            usage: Usage {
                input_tokens,
                output_tokens,
            },
            model: "scripted".into(),
        }));
    }

    /// Queue a response requesting the given tool calls.
    pub fn push_tool_calls(&self, calls: Vec<ToolCall>, input_tokens: u64, output_tokens: u64) {
        self.script.lock().push_back(Ok(ChatResponse {
            content: String::new(),
            tool_calls: calls,
            usage: Usage {
                input_tokens,
                output_tokens,
            },
            model: "scripted".into(),
        }));
    }

    /// Queue a provider failure.
    pub fn push_error(&self, message: &str) {
        self.script.lock().push_back(Err(Error::Provider {
            provider: "scripted".into(),
            message: message.to_string(),
        }));
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req);
        self.script.lock().pop_front().unwrap_or_else(|| {
            Err(Error::Provider {
                provider: "scripted".into(),
                message: "script exhausted".into(),
            })
        })
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
