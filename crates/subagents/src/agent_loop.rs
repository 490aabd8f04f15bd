//! The bounded tool-agent loop: ask the model, execute requested tools,
//! repeat until a final answer, a limit, or cancellation.

use std::sync::Arc;

use coda_domain::cancel::CancelToken;
use coda_domain::sanitize::{sanitize, ContentKind};
use coda_domain::tool::{ContentPart, Message, MessageContent, Role};
use coda_providers::{ChatProvider, ChatRequest};
use coda_skills::{SkillRegistry, ToolFilter};

use crate::run::TranscriptEntry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parameters + outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LoopParams {
    pub task: String,
    pub system_prompt: Option<String>,
    pub registry: Arc<SkillRegistry>,
    pub provider: Arc<dyn ChatProvider>,
    pub filter: ToolFilter,
    pub model: Option<String>,
    pub max_tool_calls: u32,
    pub token_budget: u64,
    pub cancel: CancelToken,
}

/// How the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEnd {
    /// The model answered with text only.
    Completed(String),
    Cancelled,
    TokenBudgetExhausted,
    ToolCallLimit,
    ProviderFailed(String),
}

#[derive(Debug)]
pub struct LoopOutcome {
    pub end: LoopEnd,
    pub transcript: Vec<TranscriptEntry>,
    pub tool_call_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LoopOutcome {
    fn finish(self, end: LoopEnd) -> Self {
        Self { end, ..self }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_tool_loop(params: LoopParams) -> LoopOutcome {
    let tools = params.registry.list_tools(&params.filter);

    let mut messages: Vec<Message> = Vec::new();
    if let Some(system) = &params.system_prompt {
        messages.push(Message::system(system.clone()));
    }
    messages.push(Message::user(params.task.clone()));

    let mut outcome = LoopOutcome {
        end: LoopEnd::Completed(String::new()),
        transcript: vec![TranscriptEntry::new("user", params.task.clone(), None)],
        tool_call_count: 0,
        input_tokens: 0,
        output_tokens: 0,
    };

    loop {
        // Cancellation is observed before every provider call.
        if params.cancel.is_cancelled() {
            return outcome.finish(LoopEnd::Cancelled);
        }

        let response = match params
            .provider
            .chat(ChatRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                model: params.model.clone(),
                max_tokens: None,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => return outcome.finish(LoopEnd::ProviderFailed(e.to_string())),
        };

        outcome.input_tokens += response.usage.input_tokens;
        outcome.output_tokens += response.usage.output_tokens;
        if outcome.input_tokens + outcome.output_tokens > params.token_budget {
            return outcome.finish(LoopEnd::TokenBudgetExhausted);
        }

        if response.tool_calls.is_empty() {
            // Text only: this is the final result.
            outcome
                .transcript
                .push(TranscriptEntry::new("assistant", response.content.clone(), None));
            return outcome.finish(LoopEnd::Completed(response.content));
        }

        // Record the assistant turn with its tool-use parts.
        let mut parts = Vec::new();
        if !response.content.is_empty() {
            parts.push(ContentPart::Text {
                text: response.content.clone(),
            });
            outcome
                .transcript
                .push(TranscriptEntry::new("assistant", response.content.clone(), None));
        }
        for call in &response.tool_calls {
            parts.push(ContentPart::ToolUse {
                id: call.call_id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
            outcome.transcript.push(TranscriptEntry::new(
                "assistant",
                call.arguments.to_string(),
                Some(call.tool_name.clone()),
            ));
        }
        messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        });

        for call in &response.tool_calls {
            if outcome.tool_call_count >= params.max_tool_calls {
                return outcome.finish(LoopEnd::ToolCallLimit);
            }
            if params.cancel.is_cancelled() {
                return outcome.finish(LoopEnd::Cancelled);
            }

            let output = params
                .registry
                .execute_tool(&call.tool_name, &call.arguments)
                .await;
            outcome.tool_call_count += 1;

            messages.push(Message::tool_result(&call.call_id, &output.content));
            outcome.transcript.push(TranscriptEntry::new(
                "tool",
                output.content,
                Some(call.tool_name.clone()),
            ));
        }
    }
}

/// Wrap a finished run's result for inclusion in a parent context.
pub fn wrap_result(result: &str) -> String {
    sanitize(ContentKind::SubagentResult, result)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
