use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::Deserialize;

use crate::dispatch::CommandVocabulary;
use crate::identity::ConversationLogEntry;

/// Built-in classifier prompt. `{speaker}`, `{commands}`, `{history}` and
/// `{input}` are substituted before the request is sent.
pub const DEFAULT_INTENT_PROMPT: &str = r#"
You are a robot assistant helping {speaker} that can understand both conversation and commands.
Below is a list of valid commands you can execute:

{commands}

Recent conversation with {speaker}, oldest first:
{history}

Your task is to determine if the user's input is a COMMAND or a CONVERSATION.

- If the input matches or resembles a command from the list above, respond with "COMMAND: <command>".
- If the input is normal conversation, respond with "CONVERSATION: <response>".

Example:
User: "Can you move forward?"
Output: COMMAND: move forward

User: "How's the weather?"
Output: CONVERSATION: <response>

User Input: "{input}"
"#;

/// Per-request ceiling for the chat endpoint.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Classification of one utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// A command phrase; not yet validated against the vocabulary.
    Command(String),
    /// Free-form reply to speak back.
    Conversation(String),
}

/// Who is speaking and what they said recently.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentContext {
    pub speaker: String,
    pub history: Vec<ConversationLogEntry>,
}

// The coordinator never parses natural language itself. Everything it knows
// about an utterance comes through this trait, which keeps the state machine
// testable against `MockIntentClassifier`.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        vocabulary: &CommandVocabulary,
        context: &IntentContext,
    ) -> Result<Intent>;
}

/// Parses the `COMMAND: ...` / `CONVERSATION: ...` reply protocol.
///
/// Anything that does not start with the command tag is conversation.
pub fn parse_reply(raw: &str) -> Intent {
    let raw = raw.trim();
    match raw.strip_prefix("COMMAND:") {
        Some(command) => Intent::Command(command.trim().to_string()),
        None => Intent::Conversation(raw.replace("CONVERSATION:", "").trim().to_string()),
    }
}

pub fn render_prompt(
    template: &str,
    text: &str,
    vocabulary: &CommandVocabulary,
    context: &IntentContext,
) -> String {
    let commands = vocabulary
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");
    let history = if context.history.is_empty() {
        "(none)".to_string()
    } else {
        context
            .history
            .iter()
            .map(|entry| entry.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };

    template
        .replace("{speaker}", &context.speaker)
        .replace("{commands}", &commands)
        .replace("{history}", &history)
        .replace("{input}", text)
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Classifier backed by an Ollama chat endpoint.
pub struct IntentClient {
    client: Client,
    base_url: String,
    model: String,
    prompt_template: String,
}

impl IntentClient {
    pub fn new(base_url: String, model: String) -> Result<Self> {
        Self::with_prompt(
            base_url,
            model,
            DEFAULT_INTENT_PROMPT.to_string(),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    pub fn with_prompt(
        base_url: String,
        model: String,
        prompt_template: String,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build chat HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            prompt_template,
        })
    }
}

#[async_trait]
impl IntentClassifier for IntentClient {
    async fn classify(
        &self,
        text: &str,
        vocabulary: &CommandVocabulary,
        context: &IntentContext,
    ) -> Result<Intent> {
        let prompt = render_prompt(&self.prompt_template, text, vocabulary, context);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "stream": false
        });

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Chat request failed")?
            .error_for_status()
            .context("Chat endpoint returned an error status")?
            .json::<ChatResponse>()
            .await
            .context("Failed to decode chat response")?;

        tracing::debug!("LLM response: {:?}", resp.message.content);
        Ok(parse_reply(&resp.message.content))
    }
}
