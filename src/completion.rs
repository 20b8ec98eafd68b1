//! Retrieval-augmented chat completion.
//!
//! Builds the message list for `POST /chat/completions`: a system message
//! carrying the configured instructions and the retrieved document excerpts,
//! then the most recent conversation turns, then the new question.

use anyhow::Result;
use serde::Serialize;

use crate::config::ChatConfig;
use crate::credential::ValidCredential;
use crate::index::ScoredChunk;
use crate::models::{Message, Role};
use crate::openai::OpenAIClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: &'static str,
    pub content: String,
}

/// Assemble the prompt. `history` is oldest-first; only the last
/// `config.history_turns` user/assistant pairs are kept.
pub fn build_messages(
    config: &ChatConfig,
    context: &[ScoredChunk<'_>],
    history: &[Message],
    question: &str,
) -> Vec<PromptMessage> {
    let mut system = config.system_prompt.trim().to_string();
    if !context.is_empty() {
        system.push_str("\n\nDocument excerpts:\n");
        for hit in context {
            system.push_str(&format!("\n[{}]\n{}\n", hit.chunk.index + 1, hit.chunk.text));
        }
    }

    let keep = config.history_turns * 2;
    let start = history.len().saturating_sub(keep);

    let mut messages = Vec::with_capacity(2 + history.len() - start);
    messages.push(PromptMessage {
        role: "system",
        content: system,
    });
    for m in &history[start..] {
        messages.push(PromptMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        });
    }
    messages.push(PromptMessage {
        role: "user",
        content: question.to_string(),
    });
    messages
}

/// Call the chat-completion endpoint and return the assistant text.
pub async fn complete(
    client: &OpenAIClient,
    credential: &ValidCredential,
    config: &ChatConfig,
    messages: &[PromptMessage],
) -> Result<String> {
    let body = serde_json::json!({
        "model": config.model,
        "temperature": config.temperature,
        "messages": messages,
    });

    let json = client.post_json(credential, "chat/completions", &body).await?;
    parse_completion_response(&json)
}

fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message.content"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn chunk(index: usize, text: &str) -> Chunk {
        Chunk {
            index,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_system_message_carries_excerpts() {
        let c = chunk(2, "Cats sleep a lot.");
        let hits = vec![ScoredChunk { chunk: &c, score: 0.9 }];
        let msgs = build_messages(&ChatConfig::default(), &hits, &[], "What do cats do?");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "system");
        assert!(msgs[0].content.contains("[3]\nCats sleep a lot."));
        assert_eq!(msgs[1].role, "user");
        assert_eq!(msgs[1].content, "What do cats do?");
    }

    #[test]
    fn test_history_is_truncated_to_recent_turns() {
        let config = ChatConfig {
            history_turns: 1,
            ..ChatConfig::default()
        };
        let history = vec![
            Message::user("q1"),
            Message::assistant("a1"),
            Message::user("q2"),
            Message::assistant("a2"),
        ];
        let msgs = build_messages(&config, &[], &history, "q3");
        let contents: Vec<&str> = msgs.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q2", "a2", "q3"]);
        assert_eq!(msgs[2].role, "assistant");
    }

    #[test]
    fn test_parses_first_choice() {
        let json = serde_json::json!({
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": " Hello \n" } }]
        });
        assert_eq!(parse_completion_response(&json).unwrap(), "Hello");
    }

    #[test]
    fn test_rejects_empty_choices() {
        let json = serde_json::json!({ "choices": [] });
        assert!(parse_completion_response(&json).is_err());
    }
}
