use async_trait::async_trait;
use std::collections::BTreeMap;

use super::AssembledContext;
use crate::error::LangbaseResult;
use crate::langbase::{LangbaseClient, Message, PipeRequest};
use crate::session::ConversationTurn;

/// Input to one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Instructions for the model.
    pub system_instructions: String,
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// The query anchoring this turn.
    pub current_query: String,
    /// Known context, rendered into the system message.
    pub context: BTreeMap<String, String>,
}

impl ModelRequest {
    /// Build a request from assembled turn context.
    pub fn new(system_instructions: impl Into<String>, assembled: &AssembledContext) -> Self {
        Self {
            system_instructions: system_instructions.into(),
            history: assembled.history.clone(),
            current_query: assembled.current_query.clone(),
            context: assembled.context_map.clone(),
        }
    }

    /// System instructions followed by a "Known context" block, if any.
    pub fn system_message(&self) -> String {
        if self.context.is_empty() {
            return self.system_instructions.clone();
        }

        let known: Vec<String> = self
            .context
            .iter()
            .map(|(key, value)| format!("- {}: {}", key, value))
            .collect();
        format!(
            "{}\n\nKnown context:\n{}",
            self.system_instructions,
            known.join("\n")
        )
    }

    /// Chat messages: system, history, then the current query.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(Message::system(self.system_message()));
        messages.extend(self.history.iter().map(Message::from));
        messages.push(Message::user(self.current_query.clone()));
        messages
    }
}

/// Produces the raw model text for a follow-up turn.
///
/// One call is one attempt. Deadlines, retries and cancellation belong to
/// the caller.
#[async_trait]
pub trait ModelResponder: Send + Sync {
    /// Produce a response for `request`.
    async fn respond(&self, request: &ModelRequest) -> LangbaseResult<String>;
}

/// [`ModelResponder`] backed by a Langbase pipe.
#[derive(Clone)]
pub struct LangbaseResponder {
    client: LangbaseClient,
    pipe_name: String,
}

impl LangbaseResponder {
    /// Call `pipe_name` through `client`.
    pub fn new(client: LangbaseClient, pipe_name: impl Into<String>) -> Self {
        Self {
            client,
            pipe_name: pipe_name.into(),
        }
    }

    /// Name of the pipe being called.
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }
}

#[async_trait]
impl ModelResponder for LangbaseResponder {
    async fn respond(&self, request: &ModelRequest) -> LangbaseResult<String> {
        let pipe_request = PipeRequest::new(&self.pipe_name, request.to_messages());
        self.client.call_pipe(&pipe_request).await?.into_completion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::langbase::MessageRole;

    fn request(context: &[(&str, &str)]) -> ModelRequest {
        ModelRequest {
            system_instructions: "Ask what is missing.".into(),
            history: vec![
                ConversationTurn::user("How is my fund?"),
                ConversationTurn::agent("Which fund?"),
            ],
            current_query: "The midcap one".into(),
            context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_messages_order() {
        let messages = request(&[]).to_messages();
        let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User
            ]
        );
        assert_eq!(messages[0].content, "Ask what is missing.");
        assert_eq!(messages[3].content, "The midcap one");
    }

    #[test]
    fn test_known_context_block() {
        let message = request(&[("risk_level", "moderate"), ("fund_name", "Axis Midcap Fund")])
            .system_message();
        assert_eq!(
            message,
            "Ask what is missing.\n\nKnown context:\n- fund_name: Axis Midcap Fund\n- risk_level: moderate"
        );
    }
}
