use crate::models::{ChatMessage, ChatRole};

/// Messages replayed into the runtime, led by a fixed system message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    messages: Vec<ChatMessage>,
}

impl ConversationState {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system_prompt)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Drops a trailing user message that never got an answer.
    pub fn rollback_pending_user(&mut self) -> Option<ChatMessage> {
        match self.messages.last() {
            Some(message) if message.role == ChatRole::User && self.messages.len() > 1 => {
                self.messages.pop()
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.messages.truncate(1);
    }

    /// Number of messages after the system prompt.
    pub fn turn_messages(&self) -> usize {
        self.messages.len() - 1
    }
}
