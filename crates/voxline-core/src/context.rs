//! Conversation context: the ordered turn history of one session.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered turn history. Only ever appended to; snapshots are plain clones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a context seeded with a system prompt.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let mut ctx = Self::new();
        if !prompt.trim().is_empty() {
            ctx.turns.push(Turn::new(Role::System, prompt));
        }
        ctx
    }

    /// Append a completed user turn. Blank text is ignored.
    pub fn push_user(&mut self, text: &str) -> bool {
        self.push(Role::User, text)
    }

    /// Append a completed assistant turn. Blank text is ignored.
    pub fn push_assistant(&mut self, text: &str) -> bool {
        self.push(Role::Assistant, text)
    }

    fn push(&mut self, role: Role, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        self.turns.push(Turn::new(role, text));
        true
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_seed() {
        let ctx = ConversationContext::with_system_prompt("be brief");
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.turns()[0].role, Role::System);

        let empty = ConversationContext::with_system_prompt("   ");
        assert!(empty.is_empty());
    }

    #[test]
    fn test_append_order_and_blank_skip() {
        let mut ctx = ConversationContext::new();
        assert!(ctx.push_user(" hello "));
        assert!(!ctx.push_assistant("  "));
        assert!(ctx.push_assistant("hi there"));

        let roles: Vec<Role> = ctx.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(ctx.turns()[0].content, "hello");
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut ctx = ConversationContext::new();
        ctx.push_user("one");
        let snapshot = ctx.clone();
        ctx.push_user("two");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(ctx.len(), 2);
    }
}
