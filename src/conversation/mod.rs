//! Conversation types and history

use serde::{Deserialize, Serialize};

/// A single finalized turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<Mood>,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            mood: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[cfg(test)]
    pub fn with_mood(mut self, mood: Mood) -> Self {
        self.mood = Some(mood);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Optional emotional tag attached to a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Neutral,
    Sad,
    Angry,
    Excited,
    Worried,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Neutral => "neutral",
            Mood::Sad => "sad",
            Mood::Angry => "angry",
            Mood::Excited => "excited",
            Mood::Worried => "worried",
        }
    }
}

/// Ordered, append-only list of turns.
///
/// Insertion order is replayed as-is to the upstream as context. Entries are
/// never removed or reordered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    turns: Vec<ChatTurn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    #[cfg(test)]
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ChatTurn> {
        self.turns.last()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatTurn> {
        self.turns.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_insertion_order() {
        let mut history = ConversationHistory::new();
        history.push(ChatTurn::system("be brief"));
        history.push(ChatTurn::user("hi"));
        history.push(ChatTurn::assistant("hello"));

        let roles: Vec<Role> = history.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert_eq!(history.last().unwrap().content, "hello");
    }

    #[test]
    fn test_mood_is_omitted_when_absent() {
        let plain = serde_json::to_value(ChatTurn::user("hi")).unwrap();
        assert_eq!(plain, serde_json::json!({"role": "user", "content": "hi"}));

        let tagged = serde_json::to_value(ChatTurn::user("yay").with_mood(Mood::Excited)).unwrap();
        assert_eq!(tagged["mood"], "excited");
    }

    #[test]
    fn test_history_deserializes_from_array() {
        let history: ConversationHistory = serde_json::from_str(
            r#"[{"role":"user","content":"a"},{"role":"assistant","content":"b","mood":"happy"}]"#,
        )
        .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.turns()[1].mood, Some(Mood::Happy));
    }
}
