//! Token usage event data models.
//!
//! Every token-consuming action appends one immutable usage event. The
//! caller reports an already-computed token count; nothing here talks
//! to the language model.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application feature that consumed tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageFeature {
    /// Generating a new character
    CharacterCreation,
    /// Chat turns with a character
    CharacterChat,
    /// AI-assisted story writing
    StoryAssistance,
    /// Conversation memory summarization
    MemorySummarization,
    /// World building content
    WorldBuilding,
    /// Plot development suggestions
    PlotDevelopment,
    /// Character development suggestions
    CharacterDevelopment,
    /// Anything uncategorized
    #[default]
    Other,
}

impl UsageFeature {
    /// Returns the feature as a string for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CharacterCreation => "character_creation",
            Self::CharacterChat => "character_chat",
            Self::StoryAssistance => "story_assistance",
            Self::MemorySummarization => "memory_summarization",
            Self::WorldBuilding => "world_building",
            Self::PlotDevelopment => "plot_development",
            Self::CharacterDevelopment => "character_development",
            Self::Other => "other",
        }
    }

    /// Returns a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CharacterCreation => "Character Creation",
            Self::CharacterChat => "Character Chat",
            Self::StoryAssistance => "Story Assistance",
            Self::MemorySummarization => "Memory Summarization",
            Self::WorldBuilding => "World Building",
            Self::PlotDevelopment => "Plot Development",
            Self::CharacterDevelopment => "Character Development",
            Self::Other => "Other",
        }
    }

    /// Parse from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "character_creation" => Some(Self::CharacterCreation),
            "character_chat" => Some(Self::CharacterChat),
            "story_assistance" => Some(Self::StoryAssistance),
            "memory_summarization" => Some(Self::MemorySummarization),
            "world_building" => Some(Self::WorldBuilding),
            "plot_development" => Some(Self::PlotDevelopment),
            "character_development" => Some(Self::CharacterDevelopment),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// All known features, in display order.
    pub fn all() -> &'static [UsageFeature] {
        &[
            Self::CharacterCreation,
            Self::CharacterChat,
            Self::StoryAssistance,
            Self::MemorySummarization,
            Self::WorldBuilding,
            Self::PlotDevelopment,
            Self::CharacterDevelopment,
            Self::Other,
        ]
    }
}

/// An immutable token usage record.
///
/// Created once per token-consuming action, never mutated or deleted.
/// The ledger is the audit trail reconcilable against the running
/// counter on the quota account.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UsageEvent {
    /// Unique identifier (UUID).
    pub id: Uuid,

    /// User who consumed the tokens.
    pub user_id: String,

    /// Feature that consumed them.
    pub feature: UsageFeature,

    /// Token count reported by the caller; always positive.
    pub tokens_used: i64,

    /// Associated character (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,

    /// Associated conversation (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,

    /// Associated story (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<i64>,

    /// Associated world (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_id: Option<i64>,

    /// When the tokens were consumed.
    pub timestamp: DateTime<Utc>,
}

/// Context accompanying a usage-recording request.
///
/// Carries the feature and optional entity references supplied by
/// feature code alongside the token count.
#[derive(Debug, Clone, Default)]
pub struct UsageContext {
    pub feature: UsageFeature,
    pub character_id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub story_id: Option<i64>,
    pub world_id: Option<i64>,
}

impl UsageContext {
    /// Create a context for a feature with no entity references.
    pub fn new(feature: UsageFeature) -> Self {
        Self {
            feature,
            ..Default::default()
        }
    }

    /// Set the character reference.
    pub fn with_character(mut self, character_id: i64) -> Self {
        self.character_id = Some(character_id);
        self
    }

    /// Set the conversation reference.
    pub fn with_conversation(mut self, conversation_id: i64) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Set the story reference.
    pub fn with_story(mut self, story_id: i64) -> Self {
        self.story_id = Some(story_id);
        self
    }

    /// Set the world reference.
    pub fn with_world(mut self, world_id: i64) -> Self {
        self.world_id = Some(world_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_round_trip() {
        for feature in UsageFeature::all() {
            assert_eq!(UsageFeature::from_str(feature.as_str()), Some(*feature));
        }
        assert_eq!(UsageFeature::from_str("telepathy"), None);
    }

    #[test]
    fn test_feature_serde_names_match_storage() {
        // Wire names and stored names must agree
        for feature in UsageFeature::all() {
            let json = serde_json::to_value(feature).unwrap();
            assert_eq!(json, serde_json::Value::String(feature.as_str().to_string()));
        }
    }

    #[test]
    fn test_feature_default_is_other() {
        assert_eq!(UsageFeature::default(), UsageFeature::Other);
    }

    #[test]
    fn test_usage_context_builder() {
        let ctx = UsageContext::new(UsageFeature::CharacterChat)
            .with_character(7)
            .with_conversation(42);
        assert_eq!(ctx.feature, UsageFeature::CharacterChat);
        assert_eq!(ctx.character_id, Some(7));
        assert_eq!(ctx.conversation_id, Some(42));
        assert_eq!(ctx.story_id, None);
        assert_eq!(ctx.world_id, None);
    }
}
