use serde::{Deserialize, Serialize};

use crate::ids::ProjectId;

pub const DEFAULT_WORD_MIN: u32 = 150;
pub const DEFAULT_WORD_MAX: u32 = 300;
pub const DEFAULT_LANGUAGE: &str = "English";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordRange {
    pub min: u32,
    pub max: u32,
}

impl WordRange {
    pub fn contains(&self, count: u32) -> bool {
        count >= self.min && count <= self.max
    }
}

impl Default for WordRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_WORD_MIN,
            max: DEFAULT_WORD_MAX,
        }
    }
}

/// Everything the agents need to know about the post being produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectBrief {
    pub project_id: ProjectId,
    pub topic: String,
    pub tone: String,
    pub audience: String,
    pub word_range: WordRange,
    pub language: String,
    pub include_hashtags: bool,
    pub include_cta: bool,
    pub include_emoji: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_post: Option<String>,
    /// User feedback on a previous result, present only for regeneration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl ProjectBrief {
    pub fn new(project_id: ProjectId, topic: impl Into<String>) -> Self {
        Self {
            project_id,
            topic: topic.into(),
            tone: "professional".into(),
            audience: "general".into(),
            word_range: WordRange::default(),
            language: DEFAULT_LANGUAGE.into(),
            include_hashtags: true,
            include_cta: true,
            include_emoji: false,
            template_instructions: None,
            example_post: None,
            feedback: None,
        }
    }
}
