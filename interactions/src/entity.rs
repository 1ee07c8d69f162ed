//! Wire models for the entities the backend serves. Vote and save fields
//! arrive as nullable, inconsistently named columns; the seed accessors
//! narrow them into the reconciler's vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::reconciler::VoteValue;

/// The unit of voting and saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Post,
    Comment,
}

impl EntityKind {
    /// The path segment the backend uses for this kind, doubling as the
    /// storage-key segment.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Comment => "comments",
        }
    }
}

/// Identifies one entity across the store, the dispatcher and the API client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

impl EntityRef {
    pub fn post(id: i64) -> EntityRef {
        EntityRef {
            kind: EntityKind::Post,
            id,
        }
    }

    pub fn comment(id: i64) -> EntityRef {
        EntityRef {
            kind: EntityKind::Comment,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub score: i64,
    #[serde(default)]
    pub comments_count: i64,
    #[serde(default)]
    pub community_name: Option<String>,
    #[serde(default)]
    pub user: Option<UserSummary>,
    // The backend is not consistent about this field's name across endpoints.
    #[serde(default, alias = "user_vote_value")]
    pub current_user_vote: Option<i64>,
    #[serde(default)]
    pub is_saved: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Post {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::post(self.id)
    }

    pub fn vote_seed(&self) -> VoteValue {
        VoteValue::from_int(self.current_user_vote.unwrap_or(0))
    }

    pub fn saved_seed(&self) -> bool {
        self.is_saved.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub content: String,
    #[serde(default)]
    pub user: Option<UserSummary>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub post_id: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub score: i64,
    #[serde(default, alias = "user_vote_value")]
    pub current_user_vote: Option<i64>,
    #[serde(default)]
    pub is_saved: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Comment {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::comment(self.id)
    }

    pub fn vote_seed(&self) -> VoteValue {
        VoteValue::from_int(self.current_user_vote.unwrap_or(0))
    }

    pub fn saved_seed(&self) -> bool {
        self.is_saved.unwrap_or(false)
    }
}
