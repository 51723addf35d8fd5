//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actors and groups
// =============================================================================

/// A federated identity, local or remote
///
/// Rows are created lazily the first time a handle is referenced and
/// never deleted. Profile fields are a cache of the last fetched actor
/// document.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// Lowercased `user@host` handle
    pub handle: String,
    /// ActivityPub actor document URL
    pub actor_url: Option<String>,
    pub profile_picture_url: Option<String>,
    /// Cached RSA public key (PEM format)
    pub public_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A local group actor
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub id: String,
    /// Local name, the part before `@` in the group handle
    pub name: String,
    /// The group's own `actors` row (`name@domain`)
    pub actor_id: String,
    pub display_name: String,
    pub summary: String,
    pub creator_id: Option<String>,
    pub discoverable: bool,
    pub icon_url: Option<String>,
    /// RSA private key (PEM format)
    #[serde(skip_serializing)]
    pub private_key_pem: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

/// Group membership
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Member {
    pub id: String,
    pub group_id: String,
    pub actor_id: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notes and boosts
// =============================================================================

/// A locally authored note
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
    pub id: String,
    /// Authoring actor (a group for group messages)
    pub actor_id: String,
    pub content: String,
    pub source: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// A remote note admitted into a group
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Boost {
    pub id: String,
    /// Canonical id of the boosted remote object. Unique.
    pub note_id: String,
    pub group_id: String,
    pub original_poster_id: Option<String>,
    /// Parent boost in the thread tree
    pub in_reply_to_id: Option<String>,
    pub content: String,
    pub source: String,
    pub summary: String,
    pub sensitive: bool,
    /// Raw `attachment` array, JSON encoded
    pub attachments: Option<String>,
    /// Remote `published` timestamp
    pub original_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Addressing entry of a note or boost
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub id: String,
    /// Owning note or boost id
    pub parent_id: String,
    pub url: String,
    /// "to" or "cc"
    pub recipient_type: String,
    /// Resolved actor, when the URL denotes one
    pub actor_id: Option<String>,
}

/// Which addressing field a recipient came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientType {
    To,
    Cc,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::To => "to",
            Self::Cc => "cc",
        }
    }
}

/// Recipient row to be written alongside a note or boost
#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub url: String,
    pub recipient_type: RecipientType,
    pub actor_id: Option<String>,
}

/// Fields of a boost to be created
#[derive(Debug, Clone)]
pub struct NewBoost {
    pub note_id: String,
    pub group_id: String,
    pub original_poster_id: Option<String>,
    pub in_reply_to_id: Option<String>,
    pub content: String,
    pub source: String,
    pub summary: String,
    pub sensitive: bool,
    pub attachments: Option<String>,
    pub original_time: Option<DateTime<Utc>>,
    pub recipients: Vec<NewRecipient>,
}

/// Fields of a local note to be created
#[derive(Debug, Clone)]
pub struct NewNote {
    pub actor_id: String,
    pub content: String,
    pub source: String,
    pub summary: String,
    pub recipients: Vec<NewRecipient>,
}

/// Result of an insert that is a no-op when the row already exists
#[derive(Debug, Clone)]
pub enum Upsert<T> {
    Created(T),
    Existing(T),
}

impl<T> Upsert<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Created(value) | Self::Existing(value) => value,
        }
    }
}
