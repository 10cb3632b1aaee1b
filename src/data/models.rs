//! Data models
//!
//! Rust structs representing database entities.
//! Actors are keyed by their identifier URI; posts by their remote activity id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

// =============================================================================
// Actor
// =============================================================================

/// Where an actor lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Local,
    Remote,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Local => "local",
            ActorKind::Remote => "remote",
        }
    }
}

impl std::str::FromStr for ActorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ActorKind::Local),
            "remote" => Ok(ActorKind::Remote),
            other => Err(format!("unknown actor kind: {other}")),
        }
    }
}

/// Public half of an actor's keypair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    /// Key identifier, usually `{actor}#main-key`
    pub id: String,
    /// SPKI PEM
    pub pem: String,
}

/// A federation participant
///
/// `row_id` is `None` for an actor that was fetched but not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub row_id: Option<i64>,
    /// Globally unique identifier URI
    pub id: String,
    pub kind: ActorKind,
    /// preferredUsername (or the WebFinger username when known)
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub shared_inbox: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_type: Option<String>,
    pub public_key: PublicKey,
    /// Origin host, including a non-default port
    pub host: String,
    pub discovered_at: DateTime<Utc>,
}

impl Actor {
    pub fn is_local(&self) -> bool {
        self.kind == ActorKind::Local
    }

    /// `user@host` handle
    pub fn handle(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

impl<'r> FromRow<'r, SqliteRow> for Actor {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind
            .parse::<ActorKind>()
            .map_err(|message| sqlx::Error::ColumnDecode {
                index: "kind".to_string(),
                source: message.into(),
            })?;

        Ok(Self {
            row_id: Some(row.try_get("id")?),
            id: row.try_get("actor_id")?,
            kind,
            username: row.try_get("username")?,
            display_name: row.try_get("display_name")?,
            summary: row.try_get("summary")?,
            inbox: row.try_get("inbox")?,
            outbox: row.try_get("outbox")?,
            followers: row.try_get("followers")?,
            following: row.try_get("following")?,
            shared_inbox: row.try_get("shared_inbox")?,
            avatar_url: row.try_get("avatar_url")?,
            avatar_type: row.try_get("avatar_type")?,
            public_key: PublicKey {
                id: row.try_get("key_id")?,
                pem: row.try_get("public_key_pem")?,
            },
            host: row.try_get("host")?,
            discovered_at: row.try_get("discovered_at")?,
        })
    }
}

/// A stored public key and the actor that owns it
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredKey {
    pub key_id: String,
    pub actor_id: String,
    pub public_key_pem: String,
}

/// Credentials held only by local actors
#[derive(Debug, Clone)]
pub struct NewLocalCredentials {
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    /// PKCS#8 PEM
    pub private_key_pem: String,
}

// =============================================================================
// WebFinger
// =============================================================================

/// Discovery-time mapping from a handle to an actor identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebfingerRecord {
    pub actor_id: String,
    pub username: String,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Post
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostKind {
    Article,
    Note,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostKind::Article => "Article",
            PostKind::Note => "Note",
        }
    }
}

impl std::str::FromStr for PostKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Article" => Ok(PostKind::Article),
            "Note" => Ok(PostKind::Note),
            other => Err(format!("unsupported object type: {other}")),
        }
    }
}

/// Mutable part of a post, as extracted from an Article or Note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostContent {
    pub kind: PostKind,
    pub published: DateTime<Utc>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
}

/// A post about to be inserted
#[derive(Debug, Clone)]
pub struct NewPost {
    /// Remote activity id, the post's identity key
    pub activity_id: String,
    /// Row id of the actor that owns the post
    pub owner_id: i64,
    /// Identifier of the actor that authored the activity
    pub actor_id: String,
    pub content: PostContent,
}

/// A stored remote post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub activity_id: String,
    pub owner_id: i64,
    pub actor_id: String,
    pub kind: PostKind,
    pub published: DateTime<Utc>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Post {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let kind = kind
            .parse::<PostKind>()
            .map_err(|message| sqlx::Error::ColumnDecode {
                index: "kind".to_string(),
                source: message.into(),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            activity_id: row.try_get("activity_id")?,
            owner_id: row.try_get("owner_id")?,
            actor_id: row.try_get("actor_id")?,
            kind,
            published: row.try_get("published")?,
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[cfg(test)]
impl Actor {
    /// Minimal unpersisted remote actor
    pub(crate) fn test_remote(id: &str) -> Self {
        let url = url::Url::parse(id).expect("test actor id is a URL");
        Self {
            row_id: None,
            id: id.to_string(),
            kind: ActorKind::Remote,
            username: id.rsplit('/').next().unwrap_or("test").to_string(),
            display_name: None,
            summary: None,
            inbox: format!("{}/inbox", id),
            outbox: Some(format!("{}/outbox", id)),
            followers: None,
            following: None,
            shared_inbox: None,
            avatar_url: None,
            avatar_type: None,
            public_key: PublicKey {
                id: format!("{}#main-key", id),
                pem: "-----BEGIN PUBLIC KEY-----\nMIIB\n-----END PUBLIC KEY-----\n".to_string(),
            },
            host: url.host_str().unwrap_or_default().to_string(),
            discovered_at: Utc::now(),
        }
    }
}
