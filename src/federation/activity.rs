//! Inbound activity processing
//!
//! An inbound envelope is decoded into one closed variant per supported
//! activity kind and dispatched by pattern match. Anything else is rejected
//! before a handler runs.
//!
//! Resolution rules, per kind:
//! - the acting party is always the envelope `actor`, which must own the
//!   verifying key;
//! - Follow: the target is the first `to` entry naming a local actor;
//! - Undo: the follower is the envelope `actor`, the followee the nested
//!   Follow's `object` (else the first local `to` entry);
//! - Accept: the local initiator is the nested Follow's `actor` (else the
//!   first local `to` entry), the accepter is the envelope `actor`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::delivery::{builder, new_activity_id};
use super::directory::ActorDirectory;
use super::signature::VerifiedSigner;
use super::tasks::{FederationTask, PendingDelivery, TaskQueue};
use super::types::{IdRef, OneOrMany};
use crate::data::{Actor, Database, NewPost, PostContent, PostKind};
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, POSTS_IMPORTED_TOTAL};

// =============================================================================
// Envelope
// =============================================================================

/// A decoded inbound activity
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundActivity {
    Follow(FollowActivity),
    Undo(WrappingActivity),
    Accept(WrappingActivity),
    Create(ObjectActivity),
    Update(ObjectActivity),
    Delete(DeleteActivity),
}

/// `Follow`
#[derive(Debug, Clone, Deserialize)]
pub struct FollowActivity {
    #[serde(default)]
    pub id: Option<String>,
    pub actor: IdRef,
    #[serde(default)]
    pub object: Option<IdRef>,
    #[serde(default)]
    pub to: Option<OneOrMany<String>>,
}

/// `Undo` or `Accept`, both of which wrap an earlier activity
#[derive(Debug, Clone, Deserialize)]
pub struct WrappingActivity {
    #[serde(default)]
    pub id: Option<String>,
    pub actor: IdRef,
    pub object: ActivityRef,
    #[serde(default)]
    pub to: Option<OneOrMany<String>>,
}

/// The activity an Undo or Accept refers to
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActivityRef {
    Embedded(NestedActivity),
    Id(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NestedActivity {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub actor: Option<IdRef>,
    #[serde(default)]
    pub object: Option<IdRef>,
}

/// `Create` or `Update` carrying an embedded Article or Note
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectActivity {
    #[serde(default)]
    pub id: Option<String>,
    pub actor: IdRef,
    pub object: PostObject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub url: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// `Delete` of an object IRI or Tombstone
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteActivity {
    #[serde(default)]
    pub id: Option<String>,
    pub actor: IdRef,
    pub object: IdRef,
}

const SUPPORTED_KINDS: [&str; 6] = ["Follow", "Undo", "Accept", "Create", "Update", "Delete"];

impl InboundActivity {
    /// Decode a raw envelope
    ///
    /// # Errors
    /// `Validation` for a missing or unsupported `type` or a missing
    /// required field.
    pub fn decode(raw: &Value) -> Result<Self, AppError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Activity has no type".to_string()))?;

        if !SUPPORTED_KINDS.contains(&kind) {
            return Err(AppError::Validation(format!(
                "Unsupported activity type: {}",
                kind
            )));
        }

        InboundActivity::deserialize(raw)
            .map_err(|e| AppError::Validation(format!("Malformed {} activity: {}", kind, e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundActivity::Follow(_) => "Follow",
            InboundActivity::Undo(_) => "Undo",
            InboundActivity::Accept(_) => "Accept",
            InboundActivity::Create(_) => "Create",
            InboundActivity::Update(_) => "Update",
            InboundActivity::Delete(_) => "Delete",
        }
    }

    /// Identifier of the acting party
    pub fn actor(&self) -> &str {
        match self {
            InboundActivity::Follow(a) => a.actor.id(),
            InboundActivity::Undo(a) | InboundActivity::Accept(a) => a.actor.id(),
            InboundActivity::Create(a) | InboundActivity::Update(a) => a.actor.id(),
            InboundActivity::Delete(a) => a.actor.id(),
        }
    }
}

/// `url` may be an IRI, a Link object or a list of either
fn extract_url(url: &Value) -> Option<String> {
    match url {
        Value::String(href) => Some(href.clone()),
        Value::Object(link) => link.get("href").and_then(Value::as_str).map(str::to_string),
        Value::Array(links) => links.iter().find_map(extract_url),
        _ => None,
    }
}

impl PostObject {
    /// Extract `{published, kind, url, name, content}`
    ///
    /// # Errors
    /// `Validation` if the object is neither an Article nor a Note.
    pub fn to_content(&self) -> Result<PostContent, AppError> {
        let kind = self.kind.parse::<PostKind>().map_err(AppError::Validation)?;

        let published = match self.published.as_deref() {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|date| date.with_timezone(&Utc))
                .unwrap_or_else(|e| {
                    tracing::debug!(object_id = %self.id, error = %e, "Unparseable published date");
                    Utc::now()
                }),
            None => Utc::now(),
        };

        Ok(PostContent {
            kind,
            published,
            url: self.url.as_ref().and_then(extract_url),
            title: self.name.clone(),
            content: self.content.clone().unwrap_or_default(),
        })
    }
}

impl ObjectActivity {
    /// Build the post this activity creates, owned by `owner_id`
    pub fn to_new_post(&self, owner_id: i64) -> Result<NewPost, AppError> {
        Ok(NewPost {
            activity_id: self.object.id.clone(),
            owner_id,
            actor_id: self.actor.id().to_string(),
            content: self.object.to_content()?,
        })
    }
}

impl NestedActivity {
    fn is_follow(&self) -> bool {
        self.kind == "Follow"
    }
}

fn recipients(to: &Option<OneOrMany<String>>) -> Vec<&str> {
    match to {
        Some(OneOrMany::One(one)) => vec![one.as_str()],
        Some(OneOrMany::Many(many)) => many.iter().map(String::as_str).collect(),
        None => Vec::new(),
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Inbox state machine: decode, authorize, dispatch
pub struct InboxDispatcher {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    tasks: TaskQueue,
}

impl InboxDispatcher {
    pub fn new(db: Arc<Database>, directory: Arc<ActorDirectory>, tasks: TaskQueue) -> Self {
        Self {
            db,
            directory,
            tasks,
        }
    }

    /// Dispatch a verified inbound activity
    ///
    /// Returns once the synchronous part is done; any reply runs as a
    /// detached task.
    ///
    /// # Errors
    /// - `Validation` for an undecodable or unsupported envelope
    /// - `Unauthorized` if the envelope actor does not own the signing key
    /// - `Transport` / `NotFound` if a synchronous actor resolution fails
    pub async fn dispatch(&self, raw: Value, signer: &VerifiedSigner) -> Result<(), AppError> {
        let activity = match InboundActivity::decode(&raw) {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(error = %e, payload = %raw, "Rejected inbound activity");
                return Err(e);
            }
        };

        if activity.actor() != signer.actor_id {
            return Err(AppError::Unauthorized(format!(
                "Activity actor {} does not own key {}",
                activity.actor(),
                signer.key_id
            )));
        }

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind()])
            .inc();
        tracing::info!(
            activity_type = activity.kind(),
            actor = %activity.actor(),
            "Processing inbound activity"
        );

        match activity {
            InboundActivity::Follow(follow) => self.handle_follow(follow, raw).await,
            InboundActivity::Undo(undo) => self.handle_undo(undo).await,
            InboundActivity::Accept(accept) => self.handle_accept(accept).await,
            InboundActivity::Create(create) => self.handle_create(create).await,
            InboundActivity::Update(update) => self.handle_update(update).await,
            InboundActivity::Delete(delete) => self.handle_delete(delete).await,
        }
    }

    /// First candidate that names a local actor
    async fn first_local_actor<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<Actor>, AppError> {
        for candidate in candidates {
            if let Some(actor) = self.db.get_actor(candidate).await? {
                if actor.is_local() {
                    return Ok(Some(actor));
                }
            }
        }
        Ok(None)
    }

    async fn handle_follow(&self, follow: FollowActivity, raw: Value) -> Result<(), AppError> {
        let to = recipients(&follow.to);
        if to.is_empty() {
            return Err(AppError::Validation("Follow has no `to` target".to_string()));
        }

        let target = self.first_local_actor(to).await?.ok_or_else(|| {
            AppError::Validation("Follow target is not a local actor".to_string())
        })?;

        let requester = self.directory.resolve(follow.actor.id()).await?;

        let accept = builder::accept(
            &new_activity_id(&target.id, "accept"),
            &target.id,
            raw,
            &requester.id,
        );
        let reply = PendingDelivery {
            payload: accept,
            inbox: requester.inbox.clone(),
            signer: target.id.clone(),
            scheduled_at: Utc::now()
                + chrono::Duration::milliseconds(self.tasks.settle_delay().as_millis() as i64),
        };

        tracing::info!(follower = %requester.id, followee = %target.id, "Scheduling Accept");
        self.tasks.submit(FederationTask::AcceptFollow {
            follower: requester,
            followee: target.id,
            reply,
        });

        Ok(())
    }

    async fn handle_undo(&self, undo: WrappingActivity) -> Result<(), AppError> {
        let follower_id = undo.actor.id().to_string();

        let nested_object = match &undo.object {
            ActivityRef::Embedded(nested) => {
                if !nested.is_follow() {
                    return Err(AppError::Validation(format!(
                        "Unsupported Undo of {}",
                        nested.kind
                    )));
                }
                if let Some(actor) = &nested.actor {
                    if actor.id() != follower_id {
                        return Err(AppError::Validation(
                            "Undo actor does not match the undone Follow".to_string(),
                        ));
                    }
                }
                nested.object.as_ref().map(|o| o.id().to_string())
            }
            ActivityRef::Id(_) => None,
        };

        // Tolerated: the edge is removed by identifier either way.
        if let Err(e) = self.directory.resolve(&follower_id).await {
            tracing::warn!(actor = %follower_id, error = %e, "Could not resolve unfollowing actor");
        }

        let candidates = nested_object
            .as_deref()
            .into_iter()
            .chain(recipients(&undo.to))
            .collect::<Vec<&str>>();
        let followee = self.first_local_actor(candidates).await?.ok_or_else(|| {
            AppError::Validation("Undo target is not a local actor".to_string())
        })?;

        tracing::info!(
            follower = %follower_id,
            followee = %followee.id,
            "Scheduling follow removal"
        );
        self.tasks.submit(FederationTask::RemoveFollow {
            follower: follower_id,
            followee: followee.id,
        });

        Ok(())
    }

    async fn handle_accept(&self, accept: WrappingActivity) -> Result<(), AppError> {
        let nested_actor = match &accept.object {
            ActivityRef::Embedded(nested) => {
                if !nested.is_follow() {
                    return Err(AppError::Validation(format!(
                        "Unsupported Accept of {}",
                        nested.kind
                    )));
                }
                if nested.object.as_ref().map(IdRef::id) != Some(accept.actor.id()) {
                    return Err(AppError::Validation(
                        "Accept answers a Follow of another actor".to_string(),
                    ));
                }
                nested.actor.as_ref().map(|a| a.id().to_string())
            }
            ActivityRef::Id(_) => None,
        };

        let candidates = nested_actor
            .as_deref()
            .into_iter()
            .chain(recipients(&accept.to))
            .collect::<Vec<&str>>();
        let initiator = self.first_local_actor(candidates).await?.ok_or_else(|| {
            AppError::Validation("Accept does not answer a local actor's Follow".to_string())
        })?;

        let accepter = self.directory.resolve_and_persist(accept.actor.id()).await?;

        if self.db.add_follow(&initiator.id, &accepter.id).await? {
            tracing::info!(follower = %initiator.id, followee = %accepter.id, "Follow accepted");
        }

        if accepter.outbox.is_some() {
            self.tasks.submit(FederationTask::ImportOutbox { owner: accepter });
        } else {
            tracing::debug!(actor = %accepter.id, "Accepter has no outbox; nothing to import");
        }

        Ok(())
    }

    async fn handle_create(&self, create: ObjectActivity) -> Result<(), AppError> {
        let owner = self.directory.resolve_and_persist(create.actor.id()).await?;
        let owner_id = owner
            .row_id
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Persisted actor has no row id")))?;
        let post = create.to_new_post(owner_id)?;

        match self.db.insert_post(&post).await? {
            Some(_) => {
                POSTS_IMPORTED_TOTAL.with_label_values(&["inbox"]).inc();
                tracing::info!(activity_id = %post.activity_id, actor = %owner.id, "Stored post");
            }
            None => {
                tracing::debug!(activity_id = %post.activity_id, "Post already stored");
            }
        }

        Ok(())
    }

    async fn handle_update(&self, update: ObjectActivity) -> Result<(), AppError> {
        let content = update.object.to_content()?;
        let actor = self.directory.resolve(update.actor.id()).await?;

        if self
            .db
            .update_post(&update.object.id, &actor.id, &content)
            .await?
        {
            tracing::info!(activity_id = %update.object.id, "Updated post");
        } else {
            tracing::debug!(activity_id = %update.object.id, "Update for unknown post ignored");
        }

        Ok(())
    }

    async fn handle_delete(&self, delete: DeleteActivity) -> Result<(), AppError> {
        let actor = self.directory.resolve(delete.actor.id()).await?;

        if self.db.delete_post(delete.object.id(), &actor.id).await? {
            tracing::info!(activity_id = %delete.object.id(), "Deleted post");
        } else {
            tracing::debug!(activity_id = %delete.object.id(), "Delete for unknown post ignored");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_follow() {
        let raw = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://read.example/users/alice",
            "to": "https://read.example/users/alice"
        });

        let InboundActivity::Follow(follow) = InboundActivity::decode(&raw).unwrap() else {
            panic!("expected Follow");
        };
        assert_eq!(follow.actor.id(), "https://remote.example/users/bob");
        assert_eq!(recipients(&follow.to), vec!["https://read.example/users/alice"]);
    }

    #[test]
    fn decodes_undo_with_embedded_follow() {
        let raw = serde_json::json!({
            "type": "Undo",
            "actor": {"id": "https://remote.example/users/bob", "type": "Person"},
            "object": {
                "type": "Follow",
                "actor": "https://remote.example/users/bob",
                "object": "https://read.example/users/alice"
            }
        });

        let activity = InboundActivity::decode(&raw).unwrap();
        assert_eq!(activity.kind(), "Undo");
        assert_eq!(activity.actor(), "https://remote.example/users/bob");
        let InboundActivity::Undo(undo) = activity else {
            panic!("expected Undo");
        };
        let ActivityRef::Embedded(nested) = undo.object else {
            panic!("expected embedded Follow");
        };
        assert!(nested.is_follow());
    }

    #[test]
    fn decodes_accept_of_reference() {
        let raw = serde_json::json!({
            "type": "Accept",
            "actor": "https://remote.example/users/bob",
            "object": "https://read.example/users/alice/follow/01H",
            "to": ["https://read.example/users/alice"]
        });

        let InboundActivity::Accept(accept) = InboundActivity::decode(&raw).unwrap() else {
            panic!("expected Accept");
        };
        assert!(matches!(accept.object, ActivityRef::Id(_)));
    }

    #[test]
    fn decodes_delete_tombstone() {
        let raw = serde_json::json!({
            "type": "Delete",
            "actor": "https://remote.example/users/bob",
            "object": {"type": "Tombstone", "id": "https://remote.example/notes/1"}
        });

        let InboundActivity::Delete(delete) = InboundActivity::decode(&raw).unwrap() else {
            panic!("expected Delete");
        };
        assert_eq!(delete.object.id(), "https://remote.example/notes/1");
    }

    #[test]
    fn rejects_unknown_kind() {
        let raw = serde_json::json!({
            "type": "Like",
            "actor": "https://remote.example/users/bob",
            "object": "https://read.example/notes/1"
        });

        let error = InboundActivity::decode(&raw).unwrap_err();
        assert!(matches!(error, AppError::Validation(message) if message.contains("Like")));
    }

    #[test]
    fn rejects_missing_type() {
        let raw = serde_json::json!({"actor": "https://remote.example/users/bob"});
        assert!(matches!(
            InboundActivity::decode(&raw),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn rejects_create_without_embedded_object() {
        let raw = serde_json::json!({
            "type": "Create",
            "actor": "https://remote.example/users/bob",
            "object": "https://remote.example/notes/1"
        });

        let error = InboundActivity::decode(&raw).unwrap_err();
        assert!(matches!(
            error,
            AppError::Validation(message) if message.contains("Malformed Create")
        ));
    }

    #[test]
    fn extracts_post_content() {
        let raw = serde_json::json!({
            "type": "Create",
            "actor": "https://remote.example/users/bob",
            "object": {
                "id": "https://remote.example/articles/7",
                "type": "Article",
                "published": "2026-03-01T12:00:00Z",
                "url": [{"type": "Link", "href": "https://remote.example/@bob/7"}],
                "name": "Seven",
                "content": "<p>seven</p>"
            }
        });

        let InboundActivity::Create(create) = InboundActivity::decode(&raw).unwrap() else {
            panic!("expected Create");
        };
        let post = create.to_new_post(3).unwrap();

        assert_eq!(post.activity_id, "https://remote.example/articles/7");
        assert_eq!(post.owner_id, 3);
        assert_eq!(post.actor_id, "https://remote.example/users/bob");
        assert_eq!(post.content.kind, PostKind::Article);
        assert_eq!(post.content.url.as_deref(), Some("https://remote.example/@bob/7"));
        assert_eq!(post.content.title.as_deref(), Some("Seven"));
        assert_eq!(post.content.published.to_rfc3339(), "2026-03-01T12:00:00+00:00");
    }

    #[test]
    fn rejects_unsupported_object_type() {
        let object = PostObject {
            id: "https://remote.example/q/1".to_string(),
            kind: "Question".to_string(),
            published: None,
            url: None,
            name: None,
            content: None,
        };

        assert!(matches!(object.to_content(), Err(AppError::Validation(_))));
    }
}
