//! Outbound follow
//!
//! A local actor follows a remote one by handle. The edge is only recorded
//! when the remote side answers with an Accept.

use std::sync::Arc;

use super::delivery::{ActivityDelivery, builder, new_activity_id};
use super::directory::ActorDirectory;
use super::webfinger::{WebFingerResolver, parse_handle};
use crate::data::{Actor, Database};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct FollowOutcome {
    pub target: Actor,
    pub activity_id: String,
}

pub struct FollowInitiator {
    db: Arc<Database>,
    webfinger: Arc<WebFingerResolver>,
    directory: Arc<ActorDirectory>,
    delivery: ActivityDelivery,
}

impl FollowInitiator {
    pub fn new(
        db: Arc<Database>,
        webfinger: Arc<WebFingerResolver>,
        directory: Arc<ActorDirectory>,
        delivery: ActivityDelivery,
    ) -> Self {
        Self {
            db,
            webfinger,
            directory,
            delivery,
        }
    }

    /// Send a signed Follow from `local_username` to the actor behind `handle`
    ///
    /// # Errors
    /// - `Validation` for a malformed handle
    /// - `NotFound` if the local user or the remote actor does not exist
    /// - `Transport` if discovery, the actor fetch or the delivery fails
    pub async fn follow(
        &self,
        local_username: &str,
        handle: &str,
    ) -> Result<FollowOutcome, AppError> {
        let (username, host) = parse_handle(handle)?;

        let local = self
            .db
            .get_local_actor(local_username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No local actor named {}", local_username)))?;
        let key = self
            .db
            .load_signing_key(&local.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No signing key for {}", local.id)))?;

        let discovered = self.webfinger.discover(&host, &username).await?;
        let target = self.directory.resolve_and_persist(&discovered.actor_id).await?;

        let activity_id = new_activity_id(&local.id, "follow");
        let follow = builder::follow(&activity_id, &local.id, &target.id);

        let result = self.delivery.deliver(&key, &target.inbox, &follow).await;
        if !result.success {
            return Err(AppError::Transport(result.error.unwrap_or_else(|| {
                format!("Follow delivery to {} failed", target.inbox)
            })));
        }

        tracing::info!(
            follower = %local.id,
            target = %target.id,
            activity_id = %activity_id,
            "Follow sent"
        );

        Ok(FollowOutcome {
            target,
            activity_id,
        })
    }
}
