//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes. Delivery is best-effort:
//! a failure is logged and reported in the `DeliveryResult`, never retried.

use std::sync::Arc;

use serde_json::Value;

use super::client::FederationClient;
use super::signature::{SigningKey, sign_request};
use crate::error::AppError;
use crate::metrics::ACTIVITYPUB_ACTIVITIES_SENT;

/// Activity delivery service
#[derive(Clone)]
pub struct ActivityDelivery {
    client: Arc<FederationClient>,
}

/// Result of a delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code if available
    pub status_code: Option<u16>,
}

/// Mint a fresh activity id under the actor, e.g. `{actor}/accept/{ulid}`
pub fn new_activity_id(actor_id: &str, kind: &str) -> String {
    format!("{}/{}/{}", actor_id, kind, ulid::Ulid::new())
}

impl ActivityDelivery {
    pub fn new(client: Arc<FederationClient>) -> Self {
        Self { client }
    }

    /// Deliver an activity to a single inbox
    ///
    /// Never fails: errors are logged and returned in the result.
    pub async fn deliver(
        &self,
        key: &SigningKey,
        inbox_uri: &str,
        activity: &Value,
    ) -> DeliveryResult {
        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();

        match self.try_deliver(key, inbox_uri, activity).await {
            Ok(status) => {
                ACTIVITYPUB_ACTIVITIES_SENT
                    .with_label_values(&[activity_type.as_str()])
                    .inc();
                tracing::info!(
                    inbox = %inbox_uri,
                    activity_type = %activity_type,
                    status,
                    "Delivered activity"
                );
                DeliveryResult {
                    inbox_uri: inbox_uri.to_string(),
                    success: true,
                    error: None,
                    status_code: Some(status),
                }
            }
            Err(e) => {
                tracing::warn!(
                    inbox = %inbox_uri,
                    activity_type = %activity_type,
                    error = %e,
                    "Activity delivery failed"
                );
                DeliveryResult {
                    inbox_uri: inbox_uri.to_string(),
                    success: false,
                    error: Some(e.to_string()),
                    status_code: None,
                }
            }
        }
    }

    async fn try_deliver(
        &self,
        key: &SigningKey,
        inbox_uri: &str,
        activity: &Value,
    ) -> Result<u16, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        let signed = sign_request("POST", inbox_uri, &body, key)?;

        self.client.post_activity(inbox_uri, body, signed).await
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    pub const ACTIVITY_STREAMS: &str = "https://www.w3.org/ns/activitystreams";
    pub const SECURITY_V1: &str = "https://w3id.org/security/v1";

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee), also the sole `to` recipient
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [object]
        })
    }

    /// Build an Accept activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - The Follow being accepted, embedded as received
    /// * `to` - Actor URI of the follower
    pub fn accept(id: &str, actor: &str, object: Value, to: &str) -> Value {
        serde_json::json!({
            "@context": ACTIVITY_STREAMS,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [to]
        })
    }
}
