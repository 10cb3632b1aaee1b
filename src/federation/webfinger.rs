//! WebFinger protocol implementation
//!
//! Outbound: maps a `user@host` handle to an ActivityPub actor identifier.
//! Inbound: answers discovery queries for local actors.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::client::{ACTIVITY_JSON, FederationClient, LD_JSON_ACTIVITY};
use crate::config::ServerConfig;
use crate::data::{Database, WebfingerRecord};
use crate::error::AppError;

const PROFILE_PAGE_REL: &str = "http://webfinger.net/rel/profile-page";

/// WebFinger result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebFingerResult {
    /// ActivityPub actor identifier
    pub actor_id: String,
    pub username: String,
    pub host: String,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// First `self` link carrying the ActivityPub media type
    pub fn actor_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && matches!(
                        link.link_type.as_deref(),
                        Some(ACTIVITY_JSON) | Some(LD_JSON_ACTIVITY)
                    )
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Split `user@host`, `@user@host` or `acct:user@host`
pub fn parse_handle(handle: &str) -> Result<(String, String), AppError> {
    let handle = handle.trim();
    let handle = handle.strip_prefix("acct:").unwrap_or(handle);
    let handle = handle.strip_prefix('@').unwrap_or(handle);

    match handle.split_once('@') {
        Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => {
            Ok((user.to_string(), host.to_ascii_lowercase()))
        }
        _ => Err(AppError::Validation(format!(
            "Invalid handle {:?}, expected user@host",
            handle
        ))),
    }
}

/// Generate WebFinger response for a local actor.
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_id: &str,
    profile_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![profile_url.to_string(), actor_id.to_string()]),
        links: vec![
            WebFingerLink {
                rel: PROFILE_PAGE_REL.to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(profile_url.to_string()),
            },
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_id.to_string()),
            },
        ],
    }
}

/// Outbound discovery and inbound answers
pub struct WebFingerResolver {
    db: Arc<Database>,
    client: Arc<FederationClient>,
    server: ServerConfig,
    remote_scheme: String,
}

impl WebFingerResolver {
    pub fn new(
        db: Arc<Database>,
        client: Arc<FederationClient>,
        server: ServerConfig,
        remote_scheme: String,
    ) -> Self {
        Self {
            db,
            client,
            server,
            remote_scheme,
        }
    }

    /// Resolve `username@host` to an actor identifier
    ///
    /// Records a `WebfingerRecord` so an actor persisted later can be linked
    /// back to this handle.
    ///
    /// # Errors
    /// - `NotFound` if the host does not know the user or exposes no actor link
    /// - `Transport` if the request fails or the response is unreadable
    pub async fn discover(&self, host: &str, username: &str) -> Result<WebFingerResult, AppError> {
        let resource = format!("acct:{}@{}", username, host);
        let url = format!(
            "{}://{}/.well-known/webfinger?resource={}",
            self.remote_scheme,
            host,
            urlencoding::encode(&resource)
        );

        let document = self.client.get_jrd(&url).await?;
        let jrd: WebFingerResponse = serde_json::from_value(document).map_err(|e| {
            AppError::Transport(format!("Invalid WebFinger response from {}: {}", host, e))
        })?;

        let actor_id = jrd
            .actor_link()
            .ok_or_else(|| {
                AppError::NotFound(format!("No ActivityPub actor link for {}", resource))
            })?
            .to_string();

        // Prefer the subject the host reports; it may canonicalize the handle.
        let (username, host) = parse_handle(&jrd.subject)
            .unwrap_or_else(|_| (username.to_string(), host.to_ascii_lowercase()));

        self.db
            .upsert_webfinger_record(&WebfingerRecord {
                actor_id: actor_id.clone(),
                username: username.clone(),
                host: host.clone(),
                created_at: Utc::now(),
            })
            .await?;

        tracing::debug!(
            actor_id = %actor_id,
            handle = %format!("{}@{}", username, host),
            "WebFinger resolved"
        );

        Ok(WebFingerResult {
            actor_id,
            username,
            host,
        })
    }

    /// Answer a discovery query for a local actor
    ///
    /// # Errors
    /// `NotFound` if the host is not ours or the user does not exist.
    pub async fn answer(
        &self,
        username: &str,
        requested_host: &str,
    ) -> Result<WebFingerResponse, AppError> {
        if !requested_host.eq_ignore_ascii_case(&self.server.domain) {
            return Err(AppError::NotFound(format!(
                "Host {} does not match this node",
                requested_host
            )));
        }

        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No local actor named {}", username)))?;

        Ok(generate_webfinger_response(
            username,
            &self.server.domain,
            &actor.id,
            &self.server.profile_url(username),
        ))
    }
}
