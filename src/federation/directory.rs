//! Actor directory
//!
//! Resolves actor identifiers local-store-first, with at most one remote
//! fetch on a miss. Resolution never writes; callers that want a fetched
//! actor kept call [`ActorDirectory::persist`] or
//! [`ActorDirectory::resolve_and_persist`].

use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::client::FederationClient;
use super::delivery::builder::{ACTIVITY_STREAMS, SECURITY_V1};
use super::signature::{generate_keypair, host_header_value};
use super::types::IdRef;
use crate::config::ServerConfig;
use crate::data::{Actor, ActorKind, Database, NewLocalCredentials, PublicKey};
use crate::error::AppError;

const DEFAULT_SUMMARY: &str = "It's just me right now.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteActorDocument {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    preferred_username: Option<String>,
    name: Option<String>,
    summary: Option<String>,
    inbox: String,
    outbox: Option<IdRef>,
    followers: Option<IdRef>,
    following: Option<IdRef>,
    endpoints: Option<Endpoints>,
    icon: Option<Value>,
    public_key: Option<PublicKeyDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Endpoints {
    shared_inbox: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyDocument {
    id: String,
    owner: Option<String>,
    public_key_pem: String,
}

/// A key belongs to the actor whose identifier prefixes it (`{id}#main-key`)
fn key_belongs_to(key_id: &str, actor_id: &str) -> bool {
    match key_id.strip_prefix(actor_id) {
        Some(rest) => rest.is_empty() || rest.starts_with('#') || rest.starts_with('/'),
        None => false,
    }
}

/// `(url, mediaType)` of an `icon`, which may be an IRI, an Image or a list of Images
fn extract_icon(icon: &Value) -> (Option<String>, Option<String>) {
    match icon {
        Value::String(url) => (Some(url.clone()), None),
        Value::Object(image) => (
            image.get("url").and_then(Value::as_str).map(str::to_string),
            image
                .get("mediaType")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
        Value::Array(images) => images.first().map(extract_icon).unwrap_or((None, None)),
        _ => (None, None),
    }
}

/// Parse a remote actor document into an (unpersisted) `Actor`
///
/// # Errors
/// - `Validation` if the document is not a `Person`
/// - `Transport` if required fields are missing or malformed
pub fn parse_actor_document(document: Value) -> Result<Actor, AppError> {
    let doc: RemoteActorDocument = serde_json::from_value(document)
        .map_err(|e| AppError::Transport(format!("Couldn't parse actor: {}", e)))?;

    if doc.kind != "Person" {
        return Err(AppError::Validation(format!(
            "Unsupported actor type: {}",
            doc.kind
        )));
    }

    let public_key = doc
        .public_key
        .ok_or_else(|| AppError::Transport(format!("Actor {} has no public key", doc.id)))?;
    if public_key.owner.as_deref().is_some_and(|owner| owner != doc.id)
        || !key_belongs_to(&public_key.id, &doc.id)
    {
        return Err(AppError::Validation(format!(
            "Key {} is not owned by actor {}",
            public_key.id, doc.id
        )));
    }

    let url = url::Url::parse(&doc.id)
        .map_err(|e| AppError::Transport(format!("Invalid actor id {}: {}", doc.id, e)))?;
    let host = host_header_value(&url)
        .ok_or_else(|| AppError::Transport(format!("Actor id {} has no host", doc.id)))?;

    let username = match doc.preferred_username {
        Some(username) => username,
        None => url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| AppError::Transport(format!("Actor {} has no username", doc.id)))?,
    };

    let (avatar_url, avatar_type) = doc.icon.as_ref().map(extract_icon).unwrap_or((None, None));

    Ok(Actor {
        row_id: None,
        id: doc.id,
        kind: ActorKind::Remote,
        username,
        display_name: doc.name,
        summary: doc.summary,
        inbox: doc.inbox,
        outbox: doc.outbox.map(|r| r.id().to_string()),
        followers: doc.followers.map(|r| r.id().to_string()),
        following: doc.following.map(|r| r.id().to_string()),
        shared_inbox: doc.endpoints.and_then(|e| e.shared_inbox),
        avatar_url,
        avatar_type,
        public_key: PublicKey {
            id: public_key.id,
            pem: public_key.public_key_pem,
        },
        host,
        discovered_at: Utc::now(),
    })
}

/// Render a local actor as an ActivityPub `Person`
pub fn person_document(actor: &Actor, profile_url: &str) -> Value {
    let mut document = serde_json::json!({
        "@context": [ACTIVITY_STREAMS, SECURITY_V1],
        "id": actor.id,
        "type": "Person",
        "preferredUsername": actor.username,
        "name": actor.display_name.as_deref().unwrap_or(&actor.username),
        "summary": actor.summary.as_deref().unwrap_or_default(),
        "url": profile_url,
        "inbox": actor.inbox,
        "outbox": actor.outbox,
        "followers": actor.followers,
        "following": actor.following,
        "publicKey": {
            "id": actor.public_key.id,
            "owner": actor.id,
            "publicKeyPem": actor.public_key.pem
        }
    });

    if let Some(shared_inbox) = &actor.shared_inbox {
        document["endpoints"] = serde_json::json!({ "sharedInbox": shared_inbox });
    }
    if let Some(avatar_url) = &actor.avatar_url {
        document["icon"] = serde_json::json!({
            "type": "Image",
            "mediaType": actor.avatar_type,
            "url": avatar_url
        });
    }

    document
}

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty()
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(format!(
            "Invalid username {:?}: use letters, digits and underscores",
            username
        )));
    }
    Ok(())
}

fn hash_password(password: &str) -> Result<String, AppError> {
    if password.is_empty() {
        return Err(AppError::Validation("Password must not be empty".to_string()));
    }

    let salt = SaltString::generate(argon2::password_hash::rand_core::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to hash password: {}", e)))
}

/// Actor lookup and persistence
pub struct ActorDirectory {
    db: Arc<Database>,
    client: Arc<FederationClient>,
    server: ServerConfig,
    key_bits: usize,
}

impl ActorDirectory {
    pub fn new(
        db: Arc<Database>,
        client: Arc<FederationClient>,
        server: ServerConfig,
        key_bits: usize,
    ) -> Self {
        Self {
            db,
            client,
            server,
            key_bits,
        }
    }

    /// Resolve an actor, local store first, then one remote fetch
    ///
    /// A fetched actor is returned with `row_id: None` and is not persisted.
    ///
    /// # Errors
    /// - `NotFound` if neither the store nor the remote host knows the actor
    /// - `Transport` if the fetch fails
    pub async fn resolve(&self, actor_id: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_actor(actor_id).await? {
            return Ok(actor);
        }

        self.fetch_remote(actor_id).await
    }

    /// Fetch and parse a remote actor document without touching the store
    pub async fn fetch_remote(&self, actor_id: &str) -> Result<Actor, AppError> {
        let document = self.client.get_activity_json(actor_id).await?;
        let actor = parse_actor_document(document)?;

        if actor.id != actor_id {
            return Err(AppError::Transport(format!(
                "Actor document at {} claims id {}",
                actor_id, actor.id
            )));
        }

        tracing::debug!(actor_id = %actor.id, "Fetched remote actor");
        Ok(actor)
    }

    /// Persist a remote actor and its public key
    ///
    /// # Errors
    /// `Conflict` if the actor is already stored.
    pub async fn persist(&self, actor: &Actor) -> Result<i64, AppError> {
        if actor.is_local() {
            return Err(AppError::Validation(
                "Local actors are created by provisioning".to_string(),
            ));
        }

        let row_id = self.db.insert_actor(actor).await?;
        tracing::info!(actor_id = %actor.id, row_id, "Persisted remote actor");
        Ok(row_id)
    }

    /// Resolve an actor and make sure it is stored
    pub async fn resolve_and_persist(&self, actor_id: &str) -> Result<Actor, AppError> {
        let actor = self.resolve(actor_id).await?;
        if actor.row_id.is_some() {
            return Ok(actor);
        }

        match self.persist(&actor).await {
            Ok(_) => {}
            // Another request stored it first.
            Err(AppError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }

        self.db
            .get_actor(actor_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Actor {} vanished after persist", actor_id)))
    }

    /// Provision a local actor with a fresh keypair
    ///
    /// # Errors
    /// - `Validation` for a bad username or empty password
    /// - `Conflict` if the username is taken
    pub async fn provision_local(
        &self,
        username: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Result<Actor, AppError> {
        validate_username(username)?;
        let password_hash = hash_password(password)?;
        let keys = generate_keypair(self.key_bits)?;

        let actor_id = self.server.actor_id(username);
        let actor = Actor {
            row_id: None,
            id: actor_id.clone(),
            kind: ActorKind::Local,
            username: username.to_string(),
            display_name: Some(display_name.unwrap_or(username).to_string()),
            summary: Some(DEFAULT_SUMMARY.to_string()),
            inbox: format!("{}/inbox", actor_id),
            outbox: Some(format!("{}/outbox", actor_id)),
            followers: Some(format!("{}/followers", actor_id)),
            following: Some(format!("{}/following", actor_id)),
            shared_inbox: Some(self.server.shared_inbox()),
            avatar_url: None,
            avatar_type: None,
            public_key: PublicKey {
                id: format!("{}#main-key", actor_id),
                pem: keys.public_key_pem,
            },
            host: self.server.domain.clone(),
            discovered_at: Utc::now(),
        };

        let credentials = NewLocalCredentials {
            username: username.to_string(),
            password_hash,
            private_key_pem: keys.private_key_pem,
        };

        let row_id = self.db.create_local_actor(&actor, &credentials).await?;
        tracing::info!(actor_id = %actor.id, "Provisioned local actor");

        Ok(Actor {
            row_id: Some(row_id),
            ..actor
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bob_document() -> Value {
        serde_json::json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": "https://remote.example/users/bob",
            "type": "Person",
            "preferredUsername": "bob",
            "name": "Bob",
            "inbox": "https://remote.example/users/bob/inbox",
            "outbox": "https://remote.example/users/bob/outbox",
            "followers": "https://remote.example/users/bob/followers",
            "endpoints": {"sharedInbox": "https://remote.example/inbox"},
            "icon": [{"type": "Image", "mediaType": "image/png", "url": "https://remote.example/bob.png"}],
            "publicKey": {
                "id": "https://remote.example/users/bob#main-key",
                "owner": "https://remote.example/users/bob",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nMIIB\n-----END PUBLIC KEY-----\n"
            }
        })
    }

    fn bob_document_at(id: &str) -> Value {
        let mut document = bob_document();
        document["id"] = serde_json::json!(id);
        document["publicKey"]["id"] = serde_json::json!(format!("{}#main-key", id));
        document["publicKey"]["owner"] = serde_json::json!(id);
        document
    }

    fn server() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "read.example".to_string(),
            protocol: "https".to_string(),
        }
    }

    async fn directory() -> (ActorDirectory, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("test.db")).await.unwrap());
        let client = FederationClient::new("rustread-test", Duration::from_secs(1)).unwrap();
        let directory = ActorDirectory::new(db.clone(), Arc::new(client), server(), 1024);
        (directory, db, temp_dir)
    }

    #[test]
    fn parses_person_document() {
        let actor = parse_actor_document(bob_document()).unwrap();

        assert_eq!(actor.row_id, None);
        assert_eq!(actor.kind, ActorKind::Remote);
        assert_eq!(actor.username, "bob");
        assert_eq!(actor.host, "remote.example");
        assert_eq!(actor.shared_inbox.as_deref(), Some("https://remote.example/inbox"));
        assert_eq!(actor.avatar_url.as_deref(), Some("https://remote.example/bob.png"));
        assert_eq!(actor.avatar_type.as_deref(), Some("image/png"));
        assert_eq!(actor.public_key.id, "https://remote.example/users/bob#main-key");
    }

    #[test]
    fn rejects_non_person_actor() {
        let mut document = bob_document();
        document["type"] = serde_json::json!("Group");

        assert!(matches!(
            parse_actor_document(document),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn rejects_actor_without_key() {
        let mut document = bob_document();
        document.as_object_mut().unwrap().remove("publicKey");

        assert!(matches!(
            parse_actor_document(document),
            Err(AppError::Transport(_))
        ));
    }

    #[test]
    fn rejects_key_owned_by_another_actor() {
        let mut document = bob_document();
        document["publicKey"]["owner"] = serde_json::json!("https://remote.example/users/carol");
        assert!(matches!(
            parse_actor_document(document),
            Err(AppError::Validation(_))
        ));

        let mut document = bob_document();
        document["publicKey"]["id"] =
            serde_json::json!("https://remote.example/users/carol#main-key");
        document["publicKey"]["owner"] = serde_json::json!("https://remote.example/users/bob");
        assert!(matches!(
            parse_actor_document(document),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn key_id_must_extend_actor_id() {
        let bob = "https://remote.example/users/bob";
        assert!(key_belongs_to("https://remote.example/users/bob#main-key", bob));
        assert!(key_belongs_to("https://remote.example/users/bob/main-key", bob));
        assert!(!key_belongs_to("https://remote.example/users/bobby#main-key", bob));
        assert!(!key_belongs_to("https://remote.example/users/carol#main-key", bob));
    }

    #[test]
    fn host_includes_explicit_port() {
        let document = bob_document_at("http://127.0.0.1:4000/users/bob");

        let actor = parse_actor_document(document).unwrap();
        assert_eq!(actor.host, "127.0.0.1:4000");
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("alice_01").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username("alice@x").is_err());
    }

    #[tokio::test]
    async fn resolve_prefers_store_without_network() {
        let (directory, _db, _temp_dir) = directory().await;
        // Unroutable: any network attempt would fail the test.
        let document = bob_document_at("http://bob.invalid/users/bob");
        let actor = parse_actor_document(document).unwrap();
        directory.persist(&actor).await.unwrap();

        let resolved = directory.resolve("http://bob.invalid/users/bob").await.unwrap();
        assert!(resolved.row_id.is_some());
        assert_eq!(resolved.username, "bob");
    }

    #[tokio::test]
    async fn resolve_miss_reports_transport_failure() {
        let (directory, db, _temp_dir) = directory().await;

        let result = directory.resolve("http://127.0.0.1:1/users/nobody").await;
        assert!(matches!(result, Err(AppError::Transport(_))));
        assert!(db.get_actor("http://127.0.0.1:1/users/nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persist_twice_is_conflict() {
        let (directory, _db, _temp_dir) = directory().await;
        let actor = parse_actor_document(bob_document()).unwrap();

        directory.persist(&actor).await.unwrap();
        assert!(matches!(
            directory.persist(&actor).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn provision_local_builds_urls_and_key() {
        let (directory, db, _temp_dir) = directory().await;

        let alice = directory.provision_local("alice", "hunter2", None).await.unwrap();

        assert_eq!(alice.id, "https://read.example/users/alice");
        assert_eq!(alice.inbox, "https://read.example/users/alice/inbox");
        assert_eq!(alice.shared_inbox.as_deref(), Some("https://read.example/inbox"));
        assert_eq!(alice.public_key.id, "https://read.example/users/alice#main-key");
        assert!(alice.is_local());

        let key = db.load_signing_key(&alice.id).await.unwrap().unwrap();
        assert_eq!(key.key_id(), "https://read.example/users/alice#main-key");
    }

    #[tokio::test]
    async fn provision_local_rejects_duplicate_username() {
        let (directory, _db, _temp_dir) = directory().await;

        directory.provision_local("alice", "pw", None).await.unwrap();
        let result = directory.provision_local("alice", "pw", None).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[test]
    fn person_document_publishes_key_and_endpoints() {
        let mut actor = parse_actor_document(bob_document()).unwrap();
        actor.kind = ActorKind::Local;

        let document = person_document(&actor, "https://remote.example/@bob");
        assert_eq!(document["type"], "Person");
        assert_eq!(document["publicKey"]["owner"], "https://remote.example/users/bob");
        assert_eq!(document["endpoints"]["sharedInbox"], "https://remote.example/inbox");
        assert_eq!(document["url"], "https://remote.example/@bob");
    }
}
