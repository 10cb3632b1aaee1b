//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use rustread::federation::{SigningKey, generate_keypair, sign_request};
use rustread::{AppState, config};
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Settle delay used by test servers
pub const SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub domain: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Boot the full router on a random port with a provisioned "alice"
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so the public domain carries the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let domain = addr.to_string();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: domain.clone(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            instance: config::InstanceConfig {
                name: "Test Node".to_string(),
            },
            federation: config::FederationConfig {
                settle_delay_ms: SETTLE_DELAY.as_millis() as u64,
                request_timeout_secs: 5,
                queue_capacity: 64,
                max_concurrent_tasks: 8,
                key_bits: 1024,
                remote_scheme: "http".to_string(),
                signature_max_age_secs: 300,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        rustread::metrics::init_metrics();
        let state = AppState::new(config).await.unwrap();
        state
            .directory
            .provision_local("alice", "correct horse", Some("Alice"))
            .await
            .unwrap();

        let app = rustread::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", domain),
            domain,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get URL for a path on this server
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn alice_id(&self) -> String {
        self.url("/users/alice")
    }

    pub fn alice_inbox(&self) -> String {
        self.url("/users/alice/inbox")
    }

    /// Wait for detached tasks to finish
    pub async fn settle(&self) {
        assert!(
            self.state.tasks.wait_idle(Duration::from_secs(10)).await,
            "detached tasks did not finish"
        );
    }
}

/// A delivery received by a `RemotePeer` inbox
#[derive(Debug, Clone)]
pub struct ReceivedDelivery {
    pub headers: HeaderMap,
    pub raw: Vec<u8>,
    pub body: Value,
}

struct PeerState {
    base: String,
    domain: String,
    public_key_pem: String,
    outbox: Mutex<Vec<Value>>,
    received: Mutex<Vec<ReceivedDelivery>>,
}

/// A simulated remote node hosting one actor, "bob"
pub struct RemotePeer {
    pub base: String,
    pub domain: String,
    key: SigningKey,
    state: Arc<PeerState>,
    client: reqwest::Client,
}

impl RemotePeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let domain = listener.local_addr().unwrap().to_string();
        let base = format!("http://{}", domain);

        let pair = generate_keypair(1024).unwrap();
        let key = SigningKey::from_pkcs8_pem(
            format!("{}/users/bob#main-key", base),
            &pair.private_key_pem,
        )
        .unwrap();

        let state = Arc::new(PeerState {
            base: base.clone(),
            domain: domain.clone(),
            public_key_pem: pair.public_key_pem,
            outbox: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/.well-known/webfinger", get(peer_webfinger))
            .route("/users/bob", get(peer_actor))
            .route("/users/bob/outbox", get(peer_outbox))
            .route("/users/bob/inbox", post(peer_inbox))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            domain,
            key,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub fn actor_id(&self) -> String {
        format!("{}/users/bob", self.base)
    }

    pub fn inbox(&self) -> String {
        format!("{}/users/bob/inbox", self.base)
    }

    pub fn handle(&self) -> String {
        format!("bob@{}", self.domain)
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    pub fn public_key_pem(&self) -> String {
        self.state.public_key_pem.clone()
    }

    /// Publish an activity, oldest first; the outbox serves newest first
    pub fn publish(&self, activity: Value) {
        self.state.outbox.lock().unwrap().push(activity);
    }

    /// A Create of a Note authored by bob
    pub fn create_note(&self, n: usize, content: &str) -> Value {
        json!({
            "type": "Create",
            "id": format!("{}/users/bob/statuses/{}/activity", self.base, n),
            "actor": self.actor_id(),
            "object": {
                "type": "Note",
                "id": format!("{}/users/bob/statuses/{}", self.base, n),
                "published": format!("2026-01-0{}T00:00:00Z", n),
                "url": format!("{}/@bob/{}", self.base, n),
                "content": content,
                "attributedTo": self.actor_id()
            }
        })
    }

    pub fn received(&self) -> Vec<ReceivedDelivery> {
        self.state.received.lock().unwrap().clone()
    }

    /// Wait until the inbox has recorded `count` deliveries
    pub async fn wait_for_deliveries(&self, count: usize) -> Vec<ReceivedDelivery> {
        for _ in 0..500 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} deliveries, got {}", count, self.received().len());
    }

    /// POST an activity signed by bob
    pub async fn send(&self, url: &str, activity: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let signed = sign_request("POST", url, &body, &self.key).unwrap();

        self.client
            .post(url)
            .header("Content-Type", "application/activity+json")
            .header("Date", signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// POST with explicit headers, for malformed-request tests
    pub async fn send_raw(
        &self,
        url: &str,
        body: Vec<u8>,
        headers: &[(&str, String)],
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/activity+json");
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        request.body(body).send().await.unwrap()
    }
}

#[derive(Deserialize)]
struct ResourceQuery {
    resource: String,
}

async fn peer_webfinger(
    State(state): State<Arc<PeerState>>,
    Query(query): Query<ResourceQuery>,
) -> Result<Json<Value>, StatusCode> {
    let expected = format!("acct:bob@{}", state.domain);
    if query.resource != expected {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(json!({
        "subject": expected,
        "links": [
            {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": format!("{}/@bob", state.base)},
            {"rel": "self", "type": "application/activity+json", "href": format!("{}/users/bob", state.base)}
        ]
    })))
}

async fn peer_actor(State(state): State<Arc<PeerState>>) -> Json<Value> {
    let id = format!("{}/users/bob", state.base);
    Json(json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": "bob",
        "name": "Bob",
        "inbox": format!("{}/inbox", id),
        "outbox": format!("{}/outbox", id),
        "followers": format!("{}/followers", id),
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": state.public_key_pem
        }
    }))
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

async fn peer_outbox(
    State(state): State<Arc<PeerState>>,
    Query(query): Query<PageQuery>,
) -> Json<Value> {
    let outbox_id = format!("{}/users/bob/outbox", state.base);
    let items: Vec<Value> = state.outbox.lock().unwrap().iter().rev().cloned().collect();

    match query.page {
        None => Json(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": outbox_id,
            "type": "OrderedCollection",
            "totalItems": items.len(),
            "first": format!("{}?page=1", outbox_id)
        })),
        Some(_) => Json(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}?page=1", outbox_id),
            "type": "OrderedCollectionPage",
            "partOf": outbox_id,
            "orderedItems": items
        })),
    }
}

async fn peer_inbox(
    State(state): State<Arc<PeerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let parsed = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.received.lock().unwrap().push(ReceivedDelivery {
        headers,
        raw: body.to_vec(),
        body: parsed,
    });
    StatusCode::ACCEPTED
}
