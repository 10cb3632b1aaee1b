//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers/Following collections

use axum::body::Bytes;
use axum::extract::{OriginalUri, Query};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::data::Actor;
use crate::error::AppError;
use crate::federation::{ACTIVITY_JSON, builder, person_document};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

/// Collection page size
pub const PAGE_SIZE: i64 = 20;

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

fn activity_json(document: Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], document.to_string()).into_response()
}

async fn local_actor(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .db
        .get_local_actor(username)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No local actor named {}", username)))
}

/// GET /users/:username
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/users/:username"])
        .start_timer();

    let actor = local_actor(&state, &username).await?;
    let document = person_document(&actor, &state.config.server.profile_url(&username));

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/users/:username", "200"])
        .inc();

    Ok(activity_json(document))
}

/// POST /users/:username/inbox
///
/// # Steps
/// 1. Reject unknown local users
/// 2. Verify HTTP Signature (before the body is parsed)
/// 3. Decode and dispatch
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/users/:username/inbox"])
        .start_timer();

    local_actor(&state, &username).await?;
    let path = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());

    let status = receive(&state, method.as_str(), path, &headers, &body).await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/users/:username/inbox", "202"])
        .inc();
    Ok(status)
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/inbox"])
        .start_timer();

    let path = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());

    let status = receive(&state, method.as_str(), path, &headers, &body).await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/inbox", "202"])
        .inc();
    Ok(status)
}

/// Shared inbound pipeline: verify, parse, dispatch
async fn receive(
    state: &AppState,
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let signer = match state.verifier.verify(method, path, headers, body).await {
        Ok(signer) => signer,
        Err(e) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "unauthorized"])
                .inc();
            return Err(e);
        }
    };

    let activity: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;

    match state.dispatcher.dispatch(activity, &signer).await {
        Ok(()) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "accepted"])
                .inc();
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", e.kind().as_str()])
                .inc();
            Err(e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
}

/// Render an `OrderedCollection`, or one of its pages when `page` is set
fn collection(collection_id: &str, total: i64, page: Option<u32>, items: Vec<String>) -> Value {
    let Some(page) = page else {
        return serde_json::json!({
            "@context": builder::ACTIVITY_STREAMS,
            "type": "OrderedCollection",
            "id": collection_id,
            "totalItems": total,
            "first": format!("{}?page=1", collection_id),
        });
    };

    let page = i64::from(page);
    let mut document = serde_json::json!({
        "@context": builder::ACTIVITY_STREAMS,
        "type": "OrderedCollectionPage",
        "id": format!("{}?page={}", collection_id, page),
        "partOf": collection_id,
        "totalItems": total,
        "orderedItems": items,
    });
    if page * PAGE_SIZE < total {
        document["next"] = Value::String(format!("{}?page={}", collection_id, page + 1));
    }
    if page > 1 {
        document["prev"] = Value::String(format!("{}?page={}", collection_id, page - 1));
    }
    document
}

fn page_offset(page: Option<u32>) -> Result<i64, AppError> {
    match page {
        None => Ok(0),
        Some(0) => Err(AppError::Validation("Pages are numbered from 1".to_string())),
        Some(page) => Ok((i64::from(page) - 1) * PAGE_SIZE),
    }
}

/// GET /users/:username/outbox
///
/// Local actors do not author posts, so this is always empty.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    page_offset(query.page)?;

    let outbox_id = actor.outbox.unwrap_or_else(|| format!("{}/outbox", actor.id));
    Ok(activity_json(collection(&outbox_id, 0, query.page, Vec::new())))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let offset = page_offset(query.page)?;

    let total = state.db.count_followers(&actor.id).await?;
    let items = match query.page {
        Some(_) => state.db.get_followers(&actor.id, PAGE_SIZE, offset).await?,
        None => Vec::new(),
    };

    let followers_id = actor
        .followers
        .unwrap_or_else(|| format!("{}/followers", actor.id));
    Ok(activity_json(collection(&followers_id, total, query.page, items)))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let offset = page_offset(query.page)?;

    let total = state.db.count_following(&actor.id).await?;
    let items = match query.page {
        Some(_) => state.db.get_following(&actor.id, PAGE_SIZE, offset).await?,
        None => Vec::new(),
    };

    let following_id = actor
        .following
        .unwrap_or_else(|| format!("{}/following", actor.id));
    Ok(activity_json(collection(&following_id, total, query.page, items)))
}
