//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::parse_handle;

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let Some(acct) = query.resource.strip_prefix("acct:") else {
        return Err(AppError::Validation(
            "Resource must start with 'acct:'".to_string(),
        ));
    };

    let (username, host) = parse_handle(acct)?;
    let jrd = state.webfinger.answer(&username, &host).await?;

    let body = serde_json::to_string(&jrd)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode JRD: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], body).into_response())
}
