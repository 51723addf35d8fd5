//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::generate_webfinger_response;

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

/// Split `acct:name@domain` (the `acct:` prefix is optional)
fn parse_acct(resource: &str) -> Result<(&str, &str), AppError> {
    let acct = resource.strip_prefix("acct:").unwrap_or(resource);
    let acct = acct.strip_prefix('@').unwrap_or(acct);
    match acct.split_once('@') {
        Some((name, domain)) if !name.is_empty() && !domain.contains('@') => Ok((name, domain)),
        _ => Err(AppError::Validation("Invalid acct format".to_string())),
    }
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local groups.
///
/// Query: ?resource=acct:group@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let (name, domain) = parse_acct(&query.resource)?;

    // Verify domain matches local domain
    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let group = state.db.get_group(name).await?.ok_or(AppError::NotFound)?;
    let jrd = generate_webfinger_response(&group.name, &state.config);

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        Json(jrd),
    )
        .into_response())
}
