//! ActivityPub endpoints
//!
//! - Group actor documents
//! - Inboxes (shared and per group)
//! - Outbox and followers collections
//! - Group-authored notes

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::AppState;
use crate::data::Group;
use crate::error::AppError;
use crate::federation::{ACTIVITY_CONTENT_TYPE, PUBLIC_COLLECTION, RequestParts};
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Number of boosts shown in a group outbox
const OUTBOX_LIMIT: i64 = 20;

/// Create ActivityPub router
///
/// Routes:
/// - GET /group/:name - Group actor
/// - POST /group/:name/inbox - Group inbox
/// - POST /inbox - Shared inbox
/// - GET /group/:name/outbox - Recent boosts
/// - GET /group/:name/followers - Members collection
/// - GET /note/:id - Note posted by a group
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/group/:name", get(actor))
        .route("/group/:name/inbox", post(group_inbox))
        .route("/inbox", post(shared_inbox))
        .route("/group/:name/outbox", get(outbox))
        .route("/group/:name/followers", get(followers))
        .route("/note/:id", get(note))
}

fn activity_json(value: Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)], Json(value)).into_response()
}

async fn require_group(state: &AppState, name: &str) -> Result<Group, AppError> {
    state.db.get_group(name).await?.ok_or(AppError::NotFound)
}

/// GET /group/:name
///
/// Returns the ActivityPub Group actor document.
async fn actor(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, AppError> {
    let group = require_group(&state, &name).await?;
    let server = &state.config.server;
    let actor_url = server.group_url(&group.name);

    let mut document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Group",
        "id": actor_url,
        "preferredUsername": group.name,
        "name": group.display_name,
        "summary": group.summary,
        "inbox": server.group_inbox_url(&group.name),
        "outbox": server.group_outbox_url(&group.name),
        "followers": server.group_followers_url(&group.name),
        "url": actor_url,
        "discoverable": group.discoverable,
        "manuallyApprovesFollowers": false,
        "endpoints": {
            "sharedInbox": server.shared_inbox_url()
        },
        "publicKey": {
            "id": server.group_key_id(&group.name),
            "owner": actor_url,
            "publicKeyPem": group.public_key_pem
        }
    });
    if let Some(icon_url) = &group.icon_url {
        document["icon"] = json!({"type": "Image", "url": icon_url});
    }

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/group/:name", "200"])
        .inc();
    Ok(activity_json(document))
}

/// Run the inbox state machine over the live request
async fn receive(
    state: &AppState,
    uri: &OriginalUri,
    headers: &HeaderMap,
    body: &Bytes,
    inbox_group: Option<&str>,
    endpoint: &'static str,
) -> Result<Response, AppError> {
    let path = uri
        .0
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.0.path());
    let request = RequestParts {
        method: Method::POST.as_str(),
        path,
        headers,
        body,
        body_digest: None,
    };

    let result = state.inbox.handle_inbound(&request, inbox_group).await;
    let status = match &result {
        Ok(_) => StatusCode::ACCEPTED,
        Err(e) => e.status_code(),
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, status.as_str()])
        .inc();

    result?;
    Ok((StatusCode::ACCEPTED, "ok").into_response())
}

/// POST /group/:name/inbox
///
/// Receives activities addressed to one group.
async fn group_inbox(
    State(state): State<AppState>,
    Path(name): Path<String>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let group = require_group(&state, &name).await?;
    receive(&state, &uri, &headers, &body, Some(&group.name), "/group/:name/inbox").await
}

/// POST /inbox
///
/// Shared inbox for every group on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    receive(&state, &uri, &headers, &body, None, "/inbox").await
}

/// GET /group/:name/outbox
///
/// Returns the group's most recent boosts as Announce activities.
async fn outbox(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, AppError> {
    let group = require_group(&state, &name).await?;
    let server = &state.config.server;
    let actor_url = server.group_url(&group.name);
    let followers_url = server.group_followers_url(&group.name);

    let total = state.db.count_boosts(&group.id).await?;
    let items: Vec<Value> = state
        .db
        .list_boosts(&group.id, OUTBOX_LIMIT)
        .await?
        .into_iter()
        .map(|boost| {
            json!({
                "type": "Announce",
                "id": format!("{}/boost/{}", actor_url, boost.id),
                "actor": actor_url,
                "object": boost.note_id,
                "published": boost.created_at.to_rfc3339(),
                "to": [PUBLIC_COLLECTION],
                "cc": [followers_url]
            })
        })
        .collect();

    Ok(activity_json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": server.group_outbox_url(&group.name),
        "totalItems": total,
        "orderedItems": items
    })))
}

/// GET /group/:name/followers
///
/// Returns the members collection.
async fn followers(State(state): State<AppState>, Path(name): Path<String>) -> Result<Response, AppError> {
    let group = require_group(&state, &name).await?;
    let members = state.db.get_members(&group.id).await?;
    let items: Vec<&str> = members
        .iter()
        .filter_map(|member| member.actor_url.as_deref())
        .collect();

    Ok(activity_json(json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": state.config.server.group_followers_url(&group.name),
        "totalItems": members.len(),
        "orderedItems": items
    })))
}

/// GET /note/:id
///
/// Returns a note posted by a group, so that remote servers can dereference it.
async fn note(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    let note = state.db.get_note(&id).await?.ok_or(AppError::NotFound)?;
    let author = state
        .db
        .get_actor(&note.actor_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let recipients = state.db.get_note_recipients(&note.id).await?;

    let (to, cc): (Vec<_>, Vec<_>) = recipients
        .iter()
        .partition(|recipient| recipient.recipient_type == "to");
    let to: Vec<&str> = to.iter().map(|r| r.url.as_str()).collect();
    let cc: Vec<&str> = cc.iter().map(|r| r.url.as_str()).collect();

    let attributed_to = author
        .actor_url
        .unwrap_or_else(|| format!("acct:{}", author.handle));
    let mut object = crate::federation::builder::note(
        &format!("{}/note/{}", state.config.server.base_url(), note.id),
        &attributed_to,
        &note.content,
        to,
        cc,
        note.created_at,
    );
    object["@context"] = json!("https://www.w3.org/ns/activitystreams");
    if !note.source.is_empty() {
        object["source"] = json!({"content": note.source, "mediaType": "text/plain"});
    }

    Ok(activity_json(object))
}
