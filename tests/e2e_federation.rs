//! E2E tests for group federation
//!
//! A fake remote instance follows a group, posts to it and leaves again,
//! all over real HTTP with real signatures.

mod common;

use common::{FakeInstance, TestServer};
use fedigroup::federation::{PUBLIC_COLLECTION, RequestParts, verify_signature};
use serde_json::{Value, json};

fn follow(remote: &FakeInstance, actor: &str, group_url: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": remote.url("/activities/follow-1"),
        "type": "Follow",
        "actor": actor,
        "object": group_url
    })
}

fn create_note(remote: &FakeInstance, actor: &str, note_path: &str, group_url: &str) -> Value {
    let note_id = remote.url(note_path);
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{note_id}/activity"),
        "type": "Create",
        "actor": actor,
        "object": {
            "id": note_id,
            "type": "Note",
            "attributedTo": actor,
            "content": "<p>Hello cats</p>",
            "published": "2026-01-01T12:00:00Z",
            "to": [PUBLIC_COLLECTION],
            "cc": [group_url]
        }
    })
}

async fn join_group(server: &TestServer, remote: &FakeInstance, actor: &str, group_url: &str) {
    let response = server
        .post_signed("/group/cats/inbox", actor, &follow(remote, actor, group_url))
        .await;
    assert_eq!(response.status(), 202);
    server.settle().await;
}

async fn is_member(server: &TestServer, remote: &FakeInstance, name: &str) -> bool {
    let group = server.state.db.get_group("cats").await.unwrap().unwrap();
    let handle = format!("{name}@{}", remote.authority);
    match server.state.db.get_actor_by_handle(&handle).await.unwrap() {
        Some(actor) => server.state.db.is_member(&group.id, &actor.id).await.unwrap(),
        None => false,
    }
}

#[tokio::test]
async fn test_follow_adds_member_and_sends_signed_accept() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    let group = server.create_group("cats").await;
    let group_url = server.url("/group/cats");
    let alice = remote.add_actor("alice");

    join_group(&server, &remote, &alice, &group_url).await;

    assert!(is_member(&server, &remote, "alice").await);

    let accepts = remote.posts_to("/users/alice/inbox");
    assert_eq!(accepts.len(), 1);
    let accept = accepts[0].json();
    assert_eq!(accept["type"], "Accept");
    assert_eq!(accept["actor"], group_url);
    assert_eq!(accept["object"]["type"], "Follow");
    assert_eq!(accept["object"]["actor"], alice);

    let request = RequestParts {
        method: "POST",
        path: "/users/alice/inbox",
        headers: &accepts[0].headers,
        body: &accepts[0].body,
        body_digest: None,
    };
    assert!(verify_signature(&group.public_key_pem, &request, 3600));
}

#[tokio::test]
async fn test_repeated_follow_keeps_one_membership() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    let group = server.create_group("cats").await;
    let group_url = server.url("/group/cats");
    let alice = remote.add_actor("alice");

    join_group(&server, &remote, &alice, &group_url).await;
    join_group(&server, &remote, &alice, &group_url).await;

    let members = server.state.db.get_members(&group.id).await.unwrap();
    assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn test_undo_follow_removes_member() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    server.create_group("cats").await;
    let group_url = server.url("/group/cats");
    let alice = remote.add_actor("alice");

    join_group(&server, &remote, &alice, &group_url).await;
    assert!(is_member(&server, &remote, "alice").await);

    let undo = json!({
        "id": remote.url("/activities/undo-1"),
        "type": "Undo",
        "actor": alice,
        "object": follow(&remote, &alice, &group_url)
    });
    let response = server.post_signed("/inbox", &alice, &undo).await;
    assert_eq!(response.status(), 202);

    assert!(!is_member(&server, &remote, "alice").await);
}

#[tokio::test]
async fn test_unsigned_activity_is_rejected() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    server.create_group("cats").await;
    let alice = remote.add_actor("alice");

    let response = server
        .client
        .post(&server.url("/group/cats/inbox"))
        .header("content-type", "application/activity+json")
        .body(follow(&remote, &alice, &server.url("/group/cats")).to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
    assert!(!is_member(&server, &remote, "alice").await);
}

#[tokio::test]
async fn test_unknown_group_inbox_returns_404() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    let alice = remote.add_actor("alice");

    let response = server
        .post_signed(
            "/group/nobody/inbox",
            &alice,
            &follow(&remote, &alice, &server.url("/group/nobody")),
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_member_post_is_boosted_to_members() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    let group = server.create_group("cats").await;
    let group_url = server.url("/group/cats");
    let alice = remote.add_actor("alice");
    join_group(&server, &remote, &alice, &group_url).await;

    let create = create_note(&remote, &alice, "/notes/1", &group_url);
    let response = server.post_signed("/inbox", &alice, &create).await;
    assert_eq!(response.status(), 202);
    server.settle().await;

    let note_id = remote.url("/notes/1");
    let boost = server
        .state
        .db
        .get_boost_by_note_id(&note_id)
        .await
        .unwrap()
        .expect("boost stored");
    assert_eq!(boost.group_id, group.id);

    // Members are reached through their shared inbox
    let announces = remote.posts_to("/inbox");
    assert_eq!(announces.len(), 1);
    let announce = announces[0].json();
    assert_eq!(announce["type"], "Announce");
    assert_eq!(announce["actor"], group_url);
    assert_eq!(announce["object"], note_id);

    // Delivering the same note again is a no-op
    let response = server.post_signed("/inbox", &alice, &create).await;
    assert_eq!(response.status(), 202);
    server.settle().await;
    assert_eq!(server.state.db.count_boosts(&group.id).await.unwrap(), 1);
    assert_eq!(remote.posts_to("/inbox").len(), 1);

    let outbox: Value = server
        .client
        .get(&server.url("/group/cats/outbox"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outbox["totalItems"], 1);
    assert_eq!(outbox["orderedItems"][0]["object"], note_id);
}

#[tokio::test]
async fn test_non_member_post_is_dropped() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    let group = server.create_group("cats").await;
    let group_url = server.url("/group/cats");
    let bob = remote.add_actor("bob");

    let create = create_note(&remote, &bob, "/notes/2", &group_url);
    let response = server.post_signed("/inbox", &bob, &create).await;
    assert_eq!(response.status(), 202);
    server.settle().await;

    assert_eq!(server.state.db.count_boosts(&group.id).await.unwrap(), 0);
    assert!(remote.posts().is_empty());
}

#[tokio::test]
async fn test_group_message_reaches_members() {
    let server = TestServer::new().await;
    let remote = FakeInstance::start().await;
    server.create_group("cats").await;
    let group_url = server.url("/group/cats");
    let alice = remote.add_actor("alice");
    join_group(&server, &remote, &alice, &group_url).await;

    let (note, results) = server
        .state
        .group_service()
        .post_message("cats", "Meeting at noon")
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    let creates = remote.posts_to("/inbox");
    assert_eq!(creates.len(), 1);
    let create = creates[0].json();
    assert_eq!(create["type"], "Create");
    assert_eq!(create["object"]["attributedTo"], group_url);

    // The note is dereferenceable by remote servers
    let object: Value = server
        .client
        .get(&server.url(&format!("/note/{}", note.id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(object["type"], "Note");
    assert_eq!(object["attributedTo"], group_url);
}
