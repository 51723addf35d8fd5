//! E2E tests for WebFinger and the group actor surface

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_resolves_group() {
    let server = TestServer::new().await;
    server.create_group("cats").await;

    let response = server
        .client
        .get(&server.url(&format!(
            "/.well-known/webfinger?resource=acct:cats@{}",
            server.authority
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/jrd+json"
    );
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], format!("acct:cats@{}", server.authority));

    let links = json["links"].as_array().unwrap();
    let self_link = links.iter().find(|link| link["rel"] == "self").unwrap();
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], server.url("/group/cats"));
}

#[tokio::test]
async fn test_webfinger_unknown_group_or_domain() {
    let server = TestServer::new().await;
    server.create_group("cats").await;

    let unknown_group = server
        .client
        .get(&server.url(&format!(
            "/.well-known/webfinger?resource=acct:dogs@{}",
            server.authority
        )))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown_group.status(), 404);

    let foreign_domain = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:cats@elsewhere.example"))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign_domain.status(), 404);

    let malformed = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:cats"))
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), 400);
}

#[tokio::test]
async fn test_group_actor_document() {
    let server = TestServer::new().await;
    let group = server.create_group("cats").await;

    let response = server
        .client
        .get(&server.url("/group/cats"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/activity+json"
    );
    let actor: Value = response.json().await.unwrap();
    assert_eq!(actor["type"], "Group");
    assert_eq!(actor["id"], server.url("/group/cats"));
    assert_eq!(actor["preferredUsername"], "cats");
    assert_eq!(actor["inbox"], server.url("/group/cats/inbox"));
    assert_eq!(actor["endpoints"]["sharedInbox"], server.url("/inbox"));
    assert_eq!(actor["publicKey"]["id"], server.url("/group/cats#main-key"));
    assert_eq!(actor["publicKey"]["publicKeyPem"], group.public_key_pem);

    let missing = server
        .client
        .get(&server.url("/group/dogs"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_followers_collection_starts_empty() {
    let server = TestServer::new().await;
    server.create_group("cats").await;

    let json: Value = server
        .client
        .get(&server.url("/group/cats/followers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(json["type"], "OrderedCollection");
    assert_eq!(json["totalItems"], 0);
    assert_eq!(json["orderedItems"].as_array().unwrap().len(), 0);
}
